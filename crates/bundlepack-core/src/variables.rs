use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use semver::Version;

/// Layout version of the persisted variable stream. Streams written by a
/// different engine build are rejected.
pub const PERSISTED_VARIABLES_VERSION: u32 = 1;

const TAG_NUMERIC: u32 = 1;
const TAG_STRING: u32 = 2;
const TAG_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    Numeric(i64),
    String(String),
    Version(Version),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub value: VariableValue,
    pub builtin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: BTreeMap<String, Variable>,
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
            Self::Version(value) => write!(f, "{value}"),
        }
    }
}

impl VariableValue {
    /// Truthiness used by conditions: non-zero numbers and non-empty strings.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Numeric(value) => *value != 0,
            Self::String(value) => !value.is_empty(),
            Self::Version(_) => true,
        }
    }
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: VariableValue) {
        self.entries.insert(
            name.to_string(),
            Variable {
                value,
                builtin: false,
            },
        );
    }

    pub fn set_builtin(&mut self, name: &str, value: VariableValue) {
        self.entries.insert(
            name.to_string(),
            Variable {
                value,
                builtin: true,
            },
        );
    }

    pub fn set_numeric(&mut self, name: &str, value: i64) {
        self.set(name, VariableValue::Numeric(value));
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, VariableValue::String(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.entries.get(name).map(|variable| &variable.value)
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }

    pub fn get_numeric(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            VariableValue::Numeric(value) => Some(*value),
            VariableValue::String(value) => value.trim().parse().ok(),
            VariableValue::Version(_) => None,
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.entries
            .iter()
            .map(|(name, variable)| (name.as_str(), variable))
    }

    /// Encodes every non-built-in variable as a length-prefixed stream of
    /// (built-in flag, name, typed value) tuples.
    pub fn serialize_persisted(&self) -> Vec<u8> {
        let persisted = self
            .entries
            .iter()
            .filter(|(_, variable)| !variable.builtin)
            .collect::<Vec<_>>();

        let mut buffer = Vec::new();
        write_u32(&mut buffer, PERSISTED_VARIABLES_VERSION);
        write_u32(&mut buffer, persisted.len() as u32);
        for (name, variable) in persisted {
            buffer.push(u8::from(variable.builtin));
            write_string(&mut buffer, name);
            match &variable.value {
                VariableValue::Numeric(value) => {
                    write_u32(&mut buffer, TAG_NUMERIC);
                    buffer.extend_from_slice(&value.to_le_bytes());
                }
                VariableValue::String(value) => {
                    write_u32(&mut buffer, TAG_STRING);
                    write_string(&mut buffer, value);
                }
                VariableValue::Version(value) => {
                    write_u32(&mut buffer, TAG_VERSION);
                    write_string(&mut buffer, &value.to_string());
                }
            }
        }
        buffer
    }

    /// Loads a stream written by [`Variables::serialize_persisted`], replacing
    /// same-named non-built-in values. Built-in entries in the stream are
    /// skipped.
    pub fn deserialize_persisted(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.read_u32().context("missing persisted variables version")?;
        if version != PERSISTED_VARIABLES_VERSION {
            return Err(anyhow!(
                "unsupported persisted variables version: {version}"
            ));
        }

        let count = reader.read_u32().context("missing persisted variable count")?;
        let mut loaded = 0;
        for index in 0..count {
            let builtin = reader
                .read_u8()
                .with_context(|| format!("truncated persisted variable #{index}"))?
                != 0;
            let name = reader
                .read_string()
                .with_context(|| format!("invalid name for persisted variable #{index}"))?;
            let tag = reader
                .read_u32()
                .with_context(|| format!("missing type for persisted variable '{name}'"))?;
            let value = match tag {
                TAG_NUMERIC => VariableValue::Numeric(reader.read_i64()?),
                TAG_STRING => VariableValue::String(reader.read_string()?),
                TAG_VERSION => {
                    let raw = reader.read_string()?;
                    VariableValue::Version(
                        Version::parse(&raw)
                            .with_context(|| format!("invalid version for '{name}': {raw}"))?,
                    )
                }
                other => {
                    return Err(anyhow!(
                        "unsupported type {other} for persisted variable '{name}'"
                    ))
                }
            };

            if builtin
                || self
                    .entries
                    .get(&name)
                    .is_some_and(|existing| existing.builtin)
            {
                continue;
            }
            self.set(&name, value);
            loaded += 1;
        }

        if !reader.is_empty() {
            return Err(anyhow!("trailing bytes after persisted variables"));
        }
        Ok(loaded)
    }
}

fn write_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn write_string(buffer: &mut Vec<u8>, value: &str) {
    write_u32(buffer, value.len() as u32);
    buffer.extend_from_slice(value.as_bytes());
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| anyhow!("unexpected end of persisted variables"))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).context("persisted string is not valid UTF-8")
    }

    fn is_empty(&self) -> bool {
        self.offset == self.bytes.len()
    }
}
