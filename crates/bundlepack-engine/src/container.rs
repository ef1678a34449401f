use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::error::EngineError;
use crate::fs_utils::copy_stream_with_progress;

const SECTION_MAGIC: &[u8; 4] = b"BNDL";
const SECTION_VERSION: u32 = 1;
const SECTION_TRAILER_LEN: u64 = 8;
const SECTION_ENTRY_LEN: u64 = 16;

/// Byte range of one attached container inside the engine executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedContainer {
    pub offset: u64,
    pub size: u64,
}

/// Structured header trailing the executable image:
///
/// ```text
/// "BNDL" version:u32 count:u32 (offset:u64 size:u64){count} section_len:u32 "BNDL"
/// ```
///
/// All integers are little-endian; `section_len` covers everything from the
/// leading magic through the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BundleSection {
    pub containers: Vec<AttachedContainer>,
}

impl BundleSection {
    pub fn read_from(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open engine image: {}", path.display()))?;
        let file_len = file
            .metadata()
            .with_context(|| format!("failed to stat engine image: {}", path.display()))?
            .len();
        if file_len < SECTION_TRAILER_LEN {
            return Err(anyhow!("engine image has no bundle section: {}", path.display()));
        }

        file.seek(SeekFrom::Start(file_len - SECTION_TRAILER_LEN))?;
        let mut trailer = [0_u8; 8];
        file.read_exact(&mut trailer)
            .context("failed to read bundle section trailer")?;
        if &trailer[4..8] != SECTION_MAGIC {
            return Err(anyhow!("engine image has no bundle section: {}", path.display()));
        }
        let section_len = u64::from(u32::from_le_bytes([
            trailer[0], trailer[1], trailer[2], trailer[3],
        ]));
        if section_len + SECTION_TRAILER_LEN > file_len {
            return Err(anyhow!("bundle section length exceeds engine image size"));
        }

        let section_start = file_len - SECTION_TRAILER_LEN - section_len;
        file.seek(SeekFrom::Start(section_start))?;
        let mut section = vec![0_u8; section_len as usize];
        file.read_exact(&mut section)
            .context("failed to read bundle section")?;

        Self::parse(&section, section_start)
    }

    fn parse(bytes: &[u8], section_start: u64) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != SECTION_MAGIC {
            return Err(anyhow!("malformed bundle section header"));
        }
        let version = le_u32(&bytes[4..8]);
        if version != SECTION_VERSION {
            return Err(anyhow!("unsupported bundle section version: {version}"));
        }
        let count = le_u32(&bytes[8..12]) as usize;
        let expected = 12 + count * SECTION_ENTRY_LEN as usize;
        if bytes.len() != expected {
            return Err(anyhow!(
                "bundle section declares {count} containers but is {} bytes",
                bytes.len()
            ));
        }

        let mut containers = Vec::with_capacity(count);
        for index in 0..count {
            let at = 12 + index * SECTION_ENTRY_LEN as usize;
            let offset = le_u64(&bytes[at..at + 8]);
            let size = le_u64(&bytes[at + 8..at + 16]);
            if offset.checked_add(size).map_or(true, |end| end > section_start) {
                return Err(anyhow!(
                    "attached container #{index} overlaps the bundle section"
                ));
            }
            containers.push(AttachedContainer { offset, size });
        }
        Ok(Self { containers })
    }

    pub fn container(&self, index: u32) -> Result<AttachedContainer> {
        self.containers
            .get(index as usize)
            .copied()
            .with_context(|| format!("attached container #{index} is not present"))
    }
}

/// Appends `containers` and a bundle section to the image at `path`.
pub fn attach_containers(path: &Path, containers: &[PathBuf]) -> Result<BundleSection> {
    let mut image = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open engine image: {}", path.display()))?;
    let mut offset = fs::metadata(path)
        .with_context(|| format!("failed to stat engine image: {}", path.display()))?
        .len();

    let mut section = BundleSection::default();
    for container in containers {
        let mut source = File::open(container)
            .with_context(|| format!("failed to open container: {}", container.display()))?;
        let size = io::copy(&mut source, &mut image)
            .with_context(|| format!("failed to attach container: {}", container.display()))?;
        section.containers.push(AttachedContainer { offset, size });
        offset += size;
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(SECTION_MAGIC);
    bytes.extend_from_slice(&SECTION_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(section.containers.len() as u32).to_le_bytes());
    for container in &section.containers {
        bytes.extend_from_slice(&container.offset.to_le_bytes());
        bytes.extend_from_slice(&container.size.to_le_bytes());
    }
    let section_len = bytes.len() as u32;
    bytes.extend_from_slice(&section_len.to_le_bytes());
    bytes.extend_from_slice(SECTION_MAGIC);
    image
        .write_all(&bytes)
        .with_context(|| format!("failed to write bundle section: {}", path.display()))?;
    Ok(section)
}

/// Where a container's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerSource {
    File(PathBuf),
    Attached { image: PathBuf, index: u32 },
}

/// Sequential reader over a tar container. Entries are named by payload key.
pub struct ContainerReader {
    archive: tar::Archive<io::Take<File>>,
    label: String,
}

impl ContainerReader {
    pub fn open(source: &ContainerSource) -> Result<Self> {
        match source {
            ContainerSource::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open container: {}", path.display()))?;
                let len = file
                    .metadata()
                    .with_context(|| format!("failed to stat container: {}", path.display()))?
                    .len();
                Ok(Self {
                    archive: tar::Archive::new(file.take(len)),
                    label: path.display().to_string(),
                })
            }
            ContainerSource::Attached { image, index } => {
                let section = BundleSection::read_from(image)?;
                let attached = section.container(*index)?;
                let mut file = File::open(image).with_context(|| {
                    format!("failed to open engine image: {}", image.display())
                })?;
                file.seek(SeekFrom::Start(attached.offset))
                    .context("failed to seek to attached container")?;
                debug!(
                    image = %image.display(),
                    index,
                    offset = attached.offset,
                    size = attached.size,
                    "opened attached container"
                );
                Ok(Self {
                    archive: tar::Archive::new(file.take(attached.size)),
                    label: format!("{}#{index}", image.display()),
                })
            }
        }
    }

    /// Streams every entry whose name is a key of `wanted` to the mapped
    /// destination. Entries nobody asked for are skipped. `progress` receives
    /// `(entry, bytes_done, bytes_total)` and returns `false` to cancel.
    pub fn extract<F>(
        &mut self,
        wanted: &HashMap<String, PathBuf>,
        mut progress: F,
    ) -> Result<Vec<String>>
    where
        F: FnMut(&str, u64, u64) -> bool,
    {
        let mut extracted = Vec::new();
        let entries = self
            .archive
            .entries()
            .with_context(|| format!("failed to read container entries: {}", self.label))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("corrupt container entry in {}", self.label))?;
            let name = entry
                .path()
                .with_context(|| format!("invalid entry name in {}", self.label))?
                .to_string_lossy()
                .replace('\\', "/");
            let Some(destination) = wanted.get(&name) else {
                debug!(container = %self.label, entry = %name, "skipping unrequested entry");
                continue;
            };

            let total = entry.header().size().unwrap_or(0);
            copy_stream_with_progress(entry, destination, total, |done, total| {
                progress(&name, done, total)
            })
            .with_context(|| format!("failed to extract '{name}' from {}", self.label))?;
            extracted.push(name);
        }

        if let Some(missing) = wanted.keys().find(|key| !extracted.contains(key)) {
            return Err(EngineError::Acquire {
                artifact: missing.clone(),
                reason: format!("entry not present in container {}", self.label),
            }
            .into());
        }
        Ok(extracted)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Builds a tar container from `(entry name, bytes)` pairs.
pub fn write_container(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut builder = tar::Builder::new(file);
    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *bytes)
            .with_context(|| format!("failed to append '{name}' to {}", path.display()))?;
    }
    builder
        .into_inner()
        .with_context(|| format!("failed to finish container {}", path.display()))?
        .flush()
        .with_context(|| format!("failed to flush container {}", path.display()))?;
    Ok(())
}
