use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::process::ProcessRunner;

const UNINSTALL_KEYS: &[&str] = &[
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
];
const PATCHES_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Installer\UserData\S-1-5-18\Products";
const HOTFIX_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\HotFix";
const PACKAGES_KEY: &str =
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Component Based Servicing\Packages";

/// Answers the presence questions package drivers ask during Detect.
pub trait SystemProbe: Send + Sync {
    fn product_installed(&self, product_code: &str) -> Result<bool>;
    fn patch_applied(&self, patch_code: &str, target_product_codes: &[String]) -> Result<bool>;
    fn update_installed(&self, kb: &str) -> Result<bool>;
}

/// Probe backed by `reg query`. Every question answers `false` on hosts
/// without a Windows registry.
pub struct RegistryProbe {
    runner: Arc<dyn ProcessRunner>,
}

impl RegistryProbe {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    fn key_exists(&self, path: &str) -> Result<bool> {
        let mut command = Command::new("reg");
        command.arg("query").arg(path);
        let output = self.runner.run(&mut command)?;
        debug!(key = path, code = output.code, "queried registry key");
        Ok(output.code == 0)
    }

    fn query_recursive(&self, path: &str, needle: &str) -> Result<bool> {
        let mut command = Command::new("reg");
        command.arg("query").arg(path).arg("/s").arg("/f").arg(needle);
        let output = self.runner.run(&mut command)?;
        if output.code != 0 {
            return Ok(false);
        }
        let needle = needle.to_ascii_uppercase();
        Ok(output
            .stdout
            .lines()
            .any(|line| line.to_ascii_uppercase().contains(&needle)))
    }
}

impl SystemProbe for RegistryProbe {
    fn product_installed(&self, product_code: &str) -> Result<bool> {
        if !cfg!(windows) {
            return Ok(false);
        }
        for root in UNINSTALL_KEYS {
            if self.key_exists(&format!(r"{root}\{product_code}"))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn patch_applied(&self, patch_code: &str, target_product_codes: &[String]) -> Result<bool> {
        if !cfg!(windows) {
            return Ok(false);
        }
        let packed_patch = packed_guid(patch_code)?;
        if target_product_codes.is_empty() {
            return self.query_recursive(PATCHES_KEY, &packed_patch);
        }
        for product in target_product_codes {
            let packed_product = packed_guid(product)?;
            let key = format!(r"{PATCHES_KEY}\{packed_product}\Patches\{packed_patch}");
            if self.key_exists(&key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn update_installed(&self, kb: &str) -> Result<bool> {
        if !cfg!(windows) {
            return Ok(false);
        }
        let kb = normalize_kb(kb);
        if self.query_recursive(HOTFIX_KEY, &kb)? {
            return Ok(true);
        }
        self.query_recursive(PACKAGES_KEY, &kb)
    }
}

/// Product and patch codes are stored under the installer's registry keys in
/// "packed" form: the first three groups reversed whole, the remaining bytes
/// nibble-swapped, braces and dashes removed.
pub fn packed_guid(guid: &str) -> Result<String> {
    let hex: String = guid
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .chars()
        .filter(|ch| *ch != '-')
        .collect();
    if hex.len() != 32 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid GUID: {guid}"));
    }
    let hex = hex.to_ascii_uppercase();

    let mut packed = String::with_capacity(32);
    packed.extend(hex[0..8].chars().rev());
    packed.extend(hex[8..12].chars().rev());
    packed.extend(hex[12..16].chars().rev());
    let tail = hex[16..].as_bytes();
    for pair in tail.chunks(2) {
        packed.push(pair[1] as char);
        packed.push(pair[0] as char);
    }
    Ok(packed)
}

pub fn normalize_kb(kb: &str) -> String {
    let trimmed = kb.trim();
    let digits = trimmed
        .strip_prefix("KB")
        .or_else(|| trimmed.strip_prefix("kb"))
        .unwrap_or(trimmed);
    format!("KB{digits}")
}
