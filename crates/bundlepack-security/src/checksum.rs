use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> bool {
    sha256_hex(bytes).eq_ignore_ascii_case(expected_hex.trim())
}

pub fn verify_sha256_reader<R: Read>(reader: R, expected_hex: &str) -> Result<bool> {
    let digest = digest_reader(reader)?;
    Ok(hex::encode(digest).eq_ignore_ascii_case(expected_hex.trim()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for sha256: {}", path.display()))?;
    verify_sha256_reader(BufReader::new(file), expected_hex)
        .with_context(|| format!("failed to hash file: {}", path.display()))
}

pub fn sha256_digest_file(path: &Path) -> Result<[u8; 32]> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for sha256: {}", path.display()))?;
    digest_reader(BufReader::new(file))
        .with_context(|| format!("failed to hash file: {}", path.display()))
}

fn digest_reader<R: Read>(mut reader: R) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).context("failed to read input")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}
