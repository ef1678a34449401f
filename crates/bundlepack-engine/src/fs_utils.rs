use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::EngineError;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Moves `src` to `dst`, replacing `dst`, falling back to copy + delete when
/// the rename crosses filesystems.
pub fn move_file_or_copy(src: &Path, dst: &Path) -> Result<()> {
    ensure_parent_dir(dst)?;
    remove_file_if_exists(dst)
        .with_context(|| format!("failed to replace existing file: {}", dst.display()))?;

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst).with_context(|| {
                format!("failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_file(src)
                .with_context(|| format!("failed to remove moved file: {}", src.display()))?;
            Ok(())
        }
    }
}

/// Streams `reader` into `dst`, reporting `(bytes_done, bytes_total)` after
/// every chunk. The callback returns `false` to cancel the copy.
pub fn copy_stream_with_progress<R, F>(
    mut reader: R,
    dst: &Path,
    total: u64,
    mut progress: F,
) -> Result<u64>
where
    R: Read,
    F: FnMut(u64, u64) -> bool,
{
    ensure_parent_dir(dst)?;
    let mut file =
        File::create(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let mut buffer = vec![0_u8; COPY_BUFFER_SIZE];
    let mut done = 0_u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed to read source stream")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", dst.display()))?;
        done += read as u64;
        if !progress(done, total) {
            drop(file);
            let _ = fs::remove_file(dst);
            return Err(EngineError::UserCancelled.into());
        }
    }
    file.flush()
        .with_context(|| format!("failed to flush {}", dst.display()))?;
    Ok(done)
}

pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
}
