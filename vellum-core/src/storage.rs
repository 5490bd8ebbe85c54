// src/storage.rs
// Filesystem primitives: crash-safe full writes, durable appends and
// datafile integrity at startup.
//
// The crash-safe write protocol: fsync the parent directory, fsync the
// target if it exists, write everything to a sibling `F~` temp file,
// fsync it, rename over the target, fsync the directory again. A bare
// `F~` found at startup is a write that crashed between temp-write and
// rename, and is promoted to `F`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::log_debug;

/// The crash-safe temporary sibling of a file (`F` -> `F~`)
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("~");
    path.with_file_name(name)
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Create the parent directory chain of the datafile
pub fn ensure_directory_exists(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Read the whole datafile. Invalid UTF-8 degrades into corrupt lines
/// rather than aborting the load.
pub fn read_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Append to the log and flush it to storage
pub fn append_file(path: &Path, data: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// fsync a directory; a no-op on platforms that cannot fsync
/// directories
#[cfg(unix)]
pub fn flush_directory(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn flush_directory(_dir: &Path) -> Result<()> {
    Ok(())
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
        Some(p) => p.to_path_buf(),
        None => PathBuf::from("."),
    }
}

/// Fully write `data` to `path` so that a crash at any step leaves
/// either the old or the new content on disk
pub fn crash_safe_write_file(path: &Path, data: &str) -> Result<()> {
    let dir = parent_of(path);
    let temp = temp_path(path);

    flush_directory(&dir)?;
    if exists(path) {
        File::open(path)?.sync_all()?;
    }

    let mut file = File::create(&temp)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    flush_directory(&dir)?;
    Ok(())
}

/// Make sure the datafile exists and reflects the last complete write:
/// promote a leftover temp file if the rename never happened, create
/// an empty file otherwise.
pub fn ensure_datafile_integrity(path: &Path) -> Result<()> {
    if exists(path) {
        return Ok(());
    }
    let temp = temp_path(path);
    if exists(&temp) {
        log_debug!("promoting leftover temp file {:?}", temp);
        fs::rename(&temp, path)?;
        return Ok(());
    }
    fs::write(path, "")?;
    Ok(())
}
