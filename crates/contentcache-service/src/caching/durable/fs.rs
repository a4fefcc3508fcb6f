use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::Config;

use super::{DurableStore, KeyScan};

/// Version of the on-disk layout, used as the top-level directory.
const LAYOUT_VERSION: u32 = 1;

/// Where records live, relative to the `cache_dir`.
const STORE_DIR: &str = "store";
/// Where records are written before they are moved into place, relative to the `cache_dir`.
const TMP_DIR: &str = "tmp";

/// A [`DurableStore`] keeping one file per key in a directory.
///
/// Files are addressed by the sha256 of their key, spread out over a couple of directory
/// levels: `v1/aa/bbccdd/eeff...`. As the key cannot be recovered from the hash, each file
/// starts with a header line holding the JSON-encoded key, followed by the raw record.
///
/// New records are written into a temporary file first and then atomically moved into place,
/// so readers never observe a partially written record.
#[derive(Debug)]
pub struct FsDurableStore {
    root: PathBuf,
    tmp_dir: PathBuf,
}

impl FsDurableStore {
    /// Opens the store at `root`, using `tmp_dir` for in-progress writes.
    ///
    /// Both directories are created if necessary and must be on the same filesystem. Other
    /// processes may use the same directories at the same time, so leftovers in `tmp_dir` are
    /// left alone here, see [`clear_tmp`].
    pub fn open(root: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let tmp_dir = tmp_dir.into();

        fs::create_dir_all(&tmp_dir)?;
        fs::create_dir_all(&root)?;

        Ok(Self { root, tmp_dir })
    }

    /// Opens the store configured by `config`, if a `cache_dir` is set.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match (config.cache_dir(STORE_DIR), config.cache_dir(TMP_DIR)) {
            (Some(root), Some(tmp_dir)) => Self::open(root, tmp_dir).map(Some),
            _ => Ok(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(hashed_path(key))
    }

    /// Create a new temporary file to write a record into.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A sweep may remove the directories we are operating in, hence the retries.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(path = %self.tmp_dir.display(), "Failed to create tmp directory: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(path = %self.tmp_dir.display(), "Failed to create tmp file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Removes now empty directories between `path` and the store root.
    fn prune_parents(&self, path: &Path) {
        for dir in path.ancestors().skip(1) {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // fails for non-empty directories, which is where we stop
            if fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }

    fn collect_keys(&self, directory: &Path, scan: &mut KeyScan) -> io::Result<()> {
        let Some(entries) = catch_not_found(|| fs::read_dir(directory))? else {
            return Ok(());
        };

        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::error!(path = %directory.display(), "Failed to list durable records: {:?}", e);
                    scan.failed += 1;
                    continue;
                }
            };

            if path.is_dir() {
                // One unreadable directory must not hide the records in all the others.
                if let Err(e) = self.collect_keys(&path, scan) {
                    tracing::error!(path = %path.display(), "Failed to list durable records: {:?}", e);
                    scan.failed += 1;
                }
                continue;
            }

            match catch_not_found(|| read_header(&path)) {
                Ok(Some(key)) => scan.keys.push(key),
                // removed concurrently
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    // Without a readable header the record can never be addressed again.
                    tracing::warn!(path = %path.display(), "Removing durable record without key header");
                    if let Err(e) = catch_not_found(|| fs::remove_file(&path)) {
                        tracing::error!(path = %path.display(), "Failed to remove durable record: {:?}", e);
                    }
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to read durable record: {:?}", e);
                    scan.failed += 1;
                }
            }
        }
        Ok(())
    }
}

impl DurableStore for FsDurableStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.record_path(key);
        let Some(mut file) = catch_not_found(|| File::open(&path))? else {
            return Ok(None);
        };
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let (stored_key, record) = split_header(&contents)?;
        if stored_key != key {
            // Different key with the same hash. Astronomically unlikely, but not our record.
            return Ok(None);
        }
        Ok(Some(record.to_vec()))
    }

    fn set(&self, key: &str, record: &[u8]) -> io::Result<()> {
        let path = self.record_path(key);
        let mut temp_file = self.tempfile()?;

        let header = serde_json::to_string(key).map_err(io::Error::other)?;
        temp_file.write_all(header.as_bytes())?;
        temp_file.write_all(b"\n")?;
        temp_file.write_all(record)?;
        temp_file.flush()?;

        tracing::trace!(key, path = %path.display(), "Writing durable record");
        persist_tempfile(temp_file, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let path = self.record_path(key);
        if catch_not_found(|| fs::remove_file(&path))?.is_some() {
            self.prune_parents(&path);
        }
        Ok(())
    }

    fn remove_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> io::Result<Option<bool>> {
        let path = self.record_path(key);

        // The record is moved out of place before it is inspected. A write that happens in
        // the meantime creates a new file at `path`, which is never touched below.
        let claimed = self.tempfile()?.into_temp_path();
        if catch_not_found(|| fs::rename(&path, &claimed))?.is_none() {
            return Ok(None);
        }

        let remove = match fs::read(&claimed) {
            Ok(contents) => match split_header(&contents) {
                Ok((stored_key, record)) => stored_key == key && predicate(record),
                // not addressable by any key
                Err(_) => true,
            },
            Err(e) => {
                restore_claimed(&claimed, &path)?;
                return Err(e);
            }
        };

        if remove {
            tracing::trace!(key, path = %path.display(), "Removing durable record");
            claimed.close()?;
            self.prune_parents(&path);
        } else {
            restore_claimed(&claimed, &path)?;
        }
        Ok(Some(remove))
    }

    fn keys(&self) -> io::Result<KeyScan> {
        let mut scan = KeyScan::default();
        self.collect_keys(&self.root, &mut scan)?;
        Ok(scan)
    }
}

/// Puts a record claimed by `remove_if` back in place, unless it has been replaced already.
fn restore_claimed(claimed: &Path, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::hard_link(claimed, path) {
        // a newer record was written while this one was claimed
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        result => result,
    }
}

/// Clears the temporary directory of the configured `cache_dir`.
///
/// Removes files left over by a crashed process. Must only be called while no other process
/// writes into the same `cache_dir`.
pub fn clear_tmp(config: &Config) -> io::Result<()> {
    if let Some(ref tmp) = config.cache_dir(TMP_DIR) {
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        fs::create_dir_all(tmp)?;
    }
    Ok(())
}

/// Returns the relative path for a key.
///
/// The relative path is a sha-256 hash hex-formatted like so:
/// `v$version/aa/bbccdd/eeff...`
fn hashed_path(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    format!(
        "v{LAYOUT_VERSION}/{}/{}/{}",
        hex::encode(&hash[..1]),
        hex::encode(&hash[1..4]),
        hex::encode(&hash[4..]),
    )
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Splits a record file into its key header and the record itself.
fn split_header(contents: &[u8]) -> io::Result<(String, &[u8])> {
    let newline = contents
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| invalid_data("missing key header"))?;
    let key = serde_json::from_slice(&contents[..newline])
        .map_err(|_| invalid_data("malformed key header"))?;
    Ok((key, &contents[newline + 1..]))
}

/// Reads only the key header of a record file.
fn read_header(path: &Path) -> io::Result<String> {
    let mut line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut line)?;
    if !line.ends_with('\n') {
        return Err(invalid_data("missing key header"));
    }
    serde_json::from_str(line.trim_end()).map_err(|_| invalid_data("malformed key header"))
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist record"))?;

    // A concurrent removal may prune the parent directories, hence the retries.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create record directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                tracing::error!(path = %path.display(), "Failed to persist record: {:?}", e.error);
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
