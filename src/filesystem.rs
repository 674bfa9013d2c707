//
// Copyright 2024 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! `FileSystem`: the per-directory registry of open `FileHandle`s, and the
//! `Open`/`Cleanup`/`Remove` operations that act on it.

use crate::error::{io_error, TxFsError, TxFsResult};
use crate::handle::{derive_log_path, FileHandle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct Inner {
    directory_path: PathBuf,
    verbose: bool,
    // Insertion-ordered: `Cleanup` must iterate files in registration order
    // so this is a Vec rather than a HashMap, not a HashMap keyed by name.
    files: Mutex<Vec<(String, FileHandle)>>,
}

/// A managed directory of transactional byte files.
///
/// One `FileSystem` exists per canonicalized directory path for the
/// lifetime of the process; obtain it through [`FileSystem::init`], which
/// returns the same instance for the same directory on every call.
///
/// ```rust
/// use txfs::FileSystem;
///
/// let dir = std::env::temp_dir().join("txfs-doctest-ledger");
/// let fs = FileSystem::init(&dir, false).expect("init");
///
/// let handle = fs.open("ledger.dat", 64).expect("open");
/// let record = handle.write(0, b"hello, ledger!!!").expect("write");
/// record.sync().expect("sync");
///
/// assert_eq!(&handle.read(0, 16).unwrap(), b"hello, ledger!!!");
///
/// fs.close(&handle).unwrap();
/// # std::fs::remove_dir_all(&dir).ok();
/// ```
#[derive(Clone)]
pub struct FileSystem(Arc<Inner>);

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileSystem({})", self.0.directory_path.display())
    }
}

impl FileSystem {
    pub(crate) fn new(directory_path: PathBuf, verbose: bool) -> FileSystem {
        FileSystem(Arc::new(Inner {
            directory_path,
            verbose,
            files: Mutex::new(Vec::new()),
        }))
    }

    /// Obtain the `FileSystem` for `directory`, creating the directory
    /// (mode 0755) if it does not already exist. Idempotent: calling this
    /// twice with the same (canonicalized) path returns the same instance.
    #[tracing::instrument(level = "trace")]
    pub fn init<P: AsRef<Path> + std::fmt::Debug>(directory: P, verbose: bool) -> TxFsResult<FileSystem> {
        crate::registry::init(directory.as_ref(), verbose)
    }

    /// The directory this file system manages.
    #[must_use]
    pub fn directory_path(&self) -> &Path {
        &self.0.directory_path
    }

    /// Open `filename`, creating it if absent, extending it to
    /// `requested_length` if it is currently shorter.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn open(&self, filename: &str, requested_length: u64) -> TxFsResult<FileHandle> {
        let existing = {
            let files = self.0.files.lock().expect("FileSystem files lock poisoned");
            files.iter().find(|(name, _)| name == filename).map(|(_, h)| h.clone())
        };
        match existing {
            Some(handle) => {
                handle.open_or_reuse(requested_length, self.0.verbose)?;
                Ok(handle)
            }
            None => {
                let path = self.0.directory_path.join(filename);
                let log_path = derive_log_path(&path);
                let handle = FileHandle::new_unopened(path, log_path);
                handle.open_or_reuse(requested_length, self.0.verbose)?;
                let mut files = self.0.files.lock().expect("FileSystem files lock poisoned");
                files.push((filename.to_string(), handle.clone()));
                Ok(handle)
            }
        }
    }

    /// Close `handle`.
    #[tracing::instrument(level = "trace", skip(self, handle))]
    pub fn close(&self, handle: &FileHandle) -> TxFsResult<()> {
        handle.close()
    }

    /// Flush every pending `WriteRecord` across every managed file to its
    /// log, then truncate each log.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn cleanup(&self) -> TxFsResult<()> {
        self.cleanup_inner(None)?;
        Ok(())
    }

    /// As `cleanup`, but stop once `budget_bytes` bytes of pending payload
    /// have been synced. A record interrupted mid-flush is left
    /// `partially_synced` with its remaining tail still pending.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn cleanup_bounded(&self, budget_bytes: u64) -> TxFsResult<u64> {
        self.cleanup_inner(Some(budget_bytes))
    }

    fn cleanup_inner(&self, budget: Option<u64>) -> TxFsResult<u64> {
        let handles: Vec<FileHandle> = {
            let files = self.0.files.lock().expect("FileSystem files lock poisoned");
            files.iter().map(|(_, h)| h.clone()).collect()
        };
        let mut remaining = budget;
        let mut reclaimed: u64 = 0;
        for handle in handles {
            loop {
                if remaining == Some(0) {
                    return Ok(reclaimed);
                }
                let Some(record) = handle.first_pending() else {
                    break;
                };
                let synced = match remaining {
                    None => record.sync()?,
                    Some(budget_left) => {
                        let to_sync = record.remaining_len().min(budget_left);
                        record.sync_bounded(to_sync)?
                    }
                };
                reclaimed += synced;
                if let Some(budget_left) = remaining.as_mut() {
                    *budget_left -= synced;
                }
                if !record.is_fully_synced() {
                    return Ok(reclaimed);
                }
            }
            crate::log::truncate_and_recreate(&handle.log_path())?;
        }
        if self.0.verbose {
            tracing::info!(reclaimed, "cleanup reclaimed bytes");
        }
        Ok(reclaimed)
    }

    /// Remove `handle`'s data and log files. Fails with `StillOpen` unless
    /// the handle is closed.
    #[tracing::instrument(level = "trace", skip(self, handle))]
    pub fn remove(&self, handle: &FileHandle) -> TxFsResult<()> {
        if handle.is_open() {
            return Err(TxFsError::StillOpen);
        }
        let path = handle.path();
        let log_path = handle.log_path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(io_error)?;
        }
        if log_path.exists() {
            std::fs::remove_file(&log_path).map_err(io_error)?;
        }
        let mut files = self.0.files.lock().expect("FileSystem files lock poisoned");
        files.retain(|(_, h)| !h.ptr_eq(handle));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_nanos();
        std::env::temp_dir().join(format!("txfs-fs-test-{name}-{nanos}"))
    }

    #[test]
    #[tracing_test::traced_test]
    fn open_write_sync_close_reopen_read() {
        let dir = scratch_dir("roundtrip");
        let fs = FileSystem::new(dir.clone(), false);

        let filename = "records.dat";
        {
            let handle = fs.open(filename, 16).unwrap();
            assert_eq!(handle.get_length(), 16);

            let record = handle.write(0, b"Hello, World!!!!").unwrap();
            record.sync().unwrap();
            fs.close(&handle).unwrap();
        }
        {
            let handle = fs.open(filename, 16).unwrap();
            let data = handle.read(0, 16).unwrap();
            assert_eq!(&data, b"Hello, World!!!!");
            fs.close(&handle).unwrap();
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    #[tracing_test::traced_test]
    fn cleanup_truncates_the_log_after_already_synced_writes() {
        let dir = scratch_dir("log-truncation");
        let fs = FileSystem::new(dir.clone(), false);

        let handle = fs.open("t3.dat", 32).unwrap();
        handle.write(0, b"first half......").unwrap().sync().unwrap();
        handle.write(16, b"second half.....").unwrap().sync().unwrap();
        let log_path = handle.log_path();
        assert!(std::fs::metadata(&log_path).unwrap().len() > 0);

        fs.cleanup().unwrap();
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

        let data = handle.read(0, 32).unwrap();
        assert_eq!(&data[0..16], b"first half......");
        assert_eq!(&data[16..32], b"second half.....");

        fs.close(&handle).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    #[tracing_test::traced_test]
    fn cleanup_flushes_pending_writes_and_truncates_log() {
        let dir = scratch_dir("cleanup");
        let fs = FileSystem::new(dir.clone(), false);

        let handle = fs.open("a.dat", 16).unwrap();
        handle.write(0, b"uncommitted data").unwrap();
        let log_path = handle.log_path();

        fs.cleanup().unwrap();
        assert!(handle.first_pending().is_none());
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

        fs.close(&handle).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    #[tracing_test::traced_test]
    fn cleanup_bounded_stops_at_the_byte_budget() {
        let dir = scratch_dir("cleanup-bounded");
        let fs = FileSystem::new(dir.clone(), false);

        let handle = fs.open("a.dat", 16).unwrap();
        let record = handle.write(0, b"0123456789012345").unwrap();

        let reclaimed = fs.cleanup_bounded(4).unwrap();
        assert_eq!(reclaimed, 4);
        assert_eq!(record.state(), crate::record::SyncState::PartiallySynced);
        assert!(handle.first_pending().is_some());

        let reclaimed = fs.cleanup_bounded(100).unwrap();
        assert_eq!(reclaimed, 12);
        assert!(handle.first_pending().is_none());

        fs.close(&handle).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    #[tracing_test::traced_test]
    fn remove_requires_a_closed_handle() {
        let dir = scratch_dir("remove");
        let fs = FileSystem::new(dir.clone(), false);

        let handle = fs.open("a.dat", 8).unwrap();
        assert!(matches!(fs.remove(&handle), Err(TxFsError::StillOpen)));

        fs.close(&handle).unwrap();
        fs.remove(&handle).unwrap();
        assert!(!handle.path().exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    #[tracing_test::traced_test]
    fn opening_an_already_open_file_by_name_is_busy() {
        let dir = scratch_dir("busy");
        let fs = FileSystem::new(dir.clone(), false);

        let handle = fs.open("a.dat", 8).unwrap();
        assert!(matches!(fs.open("a.dat", 8), Err(TxFsError::Busy)));

        fs.close(&handle).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
