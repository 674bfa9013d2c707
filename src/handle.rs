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

//! `FileHandle`: per-open-file state — the mapped view, tracked length,
//! owning process id, redo-log list, data fd and advisory lock.

use crate::error::{io_error, TxFsError, TxFsResult};
use crate::record::WriteRecord;
use memmap2::MmapMut;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

struct FileHandleState {
    path: PathBuf,
    log_path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
    /// Tracked length, persisted across `Close` so a later `Open` can still
    /// reject a shorter `requested_length` with `WouldTruncate`. While open,
    /// this equals the physical capacity of the mapping: a `Write` may only
    /// push past the handle's *previous* high-water mark within that
    /// capacity, it cannot grow the capacity itself.
    mapped_length: u64,
    /// 0 while closed, the owning process id while open.
    owning_pid: u32,
    pending_writes: VecDeque<WriteRecord>,
}

/// A handle to one open, managed byte file.
///
/// Cheap to clone: clones share the same underlying state (an `Arc`), the
/// way `Self::clone` is used internally to hand the same handle to multiple
/// `WriteRecord`s and registry entries.
#[derive(Clone)]
pub struct FileHandle(Arc<Mutex<FileHandleState>>);

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.lock().expect("FileHandle lock poisoned");
        write!(
            f,
            "FileHandle {{ path: {}, length: {}, owning_pid: {}, pending: {} }}",
            state.path.display(),
            state.mapped_length,
            state.owning_pid,
            state.pending_writes.len()
        )
    }
}

impl FileHandle {
    pub(crate) fn new_unopened(path: PathBuf, log_path: PathBuf) -> FileHandle {
        FileHandle(Arc::new(Mutex::new(FileHandleState {
            path,
            log_path,
            file: None,
            mmap: None,
            mapped_length: 0,
            owning_pid: 0,
            pending_writes: VecDeque::new(),
        })))
    }

    fn lock_state(&self) -> MutexGuard<'_, FileHandleState> {
        self.0.lock().expect("FileHandle lock poisoned")
    }

    /// Open (or re-open, after a prior `Close`) the underlying file: acquire
    /// the advisory lock, extend and map the data file, and replay any
    /// recoverable redo log onto it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn open_or_reuse(&self, requested_length: u64, verbose: bool) -> TxFsResult<()> {
        let mut state = self.lock_state();
        if state.owning_pid != 0 {
            return Err(TxFsError::Busy);
        }
        if state.mapped_length > requested_length {
            return Err(TxFsError::WouldTruncate);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&state.path)
            .map_err(io_error)?;

        crate::lock::try_acquire_exclusive(&file)?;

        let current_len = file.metadata().map_err(io_error)?.len();
        let target_len = current_len.max(requested_length);
        if target_len > current_len {
            file.set_len(target_len).map_err(io_error)?;
        }

        let mmap = if target_len == 0 {
            None
        } else {
            // SAFETY: the exclusive advisory lock acquired above guarantees
            // this process is the only one mapping the file; within a
            // process a `FileHandle` is never aliased across threads
            // without the caller's own synchronization.
            Some(unsafe { MmapMut::map_mut(&file) }.map_err(io_error)?)
        };

        state.mmap = mmap;
        state.file = Some(file);
        state.mapped_length = target_len;

        let replayed = crate::log::replay_into(&state.path, &state.log_path)?;
        state.owning_pid = std::process::id();

        if verbose {
            tracing::info!(
                path = %state.path.display(),
                length = target_len,
                replayed_frames = replayed,
                "opened file",
            );
        }
        Ok(())
    }

    /// Read a copy of `mapped_view[offset, offset+length)`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn read(&self, offset: u64, length: u64) -> TxFsResult<Vec<u8>> {
        let state = self.lock_state();
        if state.owning_pid != std::process::id() {
            return Err(TxFsError::NotOwner);
        }
        if offset > state.mapped_length {
            return Ok(Vec::new());
        }
        let end = offset.checked_add(length).ok_or(TxFsError::InvalidArgument)?;
        if end > state.mapped_length {
            return Err(TxFsError::InvalidArgument);
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        let mmap = state.mmap.as_ref().ok_or(TxFsError::NotOpen)?;
        Ok(mmap[offset as usize..end as usize].to_vec())
    }

    /// Overwrite `mapped_view[offset, offset+data.len())`, returning a
    /// `WriteRecord` the caller later `Sync`s or `Abort`s.
    #[tracing::instrument(level = "trace", skip(self, data))]
    pub fn write(&self, offset: u64, data: &[u8]) -> TxFsResult<WriteRecord> {
        let length = data.len() as u64;
        let displaced = {
            let mut state = self.lock_state();
            if state.owning_pid != std::process::id() {
                return Err(TxFsError::NotOwner);
            }
            if offset > state.mapped_length {
                return Err(TxFsError::InvalidArgument);
            }
            let end = offset.checked_add(length).ok_or(TxFsError::InvalidArgument)?;
            if end > state.mapped_length {
                return Err(TxFsError::InvalidArgument);
            }
            if length == 0 {
                Vec::new()
            } else {
                let start = offset as usize;
                let end_us = end as usize;
                let mmap = state.mmap.as_mut().ok_or(TxFsError::NotOpen)?;
                let displaced = mmap[start..end_us].to_vec();
                mmap[start..end_us].copy_from_slice(data);
                if end > state.mapped_length {
                    state.mapped_length = end;
                }
                displaced
            }
        };
        let record = WriteRecord::new(self.clone(), offset, data, displaced);
        self.lock_state().pending_writes.push_back(record.clone());
        Ok(record)
    }

    /// Current tracked length of the file.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn get_length(&self) -> u64 {
        self.lock_state().mapped_length
    }

    /// Close the handle: persist any still-pending writes to the log (so a
    /// crash after this point can still recover them),
    /// release the advisory lock, and unmap the view.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn close(&self) -> TxFsResult<()> {
        let pending: Vec<WriteRecord> = {
            let state = self.lock_state();
            if state.owning_pid == 0 {
                return Err(TxFsError::NotOpen);
            }
            state.pending_writes.iter().cloned().collect()
        };
        for record in pending {
            record.sync()?;
        }
        let mut state = self.lock_state();
        if let Some(file) = state.file.take() {
            crate::lock::release(&file)?;
        }
        state.mmap = None;
        state.owning_pid = 0;
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock_state().owning_pid != 0
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.lock_state().path.clone()
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.lock_state().log_path.clone()
    }

    pub(crate) fn ptr_eq(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn first_pending(&self) -> Option<WriteRecord> {
        self.lock_state().pending_writes.front().cloned()
    }

    /// Clone the open data fd and the log path, for a `WriteRecord` to do
    /// its own positioned I/O without holding the handle's state lock for
    /// the duration of a (potentially slow) `fsync`.
    pub(crate) fn file_and_log_path(&self) -> TxFsResult<(File, PathBuf)> {
        let state = self.lock_state();
        let file = state.file.as_ref().ok_or(TxFsError::NotOpen)?;
        let file = file.try_clone().map_err(io_error)?;
        Ok((file, state.log_path.clone()))
    }

    /// Restore `bytes` into `mapped_view[offset, offset+bytes.len())`, used
    /// by `Abort` to revert a write's in-memory effect.
    pub(crate) fn restore_range(&self, offset: u64, bytes: &[u8]) -> TxFsResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_state();
        let mmap = state.mmap.as_mut().ok_or(TxFsError::NotOpen)?;
        let start = offset as usize;
        let end = start + bytes.len();
        mmap[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn remove_pending(&self, record: &WriteRecord) {
        let mut state = self.lock_state();
        if let Some(pos) = state.pending_writes.iter().position(|r| r.is_same(record)) {
            state.pending_writes.remove(pos);
        }
    }
}

/// Derive the redo-log path for a data file path: strip the extension and
/// append `-log.txt`.
pub(crate) fn derive_log_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}-log.txt"))
}
