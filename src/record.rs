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

//! `WriteRecord`: the pending, undo-capable unit of work produced by
//! `FileHandle::write`.

use crate::error::{io_error, TxFsError, TxFsResult};
use crate::handle::FileHandle;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

/// Lifecycle state of a `WriteRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing has reached the log or data file yet.
    Pending,
    /// Some prefix of the write has reached the log and data file.
    PartiallySynced,
    /// The full write is durable; the record carries no buffers anymore.
    Synced,
    /// The in-memory effect was reverted; the record carries no buffers anymore.
    Aborted,
}

struct Mutable {
    new_bytes: Option<Vec<u8>>,
    displaced_bytes: Option<Vec<u8>>,
    sync_state: SyncState,
    synced_prefix: u64,
}

struct Inner {
    handle: FileHandle,
    offset: u64,
    length: u64,
    mutable: Mutex<Mutable>,
}

/// A single pending (or resolved) write against a `FileHandle`.
///
/// Cheap to clone: clones share the same state, which is how a handle's
/// pending-writes list and the caller's own copy stay in sync.
#[derive(Clone)]
pub struct WriteRecord {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WriteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
        write!(
            f,
            "WriteRecord {{ offset: {}, length: {}, state: {:?}, synced_prefix: {} }}",
            self.inner.offset, self.inner.length, m.sync_state, m.synced_prefix
        )
    }
}

impl WriteRecord {
    pub(crate) fn new(handle: FileHandle, offset: u64, data: &[u8], displaced: Vec<u8>) -> WriteRecord {
        WriteRecord {
            inner: Arc::new(Inner {
                handle,
                offset,
                length: data.len() as u64,
                mutable: Mutex::new(Mutable {
                    new_bytes: Some(data.to_vec()),
                    displaced_bytes: Some(displaced),
                    sync_state: SyncState::Pending,
                    synced_prefix: 0,
                }),
            }),
        }
    }

    /// Offset this write targets within the file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    /// Length of this write.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.inner.length
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.inner.mutable.lock().expect("WriteRecord lock poisoned").sync_state
    }

    pub(crate) fn is_same(&self, other: &WriteRecord) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_fully_synced(&self) -> bool {
        matches!(self.state(), SyncState::Synced)
    }

    pub(crate) fn remaining_len(&self) -> u64 {
        let m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
        self.inner.length - m.synced_prefix
    }

    /// Persist the entire remaining, unsynced suffix of this write.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn sync(&self) -> TxFsResult<u64> {
        let remaining = self.remaining_len();
        self.sync_bounded(remaining)
    }

    /// Persist up to `n` bytes of the remaining, unsynced suffix of this write.
    ///
    /// Steps: `pwrite` the bytes into the data file,
    /// `fsync` the data file, append a redo frame to the log and `fsync` it,
    /// then advance `synced_prefix`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn sync_bounded(&self, n: u64) -> TxFsResult<u64> {
        let prepared = {
            let mut m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
            if !matches!(m.sync_state, SyncState::Pending | SyncState::PartiallySynced) {
                return Ok(0);
            }
            let remaining = self.inner.length - m.synced_prefix;
            let to_write = n.min(remaining);
            if to_write == 0 {
                if remaining == 0 {
                    // A zero-length record (or one whose prefix already
                    // covers its length) has nothing left to flush; resolve
                    // it to `Synced` here instead of leaving it pending forever.
                    m.sync_state = SyncState::Synced;
                    m.new_bytes = None;
                    m.displaced_bytes = None;
                }
                None
            } else {
                let bytes = m
                    .new_bytes
                    .as_ref()
                    .expect("pending/partially_synced record missing new_bytes");
                let start = m.synced_prefix as usize;
                let end = start + to_write as usize;
                Some((self.inner.offset + m.synced_prefix, bytes[start..end].to_vec()))
            }
        };
        let Some((write_offset, payload)) = prepared else {
            if self.is_fully_synced() {
                self.inner.handle.remove_pending(self);
            }
            return Ok(0);
        };
        let written = payload.len() as u64;

        let (file, log_path) = self.inner.handle.file_and_log_path()?;
        file.write_at(&payload, write_offset).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        crate::log::append_frame(&log_path, write_offset, &payload)?;

        let fully_synced = {
            let mut m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
            m.synced_prefix += written;
            if m.synced_prefix >= self.inner.length {
                m.sync_state = SyncState::Synced;
                m.new_bytes = None;
                m.displaced_bytes = None;
                true
            } else {
                m.sync_state = SyncState::PartiallySynced;
                false
            }
        };
        if fully_synced {
            self.inner.handle.remove_pending(self);
        }
        Ok(written)
    }

    /// Revert the write's in-memory effect: restore `displaced_bytes` into
    /// the mapped view. Requires the record still be `pending` or
    /// `partially_synced`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn abort(&self) -> TxFsResult<()> {
        let displaced = {
            let m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
            if !matches!(m.sync_state, SyncState::Pending | SyncState::PartiallySynced) {
                return Err(TxFsError::InvalidState);
            }
            m.displaced_bytes
                .clone()
                .expect("pending/partially_synced record missing displaced_bytes")
        };
        self.inner.handle.restore_range(self.inner.offset, &displaced)?;
        {
            let mut m = self.inner.mutable.lock().expect("WriteRecord lock poisoned");
            m.sync_state = SyncState::Aborted;
            m.new_bytes = None;
            m.displaced_bytes = None;
        }
        self.inner.handle.remove_pending(self);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handle::{derive_log_path, FileHandle};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_handle(name: &str) -> (FileHandle, PathBuf, PathBuf) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("txfs-record-test-{name}-{nanos}.dat"));
        let log_path = derive_log_path(&path);
        let handle = FileHandle::new_unopened(path.clone(), log_path.clone());
        handle.open_or_reuse(32, false).unwrap();
        (handle, path, log_path)
    }

    #[test]
    #[tracing_test::traced_test]
    fn sync_persists_and_frees_buffers() {
        let (handle, path, log_path) = scratch_handle("sync");
        let record = handle.write(0, b"0123456789012345").unwrap();

        let written = record.sync().unwrap();
        assert_eq!(written, 16);
        assert_eq!(record.state(), SyncState::Synced);
        assert!(handle.first_pending().is_none());

        handle.close().unwrap();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    #[tracing_test::traced_test]
    fn sync_bounded_leaves_a_partial_record_pending() {
        let (handle, path, log_path) = scratch_handle("bounded");
        let record = handle.write(0, b"0123456789012345").unwrap();

        let written = record.sync_bounded(4).unwrap();
        assert_eq!(written, 4);
        assert_eq!(record.state(), SyncState::PartiallySynced);
        assert!(handle.first_pending().is_some());

        let rest = record.sync().unwrap();
        assert_eq!(rest, 12);
        assert_eq!(record.state(), SyncState::Synced);
        assert!(handle.first_pending().is_none());

        handle.close().unwrap();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    #[tracing_test::traced_test]
    fn abort_restores_displaced_bytes() {
        let (handle, path, log_path) = scratch_handle("abort");
        handle.write(0, b"original content").unwrap().sync().unwrap();

        let record = handle.write(0, b"clobberedbytes!!").unwrap();
        record.abort().unwrap();
        assert_eq!(record.state(), SyncState::Aborted);
        assert!(handle.first_pending().is_none());

        let data = handle.read(0, 16).unwrap();
        assert_eq!(&data, b"original content");

        handle.close().unwrap();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    #[tracing_test::traced_test]
    fn abort_after_sync_is_invalid_state() {
        let (handle, path, log_path) = scratch_handle("abort-after-sync");
        let record = handle.write(0, b"0123456789012345").unwrap();
        record.sync().unwrap();

        assert!(matches!(record.abort(), Err(TxFsError::InvalidState)));

        handle.close().unwrap();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&log_path);
    }
}
