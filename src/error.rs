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

/// Result Type for the transactional file system library.
pub type TxFsResult<T> = Result<T, TxFsError>;

/// Error Type for the transactional file system library.
#[derive(Debug)]
pub enum TxFsError {
    /// An underlying OS operation (open, write, fsync, mmap, unlink, truncate) failed.
    IoError(std::io::Error),
    /// Another process already holds the advisory lock on this file.
    Busy,
    /// `Open` was asked for a length shorter than the file's existing content.
    WouldTruncate,
    /// `Remove` was invoked on a handle that is still open.
    StillOpen,
    /// `Close` was invoked on a handle that is already closed.
    NotOpen,
    /// `Read`/`Write` was invoked from a process other than the one that opened the handle.
    NotOwner,
    /// An offset/length argument violated the bounds of the handle.
    InvalidArgument,
    /// `Abort` was invoked on a record that is not `pending` or `partially_synced`.
    InvalidState,
    /// A log frame failed its CRC check during recovery. Surfaced only internally;
    /// recovery stops at the first corrupt frame and treats prior frames as authoritative.
    Corrupt,
}

impl TxFsError {
    /// Wrap an OS-level error.
    #[must_use]
    pub fn io_error(err: std::io::Error) -> TxFsError {
        TxFsError::IoError(err)
    }
}

impl std::fmt::Display for TxFsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for TxFsError {}

impl From<std::io::Error> for TxFsError {
    fn from(err: std::io::Error) -> Self {
        TxFsError::IoError(err)
    }
}

/// Map a generic IO error to a `TxFsError`, without special-casing it as `Busy`.
/// Used everywhere except lock acquisition, which has its own mapping (see `lock.rs`).
pub(crate) fn io_error(error: std::io::Error) -> TxFsError {
    TxFsError::IoError(error)
}
