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

//! `LockManager`: whole-file exclusive advisory locking, tying a single
//! process-exclusive writer to each open data file.

use crate::error::{io_error, TxFsError, TxFsResult};
use fs2::FileExt;
use std::fs::File;

/// Attempt to acquire the exclusive, whole-file advisory lock backing an
/// open `FileHandle`. Non-blocking: if another process already holds it,
/// returns `Busy` rather than waiting.
#[tracing::instrument(level = "trace", skip(file))]
pub(crate) fn try_acquire_exclusive(file: &File) -> TxFsResult<()> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(TxFsError::Busy),
        Err(err) => Err(io_error(err)),
    }
}

/// Release the advisory lock unconditionally. Called from `Close`; a crash
/// releases the same lock via OS file-descriptor teardown.
#[tracing::instrument(level = "trace", skip(file))]
pub(crate) fn release(file: &File) -> TxFsResult<()> {
    FileExt::unlock(file).map_err(io_error)
}
