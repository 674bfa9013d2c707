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

//! `DirectoryRegistry`: the process-wide, idempotent `directory -> FileSystem`
//! cache backing `FileSystem::init`.

use crate::error::{io_error, TxFsResult};
use crate::filesystem::FileSystem;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, FileSystem>>> = OnceLock::new();

#[tracing::instrument(level = "trace")]
pub(crate) fn init(directory: &Path, verbose: bool) -> TxFsResult<FileSystem> {
    let canonical = ensure_directory(directory)?;
    let mut registry = REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .expect("directory registry lock poisoned");
    if let Some(existing) = registry.get(&canonical) {
        return Ok(existing.clone());
    }
    let file_system = FileSystem::new(canonical.clone(), verbose);
    registry.insert(canonical, file_system.clone());
    Ok(file_system)
}

/// Create `directory` with mode 0755 if it does not exist, then canonicalize
/// it. Canonicalizing gives the registry a stable key regardless of how the
/// caller spelled the path (relative, `.`, trailing slash, ...).
fn ensure_directory(directory: &Path) -> TxFsResult<PathBuf> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o755);
        match builder.create(directory) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(io_error(err)),
        }
    }
    #[cfg(not(unix))]
    {
        match std::fs::create_dir(directory) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(io_error(err)),
        }
    }
    std::fs::canonicalize(directory).map_err(io_error)
}
