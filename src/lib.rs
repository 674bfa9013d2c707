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

//! Crash-consistent, log-backed transactional byte files over a single host
//! directory.
//!
//! A [`FileSystem`] manages fixed-size byte files inside one directory.
//! Opening a file ([`FileSystem::open`]) memory-maps it for in-process
//! reads and writes; every [`FileHandle::write`] returns a [`WriteRecord`]
//! that the caller drives to durability with [`WriteRecord::sync`] (or
//! reverts with [`WriteRecord::abort`]) before the library will consider it
//! safe to drop. Durability is carried by a per-file redo log rather than
//! relying on the data file's own buffered-write ordering; a crash between
//! a write and its `sync` is recovered the next time the file is opened.

#![warn(
    clippy::cargo,
    missing_docs,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![allow(
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc
)]

mod error;
mod filesystem;
mod handle;
mod lock;
mod log;
mod record;
mod registry;

pub use self::error::{TxFsError, TxFsResult};
pub use self::filesystem::FileSystem;
pub use self::handle::FileHandle;
pub use self::record::{SyncState, WriteRecord};
