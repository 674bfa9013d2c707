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

//! `LogEngine` and `RecoveryDriver`: the redo log for one data file.
//!
//! On-disk frame format (little-endian, no separators between frames):
//!
//! ```text
//! [8 bytes: offset   (u64)]
//! [8 bytes: length   (u64)]
//! [N bytes: payload]
//! [4 bytes: crc32 of the preceding (16 + N) bytes]
//! ```
//!
//! A partial trailing frame — one whose header or payload is cut short by a
//! crash mid-append — is treated as torn and ignored; recovery stops at the
//! first invalid frame and treats every frame before it as authoritative.

use crate::error::{io_error, TxFsResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const HEADER_LEN: usize = 16; // 8 (offset) + 8 (length)
const CRC_LEN: usize = 4;

/// One decoded, CRC-verified redo frame.
#[derive(Debug, Clone)]
pub(crate) struct LogFrame {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Append one redo frame to the log at `log_path`, creating the file if absent.
///
/// `fsync`s the log file before returning, per the ordering contract: the
/// log must be durable before a `WriteRecord` may be considered synced.
#[tracing::instrument(level = "trace", skip(payload))]
pub(crate) fn append_frame(log_path: &Path, offset: u64, payload: &[u8]) -> TxFsResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(io_error)?;
    let frame = encode_frame(offset, payload);
    file.write_all(&frame).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    Ok(())
}

/// Build the on-disk byte representation of one frame.
fn encode_frame(offset: u64, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u64;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Truncate the log to zero length and recreate it empty.
///
/// Uses `unlink` then `create` rather than `ftruncate`, so that
/// a crash between the two leaves "no log" (recovery sees this as "nothing
/// to replay", which is correct because the caller only truncates once every
/// pending write has already reached the data file).
#[tracing::instrument(level = "trace")]
pub(crate) fn truncate_and_recreate(log_path: &Path) -> TxFsResult<()> {
    if log_path.exists() {
        std::fs::remove_file(log_path).map_err(io_error)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(log_path)
        .map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    if let Some(parent) = log_path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

/// `fsync` the directory itself, so the unlink/create of the log file is
/// durable as a directory-entry change, not just as file content.
fn sync_directory(dir: &Path) -> TxFsResult<()> {
    let dir_file = File::open(dir).map_err(io_error)?;
    dir_file.sync_all().map_err(io_error)?;
    Ok(())
}

/// Read every valid frame from `log_path` in order, stopping at the first
/// frame whose CRC fails or whose length overflows the remaining bytes.
///
/// Returns an empty vector if the log doesn't exist or is empty.
#[tracing::instrument(level = "trace")]
pub(crate) fn read_valid_frames(log_path: &Path) -> TxFsResult<Vec<LogFrame>> {
    let mut frames = Vec::new();
    let mut file = match File::open(log_path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(frames),
        Err(err) => return Err(io_error(err)),
    };
    let file_len = file.metadata().map_err(io_error)?.len();
    let mut pos: u64 = 0;
    loop {
        if pos + HEADER_LEN as u64 + CRC_LEN as u64 > file_len {
            break; // torn header, nothing more to replay
        }
        file.seek(SeekFrom::Start(pos)).map_err(io_error)?;
        let mut header = [0u8; HEADER_LEN];
        if file.read_exact(&mut header).is_err() {
            break;
        }
        let offset = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let length = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let frame_len = HEADER_LEN as u64 + length + CRC_LEN as u64;
        if pos + frame_len > file_len {
            break; // torn payload/crc tail
        }
        let mut payload = vec![0u8; length as usize];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut crc_bytes = [0u8; CRC_LEN];
        if file.read_exact(&mut crc_bytes).is_err() {
            break;
        }
        let expected_crc = u32::from_le_bytes(crc_bytes);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            break; // corrupt frame: stop, prior frames remain authoritative
        }
        frames.push(LogFrame { offset, payload });
        pos += frame_len;
    }
    Ok(frames)
}

/// Replay every valid frame in `log_path` onto the data file at `data_path`,
/// then `fsync` the data file. The log itself is left untouched — it remains
/// the source of truth until the next `Cleanup`.
#[tracing::instrument(level = "trace")]
pub(crate) fn replay_into(data_path: &Path, log_path: &Path) -> TxFsResult<usize> {
    let frames = read_valid_frames(log_path)?;
    if frames.is_empty() {
        return Ok(0);
    }
    let mut data_file = OpenOptions::new()
        .write(true)
        .open(data_path)
        .map_err(io_error)?;
    for frame in &frames {
        data_file
            .seek(SeekFrom::Start(frame.offset))
            .map_err(io_error)?;
        data_file.write_all(&frame.payload).map_err(io_error)?;
    }
    data_file.sync_all().map_err(io_error)?;
    Ok(frames.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "txfs-log-test-{name}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Time went backwards")
                .as_nanos()
        ))
    }

    #[test]
    fn append_then_read_round_trips() {
        let log_path = scratch_path("append");
        append_frame(&log_path, 10, b"hello").unwrap();
        append_frame(&log_path, 20, b"world!").unwrap();

        let frames = read_valid_frames(&log_path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].offset, 10);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[1].offset, 20);
        assert_eq!(frames[1].payload, b"world!");

        std::fs::remove_file(&log_path).unwrap();
    }

    #[test]
    fn torn_tail_frame_is_ignored() {
        let log_path = scratch_path("torn");
        append_frame(&log_path, 0, b"good frame").unwrap();
        // simulate a crash mid-append: chop off the last few bytes of a second frame
        let mut good_len = std::fs::metadata(&log_path).unwrap().len();
        append_frame(&log_path, 10, b"second frame payload").unwrap();
        let full_len = std::fs::metadata(&log_path).unwrap().len();
        good_len += 5; // leave a few torn bytes of the second frame's header
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(good_len).unwrap();
        assert!(good_len < full_len);

        let frames = read_valid_frames(&log_path).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"good frame");

        std::fs::remove_file(&log_path).unwrap();
    }

    #[test]
    fn missing_log_yields_no_frames() {
        let log_path = scratch_path("missing");
        let frames = read_valid_frames(&log_path).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn truncate_and_recreate_leaves_an_empty_file() {
        let log_path = scratch_path("truncate");
        append_frame(&log_path, 0, b"data").unwrap();
        assert!(std::fs::metadata(&log_path).unwrap().len() > 0);

        truncate_and_recreate(&log_path).unwrap();
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

        std::fs::remove_file(&log_path).unwrap();
    }
}
