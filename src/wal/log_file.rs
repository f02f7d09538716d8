use crate::error::ShardError;
use crate::wal::frame::{Frame, FrameError, FrameReader, FrameWriter};
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Result of scanning a log file without modifying it.
#[derive(Debug, Default)]
pub struct FrameScan {
    pub frames: Vec<Frame>,
    /// Offset of the first byte of a torn final frame, if any.
    pub truncated_at: Option<u64>,
    /// Offset of the first frame that failed its checksum, if any.
    pub corrupt_at: Option<u64>,
}

pub fn scan_frames(path: &Path) -> Result<FrameScan, ShardError> {
    let mut scan = FrameScan::default();
    if !path.exists() {
        return Ok(scan);
    }
    let mut reader = FrameReader::new(BufReader::new(File::open(path)?));
    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => scan.frames.push(frame),
            Ok(None) => break,
            Err(FrameError::Truncation) => {
                scan.truncated_at = Some(reader.offset());
                break;
            }
            Err(FrameError::Corruption) => {
                scan.corrupt_at = Some(reader.offset());
                break;
            }
            Err(FrameError::Io(message)) => {
                return Err(ShardError::Io(std::io::Error::other(message)));
            }
        }
    }
    Ok(scan)
}

/// Append-only file of frames backing one shard's oplog.
pub struct LogFile {
    writer: FrameWriter<File>,
    path: PathBuf,
    sync: bool,
    len: u64,
    /// Set when a failed append could not be cut back off the file.
    poisoned: bool,
}

fn frame_error(err: FrameError, payload_len: usize) -> ShardError {
    match err {
        FrameError::Io(message) => ShardError::Io(std::io::Error::other(message)),
        other => ShardError::Encode(format!("frame of {payload_len} bytes: {other}")),
    }
}

impl LogFile {
    /// Opens (or creates) the file and returns every intact frame. A torn tail
    /// left by a crash mid-append is cut off; a checksum failure is fatal.
    pub fn open(path: impl Into<PathBuf>, sync: bool) -> Result<(Self, Vec<Frame>), ShardError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let scan = scan_frames(&path)?;
        if let Some(offset) = scan.corrupt_at {
            return Err(ShardError::IntegrityError {
                message: format!("corrupt frame at offset {offset} in {}", path.display()),
            });
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if let Some(offset) = scan.truncated_at {
            warn!(
                path = %path.display(),
                offset,
                dropped_bytes = len.saturating_sub(offset),
                "truncating torn oplog tail"
            );
            file.set_len(offset)?;
            file.sync_all()?;
            len = offset;
        }
        Ok((
            Self {
                writer: FrameWriter::new(file),
                path,
                sync,
                len,
                poisoned: false,
            },
            scan.frames,
        ))
    }

    pub fn append(&mut self, ts_secs: u32, ts_inc: u32, kind: u8, payload: &[u8]) -> Result<(), ShardError> {
        self.append_all([(ts_secs, ts_inc, kind, payload)])
    }

    /// Appends `frames` as one unit: either all of them are in the file when
    /// this returns, or the file is cut back to its length before the call.
    pub fn append_all<'a>(
        &mut self,
        frames: impl IntoIterator<Item = (u32, u32, u8, &'a [u8])>,
    ) -> Result<(), ShardError> {
        if self.poisoned {
            return Err(ShardError::IntegrityError {
                message: format!("{} holds an unremoved partial append", self.path.display()),
            });
        }
        let start = self.len;
        let err = match self.write_frames(frames) {
            Ok(written) => {
                self.len += written;
                return Ok(());
            }
            Err(err) => err,
        };
        warn!(path = %self.path.display(), offset = start, error = %err, "removing partial oplog append");
        if let Err(cut) = self.cut_back(start) {
            self.poisoned = true;
            return Err(ShardError::IntegrityError {
                message: format!(
                    "append to {} failed ({err}) and the partial frames could not be removed: {cut}",
                    self.path.display()
                ),
            });
        }
        Err(err)
    }

    fn write_frames<'a>(
        &mut self,
        frames: impl IntoIterator<Item = (u32, u32, u8, &'a [u8])>,
    ) -> Result<u64, ShardError> {
        let mut written = 0u64;
        for (ts_secs, ts_inc, kind, payload) in frames {
            written += self
                .writer
                .append(ts_secs, ts_inc, kind, payload)
                .map_err(|e| frame_error(e, payload.len()))? as u64;
        }
        if self.sync {
            self.writer.get_mut().sync_data()?;
        }
        Ok(written)
    }

    fn cut_back(&mut self, len: u64) -> std::io::Result<()> {
        let file = self.writer.get_mut();
        file.set_len(len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{LogFile, scan_frames};
    use crate::wal::frame::{FRAME_KIND_OPLOG_ENTRY, MAX_FRAME_BODY_BYTES};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn reopen_returns_appended_frames() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("oplog.log");
        {
            let (mut log, frames) = LogFile::open(&path, true).expect("open");
            assert!(frames.is_empty());
            log.append(5, 1, FRAME_KIND_OPLOG_ENTRY, b"a").expect("append");
            log.append(5, 2, FRAME_KIND_OPLOG_ENTRY, b"b").expect("append");
        }
        let (_log, frames) = LogFile::open(&path, true).expect("reopen");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload, b"b");
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("oplog.log");
        let intact_len = {
            let (mut log, _) = LogFile::open(&path, false).expect("open");
            log.append(1, 1, FRAME_KIND_OPLOG_ENTRY, b"kept").expect("append");
            log.len()
        };
        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("raw open");
        raw.write_all(&[0, 0, 0, 40, 1, 2]).expect("garbage");
        drop(raw);

        let scan = scan_frames(&path).expect("scan");
        assert_eq!(scan.truncated_at, Some(intact_len));

        let (log, frames) = LogFile::open(&path, false).expect("reopen");
        assert_eq!(frames.len(), 1);
        assert_eq!(log.len(), intact_len);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), intact_len);
    }

    #[test]
    fn checksum_failure_refuses_to_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("oplog.log");
        {
            let (mut log, _) = LogFile::open(&path, false).expect("open");
            log.append(1, 1, FRAME_KIND_OPLOG_ENTRY, b"payload").expect("append");
        }
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[14] ^= 0x55;
        std::fs::write(&path, bytes).expect("write");
        let err = LogFile::open(&path, false).err().expect("corrupt");
        assert_eq!(err.code_str(), "integrity_error");
    }

    #[test]
    fn failed_batch_leaves_no_partial_frames() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("oplog.log");
        let (mut log, _) = LogFile::open(&path, false).expect("open");
        log.append(1, 1, FRAME_KIND_OPLOG_ENTRY, b"kept").expect("append");
        let before = log.len();

        let oversized = vec![0u8; MAX_FRAME_BODY_BYTES];
        log.append_all([
            (1, 2, FRAME_KIND_OPLOG_ENTRY, &b"fragment"[..]),
            (1, 3, FRAME_KIND_OPLOG_ENTRY, oversized.as_slice()),
        ])
        .expect_err("second frame is too large");
        assert_eq!(log.len(), before);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), before);

        log.append(1, 2, FRAME_KIND_OPLOG_ENTRY, b"next").expect("same timestamp again");
        drop(log);
        let (_log, frames) = LogFile::open(&path, false).expect("reopen");
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[1].ts_secs, frames[1].ts_inc), (1, 2));
        assert_eq!(frames[1].payload, b"next");
    }
}
