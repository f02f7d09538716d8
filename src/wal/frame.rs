use crc32c::crc32c;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Bytes between the length prefix and the payload: ts secs, ts inc, kind.
const HEADER_BYTES: usize = 4 + 4 + 1;
const CRC_BYTES: usize = 4;

pub const FRAME_KIND_OPLOG_ENTRY: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ts_secs: u32,
    pub ts_inc: u32,
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Encodes one frame: `[len u32][secs u32][inc u32][kind u8][payload][crc32c u32]`,
/// where `len` covers everything after itself and the crc covers everything before it.
pub fn encode_frame(ts_secs: u32, ts_inc: u32, kind: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let body_len = HEADER_BYTES + payload.len() + CRC_BYTES;
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::Corruption);
    }
    let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&frame_length.to_be_bytes());
    out.extend_from_slice(&ts_secs.to_be_bytes());
    out.extend_from_slice(&ts_inc.to_be_bytes());
    out.push(kind);
    out.extend_from_slice(payload);
    let crc = crc32c(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Writes encoded frames to `inner`, one `write_all` per frame.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn append(&mut self, ts_secs: u32, ts_inc: u32, kind: u8, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(ts_secs, ts_inc, kind, payload)?;
        self.inner.write_all(&frame)?;
        Ok(frame.len())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct FrameReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Byte offset just past the last frame returned successfully.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut len_buf = [0u8; 4];
        let first = self.inner.read(&mut len_buf[0..1])?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_truncated(&mut self.inner, &mut len_buf[1..4])?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        if !(HEADER_BYTES + CRC_BYTES..=MAX_FRAME_BODY_BYTES).contains(&body_len) {
            return Err(FrameError::Corruption);
        }

        let mut body = vec![0u8; body_len];
        read_exact_or_truncated(&mut self.inner, &mut body)?;

        let crc_offset = body_len - CRC_BYTES;
        let stored_crc = u32::from_be_bytes(
            body[crc_offset..]
                .try_into()
                .map_err(|_| FrameError::Corruption)?,
        );
        let mut crc_input = Vec::with_capacity(4 + crc_offset);
        crc_input.extend_from_slice(&len_buf);
        crc_input.extend_from_slice(&body[..crc_offset]);
        if stored_crc != crc32c(&crc_input) {
            return Err(FrameError::Corruption);
        }

        let ts_secs = u32::from_be_bytes(body[0..4].try_into().map_err(|_| FrameError::Corruption)?);
        let ts_inc = u32::from_be_bytes(body[4..8].try_into().map_err(|_| FrameError::Corruption)?);
        let kind = body[8];
        body.truncate(crc_offset);
        let payload = body.split_off(HEADER_BYTES);

        self.offset += (4 + body_len) as u64;
        Ok(Some(Frame {
            ts_secs,
            ts_inc,
            kind,
            payload,
        }))
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncation),
        Err(e) => Err(FrameError::Io(e.to_string())),
    }
}
