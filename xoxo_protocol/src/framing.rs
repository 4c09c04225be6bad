// Length-delimited frame encoding over any byte stream.
//
// Wire format: a 4-byte big-endian length prefix followed by the
// JSON-serialized `Frame`. `write_frame` / `read_frame` do the JSON step;
// `write_message` / `read_message` are the raw byte-level halves and stay
// format-agnostic.
//
// `MAX_MESSAGE_SIZE` (1 MiB) caps allocation from a malformed or hostile
// length prefix. A full board snapshot is a few kilobytes.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::message::Frame;

/// Maximum accepted payload size in bytes.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge(usize),
}

impl FrameError {
    /// True when the stream ended cleanly between or inside frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> Result<(), FrameError> {
    let len = msg.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(FrameError::TooLarge(len));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message. A clean close surfaces as an
/// `UnexpectedEof` I/O error (see `FrameError::is_eof`).
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize a `Frame` to JSON and write it length-delimited.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let json = serde_json::to_vec(frame)?;
    write_message(writer, &json)
}

/// Read one length-delimited `Frame`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let bytes = read_message(reader)?;
    Ok(serde_json::from_slice(&bytes)?)
}
