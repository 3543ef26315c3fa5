//! Message framing
//!
//! ## Format
//!
//! ```text
//! +-----------------+----------------+-----------+----------------+-----------+----
//! | total: u64 (LE) | len0: u32 (LE) | chunk0    | len1: u32 (LE) | chunk1    | ...
//! +-----------------+----------------+-----------+----------------+-----------+----
//! ```
//!
//! `total` is the payload size. The payload follows as chunks of at most
//! [`MAX_WIRE_CHUNK`] bytes, each preceded by its own length, until `total`
//! bytes have been sent. An empty payload is a bare `total = 0` header.

use crate::error::{WireError, WireResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use graphproc_core::MAX_WIRE_CHUNK;
use std::io::{self, Read, Write};

/// Largest payload a reader accepts
pub const MAX_MESSAGE_SIZE: u64 = 1 << 30;

/// Write one message using the default chunk size
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> WireResult<()> {
    write_message_chunked(writer, payload, MAX_WIRE_CHUNK)
}

/// Write one message, splitting the payload into chunks of `chunk_size`
pub fn write_message_chunked<W: Write>(
    writer: &mut W,
    payload: &[u8],
    chunk_size: usize,
) -> WireResult<()> {
    if chunk_size == 0 || chunk_size > u32::MAX as usize {
        return Err(WireError::Malformed(format!(
            "invalid chunk size {}",
            chunk_size
        )));
    }
    if payload.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized {
            size: payload.len() as u64,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_u64::<LittleEndian>(payload.len() as u64)?;
    for chunk in payload.chunks(chunk_size) {
        writer.write_u32::<LittleEndian>(chunk.len() as u32)?;
        writer.write_all(chunk)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read one message
///
/// Returns `Ok(None)` when the stream ends cleanly before a new message
/// starts; an end of stream anywhere inside a message is an error.
pub fn read_message<R: Read>(reader: &mut R) -> WireResult<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    let got = read_up_to(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < header.len() {
        return Err(WireError::Truncated {
            expected: (header.len() - got) as u64,
        });
    }
    let total = (&header[..]).read_u64::<LittleEndian>()?;
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized {
            size: total,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = Vec::with_capacity(total as usize);
    while (payload.len() as u64) < total {
        let remaining = total - payload.len() as u64;
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len as u64,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(WireError::Truncated {
                    expected: remaining,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if len == 0 || len > remaining {
            return Err(WireError::Malformed(format!(
                "chunk of {} bytes with {} bytes remaining",
                len, remaining
            )));
        }
        let start = payload.len();
        payload.resize(start + len as usize, 0);
        let got = read_up_to(reader, &mut payload[start..])?;
        if (got as u64) < len {
            return Err(WireError::Truncated {
                expected: remaining - got as u64,
            });
        }
    }
    Ok(Some(payload))
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
