//! Named, typed message queue endpoints
//!
//! A queue endpoint wraps one side of a byte pipe and moves whole,
//! MessagePack-encoded messages across it. The name identifies the queue in
//! logs and diagnostics; it is unique per worker.

use crate::error::WireResult;
use crate::frame::{read_message, write_message};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Sending end of a queue
#[derive(Debug)]
pub struct QueueWriter<W> {
    name: String,
    inner: W,
}

impl<W: Write> QueueWriter<W> {
    /// Wrap a writer
    pub fn new(name: impl Into<String>, inner: W) -> Self {
        QueueWriter {
            name: name.into(),
            inner,
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode and send one message
    pub fn send<T: Serialize>(&mut self, message: &T) -> WireResult<()> {
        let payload = rmp_serde::to_vec_named(message)?;
        write_message(&mut self.inner, &payload)
    }
}

/// Receiving end of a queue
#[derive(Debug)]
pub struct QueueReader<R> {
    name: String,
    inner: R,
}

impl<R: Read> QueueReader<R> {
    /// Wrap a reader
    pub fn new(name: impl Into<String>, inner: R) -> Self {
        QueueReader {
            name: name.into(),
            inner,
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive and decode one message; `None` once the sender has closed
    pub fn recv<T: DeserializeOwned>(&mut self) -> WireResult<Option<T>> {
        match read_message(&mut self.inner)? {
            Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskOutput, TaskStatus};
    use std::io::Cursor;

    #[test]
    fn test_send_then_recv() {
        let mut writer = QueueWriter::new("_pipe_test_resp_", Vec::new());
        writer.send(&TaskOutput::success(b"out".to_vec())).unwrap();
        writer
            .send(&TaskOutput::new(TaskStatus::InputErr, b"bad".to_vec()))
            .unwrap();
        assert_eq!(writer.name(), "_pipe_test_resp_");

        let mut reader = QueueReader::new("_pipe_test_resp_", Cursor::new(writer.inner));
        let first: TaskOutput = reader.recv().unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Success);
        let second: TaskOutput = reader.recv().unwrap().unwrap();
        assert_eq!(second.output, b"bad");
        assert!(reader.recv::<TaskOutput>().unwrap().is_none());
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &[0xc1]).unwrap();
        let mut reader = QueueReader::new("q", Cursor::new(buf));
        assert!(matches!(
            reader.recv::<TaskOutput>(),
            Err(crate::WireError::Codec(_))
        ));
    }
}
