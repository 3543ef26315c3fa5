//! Task request and response payloads

use serde::{Deserialize, Serialize};

/// Reserved function name asking a worker to import a module
///
/// The task input carries the module name. A worker answers `Success`, or
/// `SuccessWithSignature` with a JSON signature as output, when the module
/// imports cleanly.
pub const LOAD_MODULE_FUNCTION: &str = "__graphproc_load_module__";

/// One unit of work sent to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Calling user
    pub user: String,
    /// Graph the call runs against
    pub graph: String,
    /// Directory holding procedure modules
    pub plugin_dir: String,
    /// Module (or reserved function) to run
    pub function: String,
    /// Opaque input passed to the procedure
    #[serde(with = "bytes_as_bin")]
    pub input: Vec<u8>,
    /// Whether the call runs under a read-only transaction
    pub read_only: bool,
}

/// Outcome reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Procedure succeeded
    Success,
    /// Procedure reported a logical failure
    InputErr,
    /// Procedure or worker failed unexpectedly
    InternalErr,
    /// Success whose output is a JSON signature
    SuccessWithSignature,
}

/// Response to one [`TaskInput`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Outcome
    pub status: TaskStatus,
    /// Procedure output, or diagnostics on failure
    #[serde(with = "bytes_as_bin")]
    pub output: Vec<u8>,
}

impl TaskOutput {
    /// Response with an explicit status
    pub fn new(status: TaskStatus, output: Vec<u8>) -> Self {
        TaskOutput { status, output }
    }

    /// Successful response
    pub fn success(output: Vec<u8>) -> Self {
        Self::new(TaskStatus::Success, output)
    }

    /// Whether the status is a success of either kind
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Success | TaskStatus::SuccessWithSignature
        )
    }
}

// Encode byte buffers as MessagePack bin instead of integer arrays.
mod bytes_as_bin {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
                Ok(v.as_bytes().to_vec())
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_byte_buf(BytesVisitor)
    }
}
