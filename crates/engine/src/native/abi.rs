//! C ABI shared with native procedures
//!
//! Mirrors `include/graphproc_plugin.h`. Output never crosses the boundary as
//! an allocation: the host passes an [`OutputSink`] and the procedure pushes
//! bytes through its callback into a host-owned buffer.

use std::ffi::c_void;

/// V1 entry point symbol
pub const PROCESS_SYMBOL: &[u8] = b"Process\0";
/// V2 signature entry point symbol
pub const GET_SIGNATURE_SYMBOL: &[u8] = b"GetSignature\0";
/// V2 transaction-scoped entry point symbol
pub const PROCESS_IN_TXN_SYMBOL: &[u8] = b"ProcessInTxn\0";

/// Output callback handed to procedures
#[repr(C)]
pub struct OutputSink {
    /// Host context, passed back to `write` unchanged
    pub ctx: *mut c_void,
    /// Append `len` bytes at `data` to the output
    pub write: unsafe extern "C" fn(ctx: *mut c_void, data: *const u8, len: usize),
}

/// `bool Process(void* db, const uint8_t* input, size_t len, graphproc_sink* out)`
pub type ProcessFn = unsafe extern "C" fn(
    db: *mut c_void,
    input: *const u8,
    len: usize,
    out: *mut OutputSink,
) -> bool;

/// `bool GetSignature(graphproc_sink* out)`
pub type GetSignatureFn = unsafe extern "C" fn(out: *mut OutputSink) -> bool;

/// `bool ProcessInTxn(void* txn, const uint8_t* input, size_t len, graphproc_sink* out)`
pub type ProcessInTxnFn = unsafe extern "C" fn(
    txn: *mut c_void,
    input: *const u8,
    len: usize,
    out: *mut OutputSink,
) -> bool;

/// Host-owned buffer collecting procedure output
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
}

impl OutputBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink writing into this buffer
    ///
    /// The sink borrows the buffer through a raw pointer; it must not outlive
    /// `self` and `self` must not move while a procedure holds it.
    pub fn sink(&mut self) -> OutputSink {
        OutputSink {
            ctx: &mut self.bytes as *mut Vec<u8> as *mut c_void,
            write: sink_write,
        }
    }

    /// Bytes collected so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the collected bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

unsafe extern "C" fn sink_write(ctx: *mut c_void, data: *const u8, len: usize) {
    if ctx.is_null() || data.is_null() || len == 0 {
        return;
    }
    let buf = &mut *(ctx as *mut Vec<u8>);
    buf.extend_from_slice(std::slice::from_raw_parts(data, len));
}
