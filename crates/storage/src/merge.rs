//! Multi-file source bundle format
//!
//! A procedure built from several C++ files is stored as one blob. Each file
//! contributes:
//!
//! ```text
//! //<filename>\n<content><FILE_DELIMITER>
//! ```
//!
//! and the pieces are concatenated in the order supplied. `split_files`
//! inverts `merge_files` exactly.

use crate::error::{StorageError, StorageResult};

/// Token terminating each file's content in a merged bundle
pub const FILE_DELIMITER: &str = "\n/*@@graphproc:end-of-file@@*/\n";

const MARKER: &[u8] = b"//";

/// One named source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// File name, without directories
    pub name: String,
    /// Raw file content
    pub content: Vec<u8>,
}

impl SourceFile {
    /// Create a source file
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        SourceFile {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Check that a file name can be staged as a single entry in a directory
pub fn validate_file_name(name: &str) -> StorageResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\n', '\0']);
    if bad {
        return Err(StorageError::Corruption(format!(
            "invalid source file name [{}]",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Merge files into one bundle
///
/// Fails when a file name is not a plain name, or when a file's content
/// contains the delimiter (the bundle could not be split back).
pub fn merge_files(files: &[SourceFile]) -> StorageResult<Vec<u8>> {
    let delimiter = FILE_DELIMITER.as_bytes();
    let mut out = Vec::with_capacity(
        files
            .iter()
            .map(|f| f.name.len() + f.content.len() + delimiter.len() + 3)
            .sum(),
    );
    for file in files {
        validate_file_name(&file.name)?;
        if find(&file.content, delimiter).is_some() {
            return Err(StorageError::Corruption(format!(
                "file [{}] contains the bundle delimiter",
                file.name
            )));
        }
        out.extend_from_slice(MARKER);
        out.extend_from_slice(file.name.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&file.content);
        out.extend_from_slice(delimiter);
    }
    Ok(out)
}

/// Split a bundle produced by [`merge_files`]
pub fn split_files(bundle: &[u8]) -> StorageResult<Vec<SourceFile>> {
    let delimiter = FILE_DELIMITER.as_bytes();
    let mut files = Vec::new();
    let mut rest = bundle;
    while !rest.is_empty() {
        if !rest.starts_with(MARKER) {
            return Err(StorageError::Corruption(format!(
                "expected file marker at offset {}",
                bundle.len() - rest.len()
            )));
        }
        rest = &rest[MARKER.len()..];
        let name_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StorageError::Corruption("unterminated file name".into()))?;
        let name = std::str::from_utf8(&rest[..name_end])
            .map_err(|_| StorageError::Corruption("file name is not UTF-8".into()))?
            .to_string();
        validate_file_name(&name)?;
        rest = &rest[name_end + 1..];
        let content_end = find(rest, delimiter).ok_or_else(|| {
            StorageError::Corruption(format!("missing delimiter after file [{}]", name))
        })?;
        files.push(SourceFile::new(name, &rest[..content_end]));
        rest = &rest[content_end + delimiter.len()..];
    }
    Ok(files)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
