//! Tar archives for copying a submission into a container.
//!
//! Entries are regular files with mode 0600 and their exact byte length,
//! followed by the standard end-of-archive marker.

use tar::{Builder, EntryType, Header};

use super::{validate_file_name, SourceFile};
use crate::error::ExecutionError;

/// Permission bits for every archived file (owner read/write).
pub const FILE_MODE: u32 = 0o600;

/// Serialize `files` into an uncompressed tar archive.
pub fn build(files: &[SourceFile]) -> Result<Vec<u8>, ExecutionError> {
    for file in files {
        validate_file_name(&file.name)?;
    }

    let mut builder = Builder::new(Vec::new());
    for file in files {
        let body = file.content.as_bytes();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header
            .set_path(&file.name)
            .map_err(|e| ExecutionError::Injection(format!("tar header for {}: {e}", file.name)))?;
        header.set_size(body.len() as u64);
        header.set_mode(FILE_MODE);
        header.set_cksum();

        builder
            .append(&header, body)
            .map_err(|e| ExecutionError::Injection(format!("tar write for {}: {e}", file.name)))?;
    }

    builder
        .into_inner()
        .map_err(|e| ExecutionError::Injection(format!("tar finish: {e}")))
}
