//! Gzip-compressed tar codec for bundle artifacts.
//!
//! A bundle is an ordered list of `(path, bytes)` entries written as regular
//! files into a tar stream, wrapped in gzip.  Entry headers are normalised
//! (mode `0644`, mtime `0`, uid/gid `0`) so that identical inputs always
//! produce identical artifacts.  Paths longer than the 100-byte ustar name
//! field are carried with the GNU long-name extension instead of being
//! truncated.

use std::io::{Read, Write};
use std::path::{Component, Path};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One named payload inside a bundle archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative path of the entry inside the archive (e.g. `policy/platform.rego`).
    pub path: String,
    /// Verbatim entry content.
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The underlying byte sink or source failed.
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The entry path cannot be stored in a portable archive.
    #[error("invalid archive path {0:?}: must be relative and must not contain `..`")]
    InvalidPath(String),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `entries` into an in-memory `.tar.gz` artifact.
pub fn encode(entries: &[ArchiveEntry]) -> Result<Vec<u8>, ArchiveError> {
    let capacity = entries.iter().map(|e| e.data.len() + 512).sum::<usize>() + 1024;
    encode_to(Vec::with_capacity(capacity), entries)
}

/// Encode `entries`, in order, into `sink` and hand the sink back once the
/// gzip trailer has been written.
pub fn encode_to<W: Write>(sink: W, entries: &[ArchiveEntry]) -> Result<W, ArchiveError> {
    for entry in entries {
        check_entry_path(&entry.path)?;
    }

    let mut builder = tar::Builder::new(GzEncoder::new(sink, Compression::default()));

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, &entry.path, entry.data.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Archive paths must be non-empty, relative and free of `..` segments; the
/// tar writer refuses anything else and consumers would unpack it outside
/// their target directory.
fn check_entry_path(path: &str) -> Result<(), ArchiveError> {
    let valid = !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(())
    } else {
        Err(ArchiveError::InvalidPath(path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a `.tar.gz` artifact back into its regular-file entries, in archive
/// order.
pub fn decode(artifact: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(artifact));
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.push(ArchiveEntry { path, data });
    }

    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
