//! On-disk cache format.
//!
//! ```text
//! "CAPFLOWC" | format version (u16 BE) | gzip(record*)
//! record = length (u32 BE) | JSON payload
//! ```
//!
//! The first record is the header (scope + source fingerprint); every other
//! record is one detail tree, least recently used first. A file that cannot be
//! read, carries another version, or describes a different source is treated
//! as absent.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, Crc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheScope, SourceFingerprint};
use crate::error::CacheError;
use crate::model::DetailArtifact;

const MAGIC: &[u8; 8] = b"CAPFLOWC";
pub const FORMAT_VERSION: u16 = 1;
/// Upper bound on one record, so a corrupt length cannot trigger a huge allocation
const MAX_RECORD: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    scope: CacheScope,
    fingerprint: SourceFingerprint,
    count: u64,
}

/// A cache file's contents after validation.
#[derive(Debug)]
pub struct PersistedCache {
    pub scope: CacheScope,
    pub artifacts: Vec<DetailArtifact>,
}

/// File name for a scope's cache: CRC-32 of the source, then of the filter.
///
/// Must not change between builds, or saved caches are never found again.
pub fn cache_file_name(scope: &CacheScope) -> String {
    let crc = |text: &str| {
        let mut crc = Crc::new();
        crc.update(text.as_bytes());
        crc.sum()
    };
    format!("{:08x}{:08x}.cache", crc(&scope.source), crc(&scope.filter))
}

fn write_record<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CacheError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD)
        .ok_or_else(|| CacheError::Format {
            reason: format!("record of {} bytes is too large", payload.len()),
        })?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

/// `None` on a clean end of stream
fn read_record<R: Read>(input: &mut R) -> Result<Option<Vec<u8>>, CacheError> {
    let mut len = [0u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_RECORD {
        return Err(CacheError::Format {
            reason: format!("record length {} exceeds limit", len),
        });
    }
    let mut payload = vec![0u8; len as usize];
    input.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub(super) fn write(
    path: &Path,
    scope: &CacheScope,
    fingerprint: &SourceFingerprint,
    artifacts: &[Arc<DetailArtifact>],
) -> Result<(), CacheError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = BufWriter::new(File::create(&tmp)?);
        file.write_all(MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_be_bytes())?;

        let mut gz = GzEncoder::new(file, Compression::default());
        write_record(
            &mut gz,
            &Header {
                scope: scope.clone(),
                fingerprint: fingerprint.clone(),
                count: artifacts.len() as u64,
            },
        )?;
        for artifact in artifacts {
            write_record(&mut gz, artifact.as_ref())?;
        }
        gz.finish()?.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read(path: &Path, scope: &CacheScope, fingerprint: &SourceFingerprint) -> Result<PersistedCache, CacheError> {
    let mut file = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CacheError::Format {
            reason: "bad magic".into(),
        });
    }
    let mut version = [0u8; 2];
    file.read_exact(&mut version)?;
    let version = u16::from_be_bytes(version);
    if version != FORMAT_VERSION {
        return Err(CacheError::Format {
            reason: format!("version {} (expected {})", version, FORMAT_VERSION),
        });
    }

    let mut gz = GzDecoder::new(file);
    let header: Header = match read_record(&mut gz)? {
        Some(payload) => serde_json::from_slice(&payload)?,
        None => {
            return Err(CacheError::Format {
                reason: "missing header".into(),
            })
        }
    };
    if &header.scope != scope {
        return Err(CacheError::Format {
            reason: "file belongs to another scope".into(),
        });
    }
    if &header.fingerprint != fingerprint {
        return Err(CacheError::Stale {
            path: path.to_path_buf(),
        });
    }

    let mut artifacts = Vec::with_capacity(header.count.min(100_000) as usize);
    while let Some(payload) = read_record(&mut gz)? {
        artifacts.push(serde_json::from_slice(&payload)?);
    }
    if artifacts.len() as u64 != header.count {
        return Err(CacheError::Format {
            reason: format!("expected {} records, found {}", header.count, artifacts.len()),
        });
    }
    Ok(PersistedCache {
        scope: header.scope,
        artifacts,
    })
}

/// Read a cache file, treating every failure as "no cache".
///
/// Stale or corrupt files are removed so they are not read again.
pub(super) fn read_validated(
    path: &Path,
    scope: &CacheScope,
    fingerprint: &SourceFingerprint,
) -> Option<PersistedCache> {
    match read(path, scope, fingerprint) {
        Ok(persisted) => Some(persisted),
        Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Discarding cache file {}: {}", path.display(), e);
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove {}: {}", path.display(), e);
            }
            None
        }
    }
}
