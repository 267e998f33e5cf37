//! The `MANIFEST` file: which segments make up the current generation.
//!
//! Written as JSON to `MANIFEST.tmp`, fsynced, then renamed over `MANIFEST`,
//! so a reader sees either the previous generation or the new one.

use crate::error::{IndexError, Result};
use crate::persistence::segment::{write_synced, SegmentKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub file: String,
    pub generation: u64,
    pub kind: SegmentKind,
    pub slot_count: u32,
    pub live_count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    /// Live segments in apply order: one full segment, then deltas.
    pub segments: Vec<SegmentRef>,
    pub created_unix_ms: u64,
}

pub fn segment_file_name(generation: u64) -> String {
    format!("seg-{generation:08}.hseg")
}

impl Manifest {
    pub fn new(generation: u64, segments: Vec<SegmentRef>) -> Self {
        let created_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            generation,
            segments,
            created_unix_ms,
        }
    }

    /// Read `dir/MANIFEST`; `None` when the directory has never been checkpointed.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| IndexError::corrupt(&path, format!("manifest is not valid JSON: {e}")))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(IndexError::corrupt(
                &path,
                format!("unsupported manifest version {}", manifest.format_version),
            ));
        }
        match manifest.segments.first() {
            Some(first) if first.kind != SegmentKind::Full => {
                return Err(IndexError::corrupt(&path, "first segment is not a full segment"));
            }
            _ => {}
        }
        Ok(Some(manifest))
    }

    /// Atomically replace `dir/MANIFEST`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| IndexError::Io(io::Error::other(e)))?;
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        write_synced(&tmp, &json)?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(generation: u64, kind: SegmentKind) -> SegmentRef {
        SegmentRef {
            file: segment_file_name(generation),
            generation,
            kind,
            slot_count: 10,
            live_count: 9,
            bytes: 512,
        }
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);
        let m = Manifest::new(3, vec![seg(1, SegmentKind::Full), seg(3, SegmentKind::Delta)]);
        m.store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(m));
        assert!(!dir.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn test_garbage_manifest_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(IndexError::CorruptPersistence { .. })
        ));
    }

    #[test]
    fn test_delta_first_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        Manifest::new(2, vec![seg(2, SegmentKind::Delta)])
            .store(dir.path())
            .unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }
}
