//! Write-ahead log for crash recovery.
//!
//! Every mutation is appended to the WAL before it is applied in memory.
//! Each entry is framed as `[u32 length BE][u32 CRC32 BE][bincode payload]`
//! and durably flushed with `fsync`.
//!
//! The log is split by generation: a checkpoint that snapshots the index as
//! generation `g` rotates appends to `wal-<g>.log`, so every file numbered at
//! or above the manifest generation holds mutations the segments lack.

use crate::quantization::Quantizer;
use crate::record::Metadata;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// A single mutation, replayed in order on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    Add {
        id: String,
        vector: Vec<f32>,
        metadata: Metadata,
    },
    AddBatch {
        items: Vec<(String, Vec<f32>, Metadata)>,
    },
    Delete {
        ids: Vec<String>,
    },
    Clear,
    Compact,
    /// The trained codec is logged so replay does not depend on retraining.
    EnableQuantization {
        quantizer: Quantizer,
        retain_raw: bool,
    },
    DisableQuantization,
    Reencode,
}

/// Diagnostic statistics from a WAL replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub files: usize,
    /// Number of entries successfully deserialized.
    pub success: usize,
    /// Number of entries skipped due to deserialization errors (CRC was valid).
    pub skipped: usize,
    /// Number of CRC mismatches encountered (replay of that file stopped).
    pub crc_errors: usize,
    /// Number of files whose replay ended on a truncated entry.
    pub truncated: usize,
}

pub fn wal_file_name(generation: u64) -> String {
    format!("wal-{generation:08}.log")
}

/// Generation number encoded in a WAL file name.
pub fn parse_wal_generation(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()
}

/// Append-only log over the current generation's file.
pub struct WriteAheadLog {
    dir: PathBuf,
    generation: Mutex<u64>,
    writer: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("dir", &self.dir)
            .field("generation", &*self.generation.lock())
            .finish()
    }
}

impl WriteAheadLog {
    /// Open or create `wal-<generation>.log` in append mode.
    pub fn open(dir: &Path, generation: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = open_append(&dir.join(wal_file_name(generation)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            generation: Mutex::new(generation),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Append an entry; returns once it is on disk.
    pub fn append(&self, entry: &WalEntry) -> io::Result<()> {
        let framed = serialize_and_frame(entry)?;
        let mut w = self.writer.lock();
        w.write_all(&framed)?;
        w.flush()?;
        w.get_mut().sync_all()?;
        Ok(())
    }

    /// Route further appends to `wal-<generation>.log`.
    pub fn rotate(&self, generation: u64) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        let file = open_append(&self.dir.join(wal_file_name(generation)))?;
        *writer = BufWriter::new(file);
        *self.generation.lock() = generation;
        Ok(())
    }

    /// Delete log files older than `generation`.
    pub fn remove_before(&self, generation: u64) -> io::Result<usize> {
        let mut removed = 0;
        for (gen, path) in list_wal_files(&self.dir)? {
            if gen < generation {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

/// WAL files in `dir`, ascending by generation.
pub fn list_wal_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let gen = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_wal_generation);
        if let Some(gen) = gen {
            files.push((gen, path));
        }
    }
    files.sort_by_key(|f| f.0);
    Ok(files)
}

/// Replay every WAL file numbered `from_generation` or later, in order.
///
/// Within a file replay stops at the first torn or corrupt frame; the
/// following files are still read.
pub fn replay_from(dir: &Path, from_generation: u64) -> io::Result<(Vec<WalEntry>, ReplayStats)> {
    let mut entries = Vec::new();
    let mut stats = ReplayStats::default();
    for (gen, path) in list_wal_files(dir)? {
        if gen >= from_generation {
            replay_file(&path, &mut entries, &mut stats)?;
            stats.files += 1;
        }
    }
    Ok((entries, stats))
}

fn replay_file(path: &Path, entries: &mut Vec<WalEntry>, stats: &mut ReplayStats) -> io::Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut header_buf = [0u8; 8];

    loop {
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]])
            as usize;
        let stored_crc =
            u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);
        let mut data = Vec::new();
        let read = (&mut reader).take(len as u64).read_to_end(&mut data)?;
        if read < len {
            tracing::warn!("WAL {:?} truncated mid-entry, stopping replay of this file", path);
            stats.truncated += 1;
            break;
        }
        let computed_crc = crc32fast::hash(&data);
        if computed_crc != stored_crc {
            tracing::warn!("WAL {:?} entry CRC mismatch, stopping replay of this file", path);
            stats.crc_errors += 1;
            break;
        }
        match bincode::deserialize::<WalEntry>(&data) {
            Ok(entry) => {
                entries.push(entry);
                stats.success += 1;
            }
            Err(e) => {
                tracing::warn!("WAL entry deserialization failed, skipping: {}", e);
                stats.skipped += 1;
            }
        }
    }
    Ok(())
}

/// Serialize a WAL entry into its on-disk frame format:
/// `[u32 len BE][u32 crc32 BE][bincode payload]`.
fn serialize_and_frame(entry: &WalEntry) -> io::Result<Vec<u8>> {
    let bytes = bincode::serialize(entry).map_err(|e| io::Error::other(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "WAL entry exceeds 4 GiB"))?;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}
