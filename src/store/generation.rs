//! One append epoch: a fixed-width index log paired with a raw data log.
//!
//! The index file `<gen>.machi` holds 32-byte records appended in
//! lockstep with payload writes to the data file `<gen>.machd`. A trim
//! overwrites the original record in place with a tombstone, so recovery
//! sees each offset exactly once with its final state.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::Locator;
use crate::{MachiError, Result};

/// Extension of the index log.
pub(super) const INDEX_EXT: &str = "machi";
/// Extension of the data log.
pub(super) const DATA_EXT: &str = "machd";

/// Width in bytes of one on-disk index record.
const RECORD_SIZE: usize = 32;

/// Record state of a live append.
const STATE_LIVE: i32 = 1;
/// Record state of a trim tombstone.
const STATE_TRIMMED: i32 = -1;

/// One on-disk index record, packed little-endian:
///
/// | bytes  | field  | type |
/// |--------|--------|------|
/// | 0..8   | gen    | u64  |
/// | 8..16  | offset | u64  |
/// | 16..24 | length | u64  |
/// | 24..28 | crc32  | u32  |
/// | 28..32 | state  | i32  |
struct IndexRecord {
    gen: u64,
    offset: u64,
    length: u64,
    crc: u32,
    state: i32,
}

impl IndexRecord {
    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.gen.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.crc.to_le_bytes());
        buf[28..32].copy_from_slice(&self.state.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_SIZE]) -> IndexRecord {
        IndexRecord {
            gen: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            state: i32::from_le_bytes(buf[28..32].try_into().unwrap()),
        }
    }
}

/// In-memory view of the most recent index record for one offset.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Payload length in bytes.
    length: u64,
    /// CRC-32/IEEE of the payload.
    crc: u32,
    /// `STATE_LIVE` or `STATE_TRIMMED`; anything else is corruption.
    state: i32,
    /// Byte position of this record in the index file.
    index_pos: u64,
}

/// A single generation: one index/data file pair plus the in-memory
/// index rebuilt from (or mirrored into) the index log.
pub(super) struct Generation {
    gen: u64,
    index_path: PathBuf,
    data_path: PathBuf,
    index_file: File,
    data_file: File,
    /// offset -> most recent record for that offset.
    index: HashMap<u64, IndexEntry>,
    /// Next append position in the data file.
    data_end: u64,
    /// Next append position in the index file; always a multiple of 32.
    index_end: u64,
    /// Total appends this generation has absorbed.
    entry_count: u64,
    /// Appends still in the live state.
    live_count: u64,
    /// Remove both files on close regardless of live count.
    temp: bool,
}

impl Generation {
    /// Creates a fresh generation, failing if either file already exists.
    pub(super) fn create(dir: &Path, gen: u64, temp: bool) -> Result<Generation> {
        let index_path = index_path(dir, gen);
        let data_path = data_path(dir, gen);
        let index_file = create_new(&index_path)?;
        let data_file = create_new(&data_path)?;
        debug!("created generation {gen} in {}", dir.display());

        Ok(Generation {
            gen,
            index_path,
            data_path,
            index_file,
            data_file,
            index: HashMap::new(),
            data_end: 0,
            index_end: 0,
            entry_count: 0,
            live_count: 0,
            temp,
        })
    }

    /// Reopens an existing generation pair, rebuilding the in-memory
    /// index from the on-disk log.
    ///
    /// The index file is replaced by a byte-for-byte copy of its whole
    /// records so that the fresh handle carries no append flag and a
    /// torn trailing record is physically discarded. The data file is
    /// never truncated; bytes past the last indexed payload are dead
    /// space. Recovered generations only ever serve reads and trims, so
    /// the data file is opened read-only.
    pub(super) fn recover(dir: &Path, gen: u64) -> Result<Generation> {
        let index_path = index_path(dir, gen);
        let data_path = data_path(dir, gen);

        let mut index_end = fs::metadata(&index_path)?.len();
        let torn = index_end % RECORD_SIZE as u64;
        if torn != 0 {
            warn!("generation {gen}: discarding {torn}-byte partial record at index tail");
            index_end -= torn;
        }
        let data_end = fs::metadata(&data_path)?.len();

        let index_file = rewrite_index(&index_path, index_end)?;
        let data_file = OpenOptions::new().read(true).open(&data_path)?;

        let mut index = HashMap::new();
        let mut live_count = 0u64;
        let mut buf = [0u8; RECORD_SIZE];
        let mut pos = 0u64;
        while pos < index_end {
            read_record_at(&index_file, &mut buf, pos)?;
            let record = IndexRecord::decode(&buf);
            if record.gen != gen {
                return Err(MachiError::GenerationMismatch {
                    expected: gen,
                    found: record.gen,
                });
            }
            let entry = IndexEntry {
                length: record.length,
                crc: record.crc,
                state: record.state,
                index_pos: pos,
            };
            if let Some(prev) = index.insert(record.offset, entry) {
                if prev.state == STATE_LIVE {
                    live_count -= 1;
                }
            }
            if record.state == STATE_LIVE {
                live_count += 1;
            }
            pos += RECORD_SIZE as u64;
        }
        let entry_count = index.len() as u64;
        debug!("recovered generation {gen}: {live_count} live of {entry_count} entries");

        Ok(Generation {
            gen,
            index_path,
            data_path,
            index_file,
            data_file,
            index,
            data_end,
            index_end,
            entry_count,
            live_count,
            temp: false,
        })
    }

    /// Appends a payload, returning its `(offset, length)` within this
    /// generation. Only the store's front generation takes appends.
    pub(super) fn append(&mut self, data: &[u8]) -> Result<(u64, u64)> {
        let pos = self.data_end;
        let written = self.data_file.write_at(data, pos)?;
        if written != data.len() {
            return Err(MachiError::ShortWrite {
                expected: data.len(),
                written,
            });
        }
        self.data_end += data.len() as u64;

        let crc = crc32fast::hash(data);
        let record = IndexRecord {
            gen: self.gen,
            offset: pos,
            length: data.len() as u64,
            crc,
            state: STATE_LIVE,
        };
        self.write_record(&record, self.index_end)?;

        self.index.insert(
            pos,
            IndexEntry {
                length: data.len() as u64,
                crc,
                state: STATE_LIVE,
                index_pos: self.index_end,
            },
        );
        self.index_end += RECORD_SIZE as u64;
        self.entry_count += 1;
        self.live_count += 1;

        Ok((pos, data.len() as u64))
    }

    /// Reads `length` bytes at `offset`, verifying the stored CRC when
    /// the full payload is requested. A shorter `length` returns a
    /// prefix without verification.
    ///
    /// Returns `None` for unknown or trimmed offsets.
    pub(super) fn get(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let entry = match self.index.get(&offset) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        match entry.state {
            STATE_TRIMMED => return Ok(None),
            STATE_LIVE => {}
            state => {
                return Err(MachiError::InvalidState {
                    state,
                    gen: self.gen,
                    offset,
                })
            }
        }
        if length > entry.length {
            // Bytes past the payload belong to other entries or to dead
            // space; never hand them out as if they were this entry.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read of {length} bytes exceeds stored length {}", entry.length),
            )
            .into());
        }

        let mut data = vec![0u8; length as usize];
        let read = self.data_file.read_at(&mut data, offset)?;
        if read != data.len() {
            return Err(MachiError::ShortRead {
                expected: data.len(),
                read,
            });
        }
        if length == entry.length {
            let computed = crc32fast::hash(&data);
            if computed != entry.crc {
                return Err(MachiError::CorruptCrc {
                    gen: self.gen,
                    offset,
                    stored: entry.crc,
                    computed,
                });
            }
        }
        Ok(Some(data))
    }

    /// Marks the entry at `offset` trimmed by overwriting its index
    /// record in place with a tombstone. Returns whether a live entry
    /// was trimmed; absent and already-trimmed offsets are no-ops.
    pub(super) fn trim(&mut self, offset: u64) -> Result<bool> {
        let entry = match self.index.get(&offset) {
            Some(entry) => *entry,
            None => return Ok(false),
        };
        match entry.state {
            STATE_TRIMMED => return Ok(false),
            STATE_LIVE => {}
            state => {
                return Err(MachiError::InvalidState {
                    state,
                    gen: self.gen,
                    offset,
                })
            }
        }

        let record = IndexRecord {
            gen: self.gen,
            offset,
            length: entry.length,
            crc: entry.crc,
            state: STATE_TRIMMED,
        };
        self.write_record(&record, entry.index_pos)?;

        self.index.insert(
            offset,
            IndexEntry {
                state: STATE_TRIMMED,
                ..entry
            },
        );
        self.live_count -= 1;
        Ok(true)
    }

    /// Yields the locator of every live entry, in no particular order.
    pub(super) fn live_entries(&self) -> impl Iterator<Item = Locator> + '_ {
        let gen = self.gen;
        self.index
            .iter()
            .filter(|(_, entry)| entry.state == STATE_LIVE)
            .map(move |(&offset, entry)| Locator {
                gen,
                offset,
                len: entry.length,
            })
    }

    /// Releases both file handles, removing the pair from disk when the
    /// generation is temporary or has no live entries left.
    pub(super) fn close(self) -> Result<()> {
        let remove = self.temp || self.live_count == 0;
        drop(self.index_file);
        drop(self.data_file);
        if remove {
            debug!("removing generation {} files", self.gen);
            fs::remove_file(&self.index_path)?;
            fs::remove_file(&self.data_path)?;
        }
        Ok(())
    }

    /// Total appends this generation has absorbed.
    pub(super) fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Number of entries still live.
    pub(super) fn live_count(&self) -> u64 {
        self.live_count
    }

    fn write_record(&self, record: &IndexRecord, pos: u64) -> Result<()> {
        let buf = record.encode();
        let written = self.index_file.write_at(&buf, pos)?;
        if written != buf.len() {
            return Err(MachiError::ShortWrite {
                expected: buf.len(),
                written,
            });
        }
        Ok(())
    }
}

/// Returns the index log path for generation `gen`.
fn index_path(dir: &Path, gen: u64) -> PathBuf {
    dir.join(format!("{gen}.{INDEX_EXT}"))
}

/// Returns the data log path for generation `gen`.
fn data_path(dir: &Path, gen: u64) -> PathBuf {
    dir.join(format!("{gen}.{DATA_EXT}"))
}

/// Opens `path` with exclusive-create semantics, read+write and no
/// append flag, so positional writes honor the supplied offset.
fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => MachiError::AlreadyExists(path.to_owned()),
            _ => e.into(),
        })
}

/// Replaces the index file with a fresh copy of its first `index_end`
/// bytes and returns the new read-write handle.
///
/// The original is renamed to `<name>.bak` (replacing any stale bak left
/// by a crashed recovery), copied whole-records-only into an exclusively
/// created fresh file, and then removed.
fn rewrite_index(index_path: &Path, index_end: u64) -> Result<File> {
    let mut bak_path = index_path.as_os_str().to_owned();
    bak_path.push(".bak");
    let bak_path = PathBuf::from(bak_path);

    fs::rename(index_path, &bak_path)?;
    let bak = File::open(&bak_path)?;
    let mut fresh = create_new(index_path)?;
    let copied = io::copy(&mut bak.take(index_end), &mut fresh)?;
    if copied != index_end {
        return Err(MachiError::ShortRead {
            expected: index_end as usize,
            read: copied as usize,
        });
    }
    fs::remove_file(&bak_path)?;
    Ok(fresh)
}

/// Reads one whole index record at `pos`.
fn read_record_at(file: &File, buf: &mut [u8; RECORD_SIZE], pos: u64) -> Result<()> {
    let read = file.read_at(buf, pos)?;
    if read != buf.len() {
        return Err(MachiError::ShortRead {
            expected: buf.len(),
            read,
        });
    }
    Ok(())
}
