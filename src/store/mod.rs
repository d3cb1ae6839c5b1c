//! The store: one writable front generation plus a set of retired back
//! generations, serialized by a reader-writer lock.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::rwlock::RwLock;
use crate::{MachiError, Result};

mod generation;

use generation::Generation;

/// Locates one entry: the generation that holds it, its byte offset in
/// that generation's data log, and its length.
///
/// Locators are opaque to callers except that `len` may be shortened to
/// request a prefix of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Generation number.
    pub gen: u64,
    /// Byte offset of the payload in the data log.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u64,
}

/// An append-and-trim persistent blob store.
///
/// Appends go to the single writable front generation and return a
/// [`Locator`]. Once the front has absorbed `maxlen` appends it is
/// retired to the read-only back set and a new front is opened. Trimmed
/// entries are tombstoned in place; a back generation whose last live
/// entry is trimmed is deleted from disk before the trim returns.
///
/// All operations serialize through one reader-writer lock: `append` and
/// `trim` take the exclusive side, `get` and `keys` the shared side, so
/// the store can be driven from multiple threads by reference.
///
/// Two stores (or processes) sharing one directory are not supported.
pub struct MachiStore {
    path: PathBuf,
    maxlen: u64,
    temp: bool,
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    /// Number of the front generation; strictly greater than every key
    /// in `back`.
    gen: u64,
    /// The unique writable generation. `None` only transiently inside
    /// rotation.
    front: Option<Generation>,
    /// Retired generations, read-only except for trims.
    back: HashMap<u64, Generation>,
}

impl StoreInner {
    fn front(&self) -> &Generation {
        self.front.as_ref().expect("store is open")
    }

    fn front_mut(&mut self) -> &mut Generation {
        self.front.as_mut().expect("store is open")
    }
}

impl MachiStore {
    /// Opens a store in `dir`, recovering any generation pairs left by
    /// previous runs.
    ///
    /// `maxlen` is the rotation watermark: once the front generation has
    /// absorbed that many appends it is retired and a fresh front is
    /// opened. Pre-existing generations all become back generations; the
    /// front is created fresh at one past the highest recovered number.
    ///
    /// With `temp` set, opening fails with [`MachiError::AlreadyExists`]
    /// if the directory already contains generation files, and closing
    /// the store removes every file it created.
    pub fn open(dir: impl Into<PathBuf>, maxlen: u64, temp: bool) -> Result<MachiStore> {
        let path = dir.into();
        fs::create_dir_all(&path)?;

        if temp {
            if let Some(stale) = find_generation_file(&path)? {
                return Err(MachiError::AlreadyExists(stale));
            }
        }

        let mut back = HashMap::new();
        for gen in sorted_gen_list(&path)? {
            back.insert(gen, Generation::recover(&path, gen)?);
        }
        let gen = back.keys().max().map_or(0, |&g| g + 1);
        info!(
            "opened store in {}: {} recovered generations, front at {gen}",
            path.display(),
            back.len()
        );
        let front = Generation::create(&path, gen, temp)?;

        Ok(MachiStore {
            path,
            maxlen,
            temp,
            inner: RwLock::new(StoreInner {
                gen,
                front: Some(front),
                back,
            }),
        })
    }

    /// Appends a payload to the front generation, returning its locator.
    ///
    /// When this append fills the front to the rotation watermark, the
    /// front is retired to the back set and a fresh front is opened
    /// before the call returns. The returned locator always names the
    /// generation the payload actually landed in.
    pub fn append(&self, data: &[u8]) -> Result<Locator> {
        let mut inner = self.inner.write();
        let gen = inner.gen;
        let (offset, len) = inner.front_mut().append(data)?;
        if inner.front().entry_count() >= self.maxlen {
            self.rotate(&mut inner)?;
        }
        Ok(Locator { gen, offset, len })
    }

    /// Reads back the payload for `loc`.
    ///
    /// Returns `None` when the locator's generation or offset is unknown
    /// or the entry has been trimmed. A locator with a shortened `len`
    /// reads a prefix of the payload without CRC verification.
    pub fn get(&self, loc: Locator) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read()?;
        if loc.gen == inner.gen {
            return inner.front().get(loc.offset, loc.len);
        }
        match inner.back.get(&loc.gen) {
            Some(generation) => generation.get(loc.offset, loc.len),
            None => Ok(None),
        }
    }

    /// Trims the entry at `loc`, making its space reclaimable.
    ///
    /// Trimming is idempotent: unknown and already-trimmed locators are
    /// no-ops. Entries are identified by generation and offset alone. A
    /// back generation left with no live entries is deleted from disk
    /// before this call returns.
    pub fn trim(&self, loc: Locator) -> Result<()> {
        let mut inner = self.inner.write();
        if loc.gen == inner.gen {
            inner.front_mut().trim(loc.offset)?;
            return Ok(());
        }
        let reap = match inner.back.get_mut(&loc.gen) {
            Some(generation) => {
                generation.trim(loc.offset)?;
                generation.live_count() == 0
            }
            None => false,
        };
        if reap {
            debug!("generation {} has no live entries, reaping", loc.gen);
            let generation = inner.back.remove(&loc.gen).expect("checked above");
            generation.close()?;
        }
        Ok(())
    }

    /// Returns the locator of every live entry: the front generation's
    /// first, then each back generation's, in no particular order.
    pub fn keys(&self) -> Result<Vec<Locator>> {
        let inner = self.inner.read()?;
        let mut keys: Vec<Locator> = inner.front().live_entries().collect();
        for generation in inner.back.values() {
            keys.extend(generation.live_entries());
        }
        Ok(keys)
    }

    /// Closes the store, releasing every generation.
    ///
    /// Generations with no live entries are deleted from disk, as is
    /// everything a temporary store created.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner();
        if let Some(front) = inner.front.take() {
            front.close()?;
        }
        for (_, generation) in inner.back.drain() {
            generation.close()?;
        }
        Ok(())
    }

    /// Retires the front generation and opens a fresh one.
    ///
    /// A front whose entries were all trimmed already is closed (which
    /// deletes its files) and its number reused; any other front moves
    /// into the back set and the generation counter advances.
    fn rotate(&self, inner: &mut StoreInner) -> Result<()> {
        let front = inner.front.take().expect("store is open");
        if front.live_count() == 0 {
            debug!("front generation {} fully trimmed, reusing its number", inner.gen);
            front.close()?;
        } else {
            debug!("retiring generation {} to the back set", inner.gen);
            inner.back.insert(inner.gen, front);
            inner.gen += 1;
        }
        inner.front = Some(Generation::create(&self.path, inner.gen, self.temp)?);
        Ok(())
    }
}

/// Returns the sorted generation numbers of every index log in `dir`.
fn sorted_gen_list(path: &Path) -> Result<Vec<u64>> {
    let mut gen_list: Vec<u64> = fs::read_dir(path)?
        .flat_map(|res| -> Result<_> { Ok(res?.path()) })
        .filter(|path| path.is_file() && path.extension() == Some(generation::INDEX_EXT.as_ref()))
        .filter_map(|path| {
            path.file_stem()
                .and_then(OsStr::to_str)
                .map(str::parse::<u64>)
        })
        .flatten()
        .collect();
    gen_list.sort_unstable();
    Ok(gen_list)
}

/// Returns the first numerically-named index or data log in `dir`, if
/// any. Used by temporary stores to refuse directories with stale files.
fn find_generation_file(path: &Path) -> Result<Option<PathBuf>> {
    for entry in fs::read_dir(path)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(OsStr::to_str);
        if ext != Some(generation::INDEX_EXT) && ext != Some(generation::DATA_EXT) {
            continue;
        }
        let numeric = path
            .file_stem()
            .and_then(OsStr::to_str)
            .map_or(false, |stem| stem.parse::<u64>().is_ok());
        if numeric {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
