// Page store: fixed-size paged file with a free-page allocator and the
// commit lock.
//
// Pages 0 and 1 hold two alternating header records; the live header is the
// one with the highest commit counter and a valid checksum. Everything else
// is page-id addressed data. Freed page ids are parked in a pending list
// colored by commit generation and only become allocatable after the header
// commit that ends their generation is durable, so a crash can never observe
// a reused page that an older header still references.
//
// The commit lock gates page dirtying (shared) against checkpointing
// (exclusive). It is fair so a checkpoint cannot be starved by a stream of
// writers.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{DbError, Result};
use crate::latch::Latch;

/// On-disk encoding version. A mismatch makes the database unopenable.
pub const ENCODING_VERSION: u32 = 0x54504C01;

const MAGIC: u32 = 0x5455_5045;

/// First allocatable page id; 0 and 1 are header pages, and 0 doubles as the
/// "unallocated" sentinel for in-memory nodes.
const FIRST_PAGE_ID: u64 = 2;

// Header field offsets.
const H_MAGIC: usize = 0;
const H_PAGE_SIZE: usize = 4;
const H_COMMIT_COUNTER: usize = 8;
/// The 12-byte engine record: encoding version then registry root page id,
/// both big-endian.
const H_ENGINE_RECORD: usize = 16;
const H_REDO_PAGE: usize = 28;
const H_REDO_OFF: usize = 36;
const H_REDO_POS: usize = 40;
const H_MASTER_UNDO: usize = 48;
const H_TOTAL_PAGES: usize = 56;
const H_FREE_COUNT: usize = 64;
const H_FREE_LIST: usize = 68;

/// Durable state handed to [`PageStore::commit`] and returned by
/// [`PageStore::open`] for recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitRecord {
    pub registry_root_id: u64,
    pub redo_page: u64,
    pub redo_off: u32,
    pub redo_pos: u64,
    pub master_undo_page: u64,
}

struct MemPages {
    pages: HashMap<u64, Box<[u8]>>,
    max_pages: u64,
}

enum Backing {
    File(File),
    Mem(Mutex<MemPages>),
}

struct AllocState {
    total_pages: u64,
    free: Vec<u64>,
    /// Pages deleted during the generation with the indexed parity. Drained
    /// into `free` by the commit that ends that generation.
    pending: [Vec<u64>; 2],
    gen_parity: usize,
    commit_counter: u64,
}

pub struct PageStore {
    backing: Backing,
    page_size: usize,
    state: Mutex<AllocState>,
    /// Shared: the holder may dirty pages. Exclusive: checkpoint in progress.
    pub commit_lock: Latch,
    /// Advisory lock file; held open for the lifetime of the store.
    _lock_file: Option<File>,
}

impl PageStore {
    /// Opens or creates the paged file named by the configuration, returning
    /// the store and the recovered commit record (`None` for a fresh file).
    pub fn open(config: &Config) -> Result<(PageStore, Option<CommitRecord>)> {
        let page_size = config.page_size;
        let Some(base) = &config.base_file else {
            return Ok((Self::new_mem(page_size, config.max_memory_pages), None));
        };

        let lock_file = acquire_lock_file(base)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(base)?;
        let len = file.metadata()?.len();

        let mut store = PageStore {
            backing: Backing::File(file),
            page_size,
            state: Mutex::new(AllocState {
                total_pages: FIRST_PAGE_ID,
                free: Vec::new(),
                pending: [Vec::new(), Vec::new()],
                gen_parity: 0,
                commit_counter: 0,
            }),
            commit_lock: Latch::new_fair(),
            _lock_file: lock_file,
        };

        if len == 0 {
            // Fresh database: write an initial empty header so that a crash
            // before the first checkpoint reopens as empty.
            store.commit(CommitRecord::default())?;
            return Ok((store, None));
        }

        let record = store.read_newest_header()?;
        Ok((store, Some(record)))
    }

    /// Creates a bounded non-durable store backed by process memory.
    pub fn new_mem(page_size: usize, max_pages: u64) -> PageStore {
        PageStore {
            backing: Backing::Mem(Mutex::new(MemPages {
                pages: HashMap::new(),
                max_pages,
            })),
            page_size,
            state: Mutex::new(AllocState {
                total_pages: FIRST_PAGE_ID,
                free: Vec::new(),
                pending: [Vec::new(), Vec::new()],
                gen_parity: 0,
                commit_counter: 0,
            }),
            commit_lock: Latch::new_fair(),
            _lock_file: None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    /// Reads a full page into `buf`. Reading a page that was never written
    /// yields zeroes, matching sparse-file behavior.
    pub fn read_page(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        match &self.backing {
            Backing::File(file) => {
                let off = id * self.page_size as u64;
                read_exact_at(file, buf, off)?;
            }
            Backing::Mem(mem) => {
                let mem = mem.lock();
                match mem.pages.get(&id) {
                    Some(page) => buf.copy_from_slice(page),
                    None => buf.fill(0),
                }
            }
        }
        Ok(())
    }

    /// Writes a full page.
    pub fn write_page(&self, id: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.write_bytes(id, 0, buf)
    }

    /// Writes a byte range within a page. Bytes outside the range are
    /// untouched, which the redo log relies on to never rewrite synced data.
    pub fn write_bytes(&self, id: u64, off: usize, bytes: &[u8]) -> Result<()> {
        debug_assert!(off + bytes.len() <= self.page_size);
        match &self.backing {
            Backing::File(file) => {
                let pos = id * self.page_size as u64 + off as u64;
                write_all_at(file, bytes, pos)?;
            }
            Backing::Mem(mem) => {
                let mut mem = mem.lock();
                let page_size = self.page_size;
                let page = mem
                    .pages
                    .entry(id)
                    .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
                page[off..off + bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    /// Reserves a page id for writing. The id is not visible to any durable
    /// header until a later [`commit`](Self::commit).
    pub fn reserve_page(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Ok(id);
        }
        if let Backing::Mem(mem) = &self.backing {
            if state.total_pages >= mem.lock().max_pages {
                return Err(DbError::DatabaseFull);
            }
        }
        let id = state.total_pages;
        state.total_pages += 1;
        Ok(id)
    }

    /// Releases a page id. It becomes allocatable again only after the
    /// checkpoint that ends the current commit generation is durable.
    pub fn delete_page(&self, id: u64) {
        debug_assert!(id >= FIRST_PAGE_ID);
        let mut state = self.state.lock();
        let parity = state.gen_parity;
        state.pending[parity].push(id);
    }

    /// Flips the commit generation. Called by the checkpoint while it holds
    /// the commit lock exclusively.
    pub fn flip_generation(&self) {
        let mut state = self.state.lock();
        state.gen_parity ^= 1;
    }

    /// Writes and syncs a new header record, then drains the prior
    /// generation's pending deletions into the free list.
    pub fn commit(&self, record: CommitRecord) -> Result<()> {
        let (counter, header, old_parity) = {
            let state = self.state.lock();
            let counter = state.commit_counter + 1;
            let old_parity = state.gen_parity ^ 1;

            let mut free: Vec<u64> = state.free.clone();
            free.extend_from_slice(&state.pending[old_parity]);

            let capacity = (self.page_size - H_FREE_LIST - 4) / 8;
            if free.len() > capacity {
                warn!(
                    dropped = free.len() - capacity,
                    "free list exceeds header capacity; excess ids leak on reopen"
                );
                free.truncate(capacity);
            }

            let mut header = vec![0u8; self.page_size];
            header[H_MAGIC..H_MAGIC + 4].copy_from_slice(&MAGIC.to_be_bytes());
            header[H_PAGE_SIZE..H_PAGE_SIZE + 4]
                .copy_from_slice(&(self.page_size as u32).to_be_bytes());
            header[H_COMMIT_COUNTER..H_COMMIT_COUNTER + 8]
                .copy_from_slice(&counter.to_be_bytes());
            header[H_ENGINE_RECORD..H_ENGINE_RECORD + 4]
                .copy_from_slice(&ENCODING_VERSION.to_be_bytes());
            header[H_ENGINE_RECORD + 4..H_ENGINE_RECORD + 12]
                .copy_from_slice(&record.registry_root_id.to_be_bytes());
            header[H_REDO_PAGE..H_REDO_PAGE + 8]
                .copy_from_slice(&record.redo_page.to_be_bytes());
            header[H_REDO_OFF..H_REDO_OFF + 4]
                .copy_from_slice(&record.redo_off.to_be_bytes());
            header[H_REDO_POS..H_REDO_POS + 8]
                .copy_from_slice(&record.redo_pos.to_be_bytes());
            header[H_MASTER_UNDO..H_MASTER_UNDO + 8]
                .copy_from_slice(&record.master_undo_page.to_be_bytes());
            header[H_TOTAL_PAGES..H_TOTAL_PAGES + 8]
                .copy_from_slice(&state.total_pages.to_be_bytes());
            header[H_FREE_COUNT..H_FREE_COUNT + 4]
                .copy_from_slice(&(free.len() as u32).to_be_bytes());
            let mut off = H_FREE_LIST;
            for id in &free {
                header[off..off + 8].copy_from_slice(&id.to_be_bytes());
                off += 8;
            }
            let crc = crc32fast::hash(&header[..self.page_size - 4]);
            let crc_at = self.page_size - 4;
            header[crc_at..].copy_from_slice(&crc.to_be_bytes());

            (counter, header, old_parity)
        };

        let slot = counter % 2;
        self.write_page(slot, &header)?;
        self.sync()?;

        // The header is durable; the old generation's deletions are now safe
        // to hand out again.
        let mut state = self.state.lock();
        state.commit_counter = counter;
        let drained = std::mem::take(&mut state.pending[old_parity]);
        state.free.extend(drained);
        debug!(counter, "page store header committed");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if let Backing::File(file) = &self.backing {
            file.sync_all()?;
        }
        Ok(())
    }

    fn read_newest_header(&mut self) -> Result<CommitRecord> {
        let mut newest: Option<(u64, CommitRecord, Vec<u64>, u64)> = None;
        let mut buf = vec![0u8; self.page_size];
        for slot in 0..2u64 {
            self.read_page(slot, &mut buf)?;
            match self.parse_header(&buf) {
                Ok(parsed) => {
                    if newest.as_ref().map_or(true, |(c, ..)| parsed.0 > *c) {
                        newest = Some(parsed);
                    }
                }
                Err(err) => debug!(slot, %err, "header slot rejected"),
            }
        }
        let Some((counter, record, free, total_pages)) = newest else {
            return Err(DbError::CorruptPageStore(
                "no valid header record".into(),
            ));
        };
        let mut state = self.state.lock();
        state.commit_counter = counter;
        state.total_pages = total_pages;
        state.free = free;
        Ok(record)
    }

    fn parse_header(&self, buf: &[u8]) -> Result<(u64, CommitRecord, Vec<u64>, u64)> {
        let crc_at = self.page_size - 4;
        let stored = u32::from_be_bytes(buf[crc_at..].try_into().unwrap());
        if crc32fast::hash(&buf[..crc_at]) != stored {
            return Err(DbError::CorruptPageStore("header checksum mismatch".into()));
        }
        if read_u32(buf, H_MAGIC) != MAGIC {
            return Err(DbError::CorruptPageStore("bad magic".into()));
        }
        if read_u32(buf, H_PAGE_SIZE) as usize != self.page_size {
            return Err(DbError::CorruptPageStore(format!(
                "page size mismatch: file has {}",
                read_u32(buf, H_PAGE_SIZE)
            )));
        }
        let version = read_u32(buf, H_ENGINE_RECORD);
        if version != ENCODING_VERSION {
            return Err(DbError::CorruptPageStore(format!(
                "unknown encoding version {version:#x}"
            )));
        }
        let record = CommitRecord {
            registry_root_id: read_u64(buf, H_ENGINE_RECORD + 4),
            redo_page: read_u64(buf, H_REDO_PAGE),
            redo_off: read_u32(buf, H_REDO_OFF),
            redo_pos: read_u64(buf, H_REDO_POS),
            master_undo_page: read_u64(buf, H_MASTER_UNDO),
        };
        let total_pages = read_u64(buf, H_TOTAL_PAGES);
        let count = read_u32(buf, H_FREE_COUNT) as usize;
        let capacity = (self.page_size - H_FREE_LIST - 4) / 8;
        if count > capacity {
            return Err(DbError::CorruptPageStore("free list overruns header".into()));
        }
        let mut free = Vec::with_capacity(count);
        for i in 0..count {
            free.push(read_u64(buf, H_FREE_LIST + i * 8));
        }
        Ok((read_u64(buf, H_COMMIT_COUNTER), record, free, total_pages))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    // Reads past EOF yield zeroes, matching sparse pages.
    let mut read = 0;
    while read < buf.len() {
        match file.read_at(&mut buf[read..], off + read as u64) {
            Ok(0) => {
                buf[read..].fill(0);
                return Ok(());
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, off)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        match file.seek_read(&mut buf[read..], off + read as u64) {
            Ok(0) => {
                buf[read..].fill(0);
                return Ok(());
            }
            Ok(n) => read += n,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        written += file.seek_write(&buf[written..], off + written as u64)?;
    }
    Ok(())
}

/// Opens `<base>.lock` and takes an exclusive advisory lock on it, so two
/// processes cannot open the same database.
fn acquire_lock_file(base: &Path) -> Result<Option<File>> {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    let path: PathBuf = base.with_file_name(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(DbError::IllegalState(format!(
                "database is locked by another process: {}",
                path.display()
            )));
        }
    }
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(dir: &tempfile::TempDir) -> Config {
        Config::new().base_file(dir.path().join("test.db"))
    }

    #[test]
    fn test_fresh_open_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);
        {
            let (store, recovered) = PageStore::open(&config).unwrap();
            assert!(recovered.is_none());
            let id = store.reserve_page().unwrap();
            assert_eq!(id, FIRST_PAGE_ID);
            let page = vec![7u8; store.page_size()];
            store.write_page(id, &page).unwrap();
            store
                .commit(CommitRecord {
                    registry_root_id: id,
                    ..Default::default()
                })
                .unwrap();
        }
        let (store, recovered) = PageStore::open(&config).unwrap();
        let record = recovered.unwrap();
        assert_eq!(record.registry_root_id, FIRST_PAGE_ID);
        let mut buf = vec![0u8; store.page_size()];
        store.read_page(FIRST_PAGE_ID, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn test_deleted_page_not_reused_before_commit() {
        let store = PageStore::new_mem(4096, 1024);
        let id = store.reserve_page().unwrap();
        store.delete_page(id);
        let next = store.reserve_page().unwrap();
        assert_ne!(id, next);

        // A checkpoint flips the generation and commits; only then is the
        // deleted id allocatable again.
        store.flip_generation();
        store.commit(CommitRecord::default()).unwrap();
        let reused = store.reserve_page().unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn test_delete_during_new_generation_survives_commit() {
        let store = PageStore::new_mem(4096, 1024);
        let id = store.reserve_page().unwrap();
        store.flip_generation();
        // Deleted after the flip: belongs to the new generation.
        store.delete_page(id);
        store.commit(CommitRecord::default()).unwrap();
        assert_ne!(store.reserve_page().unwrap(), id);
        store.flip_generation();
        store.commit(CommitRecord::default()).unwrap();
        assert_eq!(store.reserve_page().unwrap(), id);
    }

    #[test]
    fn test_mem_store_full() {
        let store = PageStore::new_mem(4096, 3);
        store.reserve_page().unwrap();
        assert!(matches!(
            store.reserve_page(),
            Err(DbError::DatabaseFull)
        ));
    }

    #[test]
    fn test_second_open_blocked_by_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);
        let (_store, _) = PageStore::open(&config).unwrap();
        assert!(matches!(
            PageStore::open(&config),
            Err(DbError::IllegalState(_))
        ));
    }

    #[test]
    fn test_partial_write_leaves_rest_untouched() {
        let store = PageStore::new_mem(4096, 16);
        let id = store.reserve_page().unwrap();
        store.write_page(id, &vec![9u8; 4096]).unwrap();
        store.write_bytes(id, 100, &[1, 2, 3]).unwrap();
        let mut buf = vec![0u8; 4096];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(&buf[100..103], &[1, 2, 3]);
        assert_eq!(buf[99], 9);
        assert_eq!(buf[103], 9);
    }
}
