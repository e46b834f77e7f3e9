// Redo log.
//
// An append-only record stream stored inside the pages file as a chain of
// reserved pages. Each chain page starts with an 8-byte next-page link;
// records flow across page boundaries. Every record carries its 64-bit
// logical position and a trailing crc32, so replay can tell a truncated
// crash tail (stop quietly) and a stale recycled page (position mismatch,
// stop) apart from live records.
//
// Flushing writes only the new bytes at their exact page offsets; bytes
// that an earlier sync made durable are never rewritten.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DurabilityMode;
use crate::error::Result;
use crate::storage::PageStore;

const OP_STORE: u8 = 1;
const OP_COMMIT: u8 = 2;
const OP_ROLLBACK: u8 = 3;
const OP_ENTER: u8 = 4;
const OP_EXIT: u8 = 5;
const OP_CHECKPOINT_MARK: u8 = 6;
const OP_CUSTOM: u8 = 7;

/// Next-page link at the head of every chain page.
const PAGE_LINK: usize = 8;

/// Value-length sentinel encoding a delete.
const DELETE_MARK: u32 = u32::MAX;

/// Guard against decoding absurd lengths from a recycled page.
const MAX_FIELD: u32 = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    Store {
        txn_id: u64,
        index_id: u64,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Commit {
        txn_id: u64,
    },
    Rollback {
        txn_id: u64,
    },
    Enter {
        txn_id: u64,
    },
    Exit {
        txn_id: u64,
    },
    CheckpointMark {
        root_id: u64,
    },
    Custom {
        handler_id: u32,
        payload: Vec<u8>,
    },
}

struct RedoState {
    /// Bytes appended but not yet written to chain pages.
    buf: Vec<u8>,
    /// Chain page currently being filled and the next free offset in it.
    head_page: u64,
    head_off: usize,
    /// Logical position one past the last appended byte.
    position: u64,
    /// Chain pages since the last trim, oldest first.
    chain: Vec<u64>,
}

/// Snapshot of the stream taken at a checkpoint flip.
#[derive(Debug, Clone, Copy)]
pub struct RedoPosition {
    pub page: u64,
    pub off: u32,
    pub position: u64,
}

pub struct RedoLog {
    store: Arc<PageStore>,
    state: Mutex<RedoState>,
}

impl RedoLog {
    /// Starts a fresh log on a newly reserved chain page.
    pub fn create(store: Arc<PageStore>) -> Result<RedoLog> {
        let first = store.reserve_page()?;
        store.write_bytes(first, 0, &0u64.to_be_bytes())?;
        Ok(RedoLog {
            store,
            state: Mutex::new(RedoState {
                buf: Vec::new(),
                head_page: first,
                head_off: PAGE_LINK,
                position: 0,
                chain: vec![first],
            }),
        })
    }

    /// Resumes a log at the stream state where recovery replay stopped.
    pub fn recovered(
        store: Arc<PageStore>,
        head_page: u64,
        head_off: usize,
        position: u64,
        chain: Vec<u64>,
    ) -> RedoLog {
        RedoLog {
            store,
            state: Mutex::new(RedoState {
                buf: Vec::new(),
                head_page,
                head_off,
                position,
                chain,
            }),
        }
    }

    /// Appends a record, returning its position. Buffered until flushed.
    pub fn append(&self, op: &RedoOp) -> u64 {
        let mut state = self.state.lock();
        let position = state.position;
        let mut record = Vec::with_capacity(32);
        record.extend_from_slice(&position.to_be_bytes());
        match op {
            RedoOp::Store {
                txn_id,
                index_id,
                key,
                value,
            } => {
                record.push(OP_STORE);
                record.extend_from_slice(&txn_id.to_be_bytes());
                record.extend_from_slice(&index_id.to_be_bytes());
                record.extend_from_slice(&(key.len() as u32).to_be_bytes());
                record.extend_from_slice(key);
                match value {
                    Some(v) => {
                        record.extend_from_slice(&(v.len() as u32).to_be_bytes());
                        record.extend_from_slice(v);
                    }
                    None => record.extend_from_slice(&DELETE_MARK.to_be_bytes()),
                }
            }
            RedoOp::Commit { txn_id } => {
                record.push(OP_COMMIT);
                record.extend_from_slice(&txn_id.to_be_bytes());
            }
            RedoOp::Rollback { txn_id } => {
                record.push(OP_ROLLBACK);
                record.extend_from_slice(&txn_id.to_be_bytes());
            }
            RedoOp::Enter { txn_id } => {
                record.push(OP_ENTER);
                record.extend_from_slice(&txn_id.to_be_bytes());
            }
            RedoOp::Exit { txn_id } => {
                record.push(OP_EXIT);
                record.extend_from_slice(&txn_id.to_be_bytes());
            }
            RedoOp::CheckpointMark { root_id } => {
                record.push(OP_CHECKPOINT_MARK);
                record.extend_from_slice(&root_id.to_be_bytes());
            }
            RedoOp::Custom {
                handler_id,
                payload,
            } => {
                record.push(OP_CUSTOM);
                record.extend_from_slice(&handler_id.to_be_bytes());
                record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                record.extend_from_slice(payload);
            }
        }
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_be_bytes());
        state.position += record.len() as u64;
        state.buf.extend_from_slice(&record);
        position
    }

    /// Writes buffered bytes into the page chain.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut RedoState) -> Result<()> {
        let page_size = self.store.page_size();
        let mut at = 0usize;
        while at < state.buf.len() {
            let space = page_size - state.head_off;
            if space == 0 {
                let next = self.store.reserve_page()?;
                self.store.write_bytes(next, 0, &0u64.to_be_bytes())?;
                self.store
                    .write_bytes(state.head_page, 0, &next.to_be_bytes())?;
                state.head_page = next;
                state.head_off = PAGE_LINK;
                state.chain.push(next);
                continue;
            }
            let take = space.min(state.buf.len() - at);
            self.store
                .write_bytes(state.head_page, state.head_off, &state.buf[at..at + take])?;
            state.head_off += take;
            at += take;
        }
        state.buf.clear();
        Ok(())
    }

    /// Applies the durability level a committing transaction asked for.
    pub fn commit_flush(&self, mode: DurabilityMode) -> Result<()> {
        match mode {
            DurabilityMode::Sync => {
                self.flush()?;
                self.store.sync()
            }
            DurabilityMode::NoSync => self.flush(),
            DurabilityMode::NoFlush | DurabilityMode::NoLog | DurabilityMode::NoRedo => Ok(()),
        }
    }

    /// Flushes everything and reports the position of the next record.
    /// Called with the commit lock held exclusively, so no appends race.
    pub fn checkpoint_position(&self) -> Result<RedoPosition> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;
        Ok(RedoPosition {
            page: state.head_page,
            off: state.head_off as u32,
            position: state.position,
        })
    }

    /// Releases chain pages strictly before `page`. Called after the header
    /// referencing `page` is durable.
    pub fn trim_before(&self, page: u64) {
        let mut state = self.state.lock();
        let Some(keep) = state.chain.iter().position(|&p| p == page) else {
            return;
        };
        for old in state.chain.drain(..keep) {
            debug!(page = old, "releasing redo chain page");
            self.store.delete_page(old);
        }
    }
}

/// Forward reader over the record stream, lenient about the crash tail.
pub struct RedoReader<'a> {
    store: &'a PageStore,
    page_buf: Vec<u8>,
    page: u64,
    off: usize,
    position: u64,
    pages_seen: Vec<u64>,
    ended: bool,
}

impl<'a> RedoReader<'a> {
    pub fn new(store: &'a PageStore, start: RedoPosition) -> Result<RedoReader<'a>> {
        let mut page_buf = vec![0u8; store.page_size()];
        store.read_page(start.page, &mut page_buf)?;
        Ok(RedoReader {
            store,
            page_buf,
            page: start.page,
            off: start.off as usize,
            position: start.position,
            pages_seen: vec![start.page],
            ended: false,
        })
    }

    /// Stream state after reading stopped: (page, offset, position, pages).
    pub fn finish(self) -> (u64, usize, u64, Vec<u64>) {
        (self.page, self.off, self.position, self.pages_seen)
    }

    fn take(&mut self, n: usize, record: &mut Vec<u8>) -> Result<bool> {
        let mut remaining = n;
        while remaining > 0 {
            let space = self.page_buf.len() - self.off;
            if space == 0 {
                let next = u64::from_be_bytes(self.page_buf[..8].try_into().unwrap());
                if next == 0 {
                    return Ok(false);
                }
                self.store.read_page(next, &mut self.page_buf)?;
                self.page = next;
                self.off = PAGE_LINK;
                self.pages_seen.push(next);
                continue;
            }
            let take = space.min(remaining);
            record.extend_from_slice(&self.page_buf[self.off..self.off + take]);
            self.off += take;
            remaining -= take;
        }
        Ok(true)
    }

    /// Next record, or `None` at the end of the intact stream. A truncated
    /// or corrupt tail ends replay without an error; only unreadable pages
    /// are fatal.
    pub fn next(&mut self) -> Result<Option<RedoOp>> {
        if self.ended {
            return Ok(None);
        }
        let rollback = (self.page, self.off, self.position);
        match self.read_record() {
            Ok(Some(op)) => Ok(Some(op)),
            Ok(None) => {
                self.ended = true;
                // Rewind to the start of the partial record; new appends
                // continue from the last intact one.
                self.page = rollback.0;
                self.off = rollback.1;
                self.position = rollback.2;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn read_record(&mut self) -> Result<Option<RedoOp>> {
        let mut record = Vec::with_capacity(64);
        if !self.take(8, &mut record)? {
            return Ok(None);
        }
        let pos = u64::from_be_bytes(record[..8].try_into().unwrap());
        if pos != self.position {
            debug!(
                expected = self.position,
                found = pos,
                "redo position mismatch; end of stream"
            );
            return Ok(None);
        }
        if !self.take(1, &mut record)? {
            return Ok(None);
        }
        let op = record[8];
        let parsed = match op {
            OP_STORE => {
                if !self.take(20, &mut record)? {
                    return Ok(None);
                }
                let txn_id = be_u64(&record[9..17]);
                let index_id = be_u64(&record[17..25]);
                let klen = be_u32(&record[25..29]);
                if klen > MAX_FIELD {
                    return Ok(None);
                }
                let kstart = record.len();
                if !self.take(klen as usize + 4, &mut record)? {
                    return Ok(None);
                }
                let key = record[kstart..kstart + klen as usize].to_vec();
                let vlen = be_u32(&record[kstart + klen as usize..kstart + klen as usize + 4]);
                let value = if vlen == DELETE_MARK {
                    None
                } else {
                    if vlen > MAX_FIELD {
                        return Ok(None);
                    }
                    let vstart = record.len();
                    if !self.take(vlen as usize, &mut record)? {
                        return Ok(None);
                    }
                    Some(record[vstart..vstart + vlen as usize].to_vec())
                };
                RedoOp::Store {
                    txn_id,
                    index_id,
                    key,
                    value,
                }
            }
            OP_COMMIT | OP_ROLLBACK | OP_ENTER | OP_EXIT => {
                if !self.take(8, &mut record)? {
                    return Ok(None);
                }
                let txn_id = be_u64(&record[9..17]);
                match op {
                    OP_COMMIT => RedoOp::Commit { txn_id },
                    OP_ROLLBACK => RedoOp::Rollback { txn_id },
                    OP_ENTER => RedoOp::Enter { txn_id },
                    _ => RedoOp::Exit { txn_id },
                }
            }
            OP_CHECKPOINT_MARK => {
                if !self.take(8, &mut record)? {
                    return Ok(None);
                }
                RedoOp::CheckpointMark {
                    root_id: be_u64(&record[9..17]),
                }
            }
            OP_CUSTOM => {
                if !self.take(8, &mut record)? {
                    return Ok(None);
                }
                let handler_id = be_u32(&record[9..13]);
                let plen = be_u32(&record[13..17]);
                if plen > MAX_FIELD {
                    return Ok(None);
                }
                let pstart = record.len();
                if !self.take(plen as usize, &mut record)? {
                    return Ok(None);
                }
                RedoOp::Custom {
                    handler_id,
                    payload: record[pstart..pstart + plen as usize].to_vec(),
                }
            }
            _ => {
                warn!(op, position = self.position, "unknown redo op; end of stream");
                return Ok(None);
            }
        };

        let body_len = record.len();
        let mut crc_bytes = Vec::with_capacity(4);
        if !self.take(4, &mut crc_bytes)? {
            return Ok(None);
        }
        let stored = be_u32(&crc_bytes);
        if crc32fast::hash(&record) != stored {
            warn!(position = self.position, "redo checksum mismatch; end of stream");
            return Ok(None);
        }
        self.position += (body_len + 4) as u64;
        Ok(Some(parsed))
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes(b[..4].try_into().unwrap())
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes(b[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_log() -> (Arc<PageStore>, RedoLog) {
        let store = Arc::new(PageStore::new_mem(512, 4096));
        let log = RedoLog::create(Arc::clone(&store)).unwrap();
        (store, log)
    }

    #[test]
    fn test_append_flush_replay() {
        let (store, log) = mem_log();
        let ops = vec![
            RedoOp::Enter { txn_id: 7 },
            RedoOp::Store {
                txn_id: 7,
                index_id: 3,
                key: b"hello".to_vec(),
                value: Some(b"world".to_vec()),
            },
            RedoOp::Store {
                txn_id: 7,
                index_id: 3,
                key: b"gone".to_vec(),
                value: None,
            },
            RedoOp::Commit { txn_id: 7 },
        ];
        for op in &ops {
            log.append(op);
        }
        log.flush().unwrap();

        let mut reader = RedoReader::new(
            &store,
            RedoPosition {
                page: 2,
                off: PAGE_LINK as u32,
                position: 0,
            },
        )
        .unwrap();
        let mut seen = Vec::new();
        while let Some(op) = reader.next().unwrap() {
            seen.push(op);
        }
        assert_eq!(seen, ops);
    }

    #[test]
    fn test_records_span_pages() {
        let (store, log) = mem_log();
        // Each record is ~100 bytes on a 512-byte page; force several links.
        let mut ops = Vec::new();
        for i in 0..40u64 {
            let op = RedoOp::Store {
                txn_id: i,
                index_id: 1,
                key: vec![b'k'; 30],
                value: Some(vec![i as u8; 40]),
            };
            log.append(&op);
            ops.push(op);
        }
        log.flush().unwrap();

        let mut reader = RedoReader::new(
            &store,
            RedoPosition {
                page: 2,
                off: PAGE_LINK as u32,
                position: 0,
            },
        )
        .unwrap();
        let mut count = 0;
        while let Some(op) = reader.next().unwrap() {
            assert_eq!(op, ops[count]);
            count += 1;
        }
        assert_eq!(count, 40);
    }

    #[test]
    fn test_truncated_tail_is_not_corruption() {
        let (store, log) = mem_log();
        log.append(&RedoOp::Commit { txn_id: 1 });
        log.flush().unwrap();
        let full = log.checkpoint_position().unwrap();

        // Simulate a torn tail: a second record flushed with its last bytes
        // clobbered.
        log.append(&RedoOp::Store {
            txn_id: 2,
            index_id: 1,
            key: b"abc".to_vec(),
            value: Some(b"def".to_vec()),
        });
        log.flush().unwrap();
        store
            .write_bytes(full.page, full.off as usize + 10, &[0xAA; 8])
            .unwrap();

        let mut reader = RedoReader::new(
            &store,
            RedoPosition {
                page: 2,
                off: PAGE_LINK as u32,
                position: 0,
            },
        )
        .unwrap();
        assert_eq!(
            reader.next().unwrap(),
            Some(RedoOp::Commit { txn_id: 1 })
        );
        assert_eq!(reader.next().unwrap(), None);
        let (page, off, position, _) = reader.finish();
        assert_eq!((page, off as u32, position), (full.page, full.off, full.position));
    }

    #[test]
    fn test_checkpoint_trim_releases_pages() {
        let (store, log) = mem_log();
        for i in 0..40u64 {
            log.append(&RedoOp::Store {
                txn_id: i,
                index_id: 1,
                key: vec![b'k'; 30],
                value: Some(vec![1u8; 40]),
            });
        }
        let pos = log.checkpoint_position().unwrap();
        assert!(pos.page > 2);
        log.trim_before(pos.page);
        // Old chain pages are pending until the store commits a header.
        store.flip_generation();
        store.commit(Default::default()).unwrap();
        let reused = store.reserve_page().unwrap();
        assert!(reused < pos.page);
    }
}
