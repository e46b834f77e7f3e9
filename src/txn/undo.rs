// Undo log.
//
// Each writing transaction keeps its undo actions twice: an in-memory list
// used by live rollback, and a backward-linked chain of pages in the page
// store used by crash recovery. Chain pages carry a previous-page link and a
// used-byte count, so a chain can be reassembled oldest-first regardless of
// where checkpoints sealed partial pages.
//
// At a checkpoint flip the partial tail is written out and sealed, anchors
// for every active transaction are collected onto master undo pages, and the
// header points at them. Undo application is idempotent, which recovery
// relies on when replayed operations regenerate actions that live rollback
// already applied.

use std::sync::Arc;

use tracing::debug;

use crate::error::{DbError, Result};
use crate::storage::PageStore;

const OP_UNINSERT: u8 = 1;
const OP_UNUPDATE: u8 = 2;
const OP_UNDELETE: u8 = 3;

/// Undo page: previous-page link, then the used-byte count of the data area.
const U_PREV: usize = 0;
const U_USED: usize = 8;
const U_DATA: usize = 10;

/// Master undo page: next-page link, then the entry count.
const M_NEXT: usize = 0;
const M_COUNT: usize = 8;
const M_DATA: usize = 12;
const M_ENTRY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecord {
    /// Rollback deletes the freshly inserted key.
    Uninsert { index_id: u64, key: Vec<u8> },
    /// Rollback restores the previous value.
    Unupdate {
        index_id: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Rollback restores the value a delete turned into a ghost.
    Undelete {
        index_id: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl UndoRecord {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let (op, index_id, key, value) = match self {
            UndoRecord::Uninsert { index_id, key } => (OP_UNINSERT, index_id, key, None),
            UndoRecord::Unupdate {
                index_id,
                key,
                value,
            } => (OP_UNUPDATE, index_id, key, Some(value)),
            UndoRecord::Undelete {
                index_id,
                key,
                value,
            } => (OP_UNDELETE, index_id, key, Some(value)),
        };
        buf.push(op);
        buf.extend_from_slice(&index_id.to_be_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
    }
}

pub struct UndoLog {
    store: Arc<PageStore>,
    /// In-memory mirror, oldest first. Live rollback pops from the end.
    records: Vec<UndoRecord>,
    /// Encoded bytes not yet written to a chain page.
    buf: Vec<u8>,
    /// Most recently written chain page; 0 when none.
    top_page: u64,
    /// Every chain page written, for release on commit or rollback.
    pages: Vec<u64>,
}

impl UndoLog {
    pub fn new(store: Arc<PageStore>) -> UndoLog {
        UndoLog {
            store,
            records: Vec::new(),
            buf: Vec::new(),
            top_page: 0,
            pages: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends an undo action. The caller holds the shared commit lock, so
    /// page writes here never race a checkpoint flip.
    pub fn push(&mut self, record: UndoRecord) -> Result<()> {
        record.encode_into(&mut self.buf);
        self.records.push(record);
        let cap = self.store.page_size() - U_DATA;
        while self.buf.len() >= cap {
            let rest = self.buf.split_off(cap);
            let full = std::mem::replace(&mut self.buf, rest);
            self.write_chain_page(&full)?;
        }
        Ok(())
    }

    fn write_chain_page(&mut self, data: &[u8]) -> Result<()> {
        let page = self.store.reserve_page()?;
        let mut image = vec![0u8; self.store.page_size()];
        image[U_PREV..U_PREV + 8].copy_from_slice(&self.top_page.to_be_bytes());
        image[U_USED..U_USED + 2].copy_from_slice(&(data.len() as u16).to_be_bytes());
        image[U_DATA..U_DATA + data.len()].copy_from_slice(data);
        self.store.write_page(page, &image)?;
        self.top_page = page;
        self.pages.push(page);
        Ok(())
    }

    /// Seals the partial tail and returns this transaction's recovery
    /// anchor. Called during the checkpoint's exclusive phase.
    pub fn checkpoint_anchor(&mut self) -> Result<Option<u64>> {
        if !self.buf.is_empty() {
            let data = std::mem::take(&mut self.buf);
            self.write_chain_page(&data)?;
        }
        Ok(if self.top_page == 0 {
            None
        } else {
            Some(self.top_page)
        })
    }

    /// Drains the newest records down to `keep`, newest first, for rollback.
    pub fn drain_to(&mut self, keep: usize) -> Vec<UndoRecord> {
        let mut drained = self.records.split_off(keep);
        drained.reverse();
        drained
    }

    /// Releases the persisted chain. Called at commit or full rollback; the
    /// pages stay unreusable until the next checkpoint commits.
    pub fn discard(&mut self) {
        for page in self.pages.drain(..) {
            self.store.delete_page(page);
        }
        self.top_page = 0;
        self.buf.clear();
        self.records.clear();
    }
}

/// Writes the master undo pages for a checkpoint: every active transaction
/// id with its chain anchor. Returns the first page id (0 when there is
/// nothing to record) plus every page written, so the next checkpoint can
/// retire them.
pub fn write_master_undo(store: &PageStore, anchors: &[(u64, u64)]) -> Result<(u64, Vec<u64>)> {
    if anchors.is_empty() {
        return Ok((0, Vec::new()));
    }
    let per_page = (store.page_size() - M_DATA) / M_ENTRY;
    let mut first = 0u64;
    let mut pages = Vec::new();
    let mut prev: Option<(u64, Vec<u8>)> = None;
    for chunk in anchors.chunks(per_page) {
        let page = store.reserve_page()?;
        pages.push(page);
        let mut image = vec![0u8; store.page_size()];
        image[M_COUNT..M_COUNT + 4].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
        let mut at = M_DATA;
        for (txn_id, top_page) in chunk {
            image[at..at + 8].copy_from_slice(&txn_id.to_be_bytes());
            image[at + 8..at + 16].copy_from_slice(&top_page.to_be_bytes());
            at += M_ENTRY;
        }
        if let Some((prev_page, mut prev_image)) = prev.take() {
            prev_image[M_NEXT..M_NEXT + 8].copy_from_slice(&page.to_be_bytes());
            store.write_page(prev_page, &prev_image)?;
        }
        if first == 0 {
            first = page;
        }
        prev = Some((page, image));
    }
    if let Some((page, image)) = prev {
        store.write_page(page, &image)?;
    }
    debug!(count = anchors.len(), first, "master undo written");
    Ok((first, pages))
}

/// Reads the master undo chain back into anchors, also returning the chain
/// page ids.
pub fn read_master_undo(store: &PageStore, mut page: u64) -> Result<(Vec<(u64, u64)>, Vec<u64>)> {
    let mut anchors = Vec::new();
    let mut pages = Vec::new();
    let mut buf = vec![0u8; store.page_size()];
    while page != 0 {
        pages.push(page);
        store.read_page(page, &mut buf)?;
        let count = u32::from_be_bytes(buf[M_COUNT..M_COUNT + 4].try_into().unwrap()) as usize;
        let per_page = (store.page_size() - M_DATA) / M_ENTRY;
        if count > per_page {
            return Err(DbError::CorruptPageStore(
                "master undo entry count overruns page".into(),
            ));
        }
        let mut at = M_DATA;
        for _ in 0..count {
            let txn_id = u64::from_be_bytes(buf[at..at + 8].try_into().unwrap());
            let top = u64::from_be_bytes(buf[at + 8..at + 16].try_into().unwrap());
            anchors.push((txn_id, top));
            at += M_ENTRY;
        }
        page = u64::from_be_bytes(buf[M_NEXT..M_NEXT + 8].try_into().unwrap());
    }
    Ok((anchors, pages))
}

/// Reassembles a persisted undo chain into records (oldest first) plus the
/// chain's page ids for release after rollback.
pub fn read_chain(store: &PageStore, top_page: u64) -> Result<(Vec<UndoRecord>, Vec<u64>)> {
    let mut pages = Vec::new();
    let mut datas: Vec<Vec<u8>> = Vec::new();
    let mut buf = vec![0u8; store.page_size()];
    let mut page = top_page;
    while page != 0 {
        store.read_page(page, &mut buf)?;
        let used = u16::from_be_bytes(buf[U_USED..U_USED + 2].try_into().unwrap()) as usize;
        if U_DATA + used > store.page_size() {
            return Err(DbError::CorruptPageStore(
                "undo page used count overruns page".into(),
            ));
        }
        pages.push(page);
        datas.push(buf[U_DATA..U_DATA + used].to_vec());
        page = u64::from_be_bytes(buf[U_PREV..U_PREV + 8].try_into().unwrap());
    }
    // Chain is walked newest first; the stream is oldest first.
    datas.reverse();
    let stream: Vec<u8> = datas.concat();
    let mut records = Vec::new();
    let mut at = 0usize;
    while at < stream.len() {
        let (record, next) = decode_record(&stream, at)?;
        records.push(record);
        at = next;
    }
    Ok((records, pages))
}

fn decode_record(stream: &[u8], at: usize) -> Result<(UndoRecord, usize)> {
    let corrupt = || DbError::CorruptPageStore("truncated undo record".into());
    let need = |end: usize| {
        if end > stream.len() {
            Err(corrupt())
        } else {
            Ok(())
        }
    };
    need(at + 13)?;
    let op = stream[at];
    let index_id = u64::from_be_bytes(stream[at + 1..at + 9].try_into().unwrap());
    let klen = u32::from_be_bytes(stream[at + 9..at + 13].try_into().unwrap()) as usize;
    need(at + 13 + klen)?;
    let key = stream[at + 13..at + 13 + klen].to_vec();
    let mut next = at + 13 + klen;
    let record = match op {
        OP_UNINSERT => UndoRecord::Uninsert { index_id, key },
        OP_UNUPDATE | OP_UNDELETE => {
            need(next + 4)?;
            let vlen =
                u32::from_be_bytes(stream[next..next + 4].try_into().unwrap()) as usize;
            need(next + 4 + vlen)?;
            let value = stream[next + 4..next + 4 + vlen].to_vec();
            next += 4 + vlen;
            if op == OP_UNUPDATE {
                UndoRecord::Unupdate {
                    index_id,
                    key,
                    value,
                }
            } else {
                UndoRecord::Undelete {
                    index_id,
                    key,
                    value,
                }
            }
        }
        other => {
            return Err(DbError::CorruptPageStore(format!(
                "unknown undo op {other:#x}"
            )))
        }
    };
    Ok((record, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_anchor_read_chain() {
        let store = Arc::new(PageStore::new_mem(512, 4096));
        let mut log = UndoLog::new(Arc::clone(&store));
        let mut expected = Vec::new();
        for i in 0..30u8 {
            let record = UndoRecord::Unupdate {
                index_id: 5,
                key: vec![b'k', i],
                value: vec![i; 40],
            };
            log.push(record.clone()).unwrap();
            expected.push(record);
        }
        let anchor = log.checkpoint_anchor().unwrap().unwrap();
        let (records, pages) = read_chain(&store, anchor).unwrap();
        assert_eq!(records, expected);
        assert!(pages.len() >= 2);
    }

    #[test]
    fn test_appends_after_seal_start_new_page() {
        let store = Arc::new(PageStore::new_mem(512, 4096));
        let mut log = UndoLog::new(Arc::clone(&store));
        log.push(UndoRecord::Uninsert {
            index_id: 1,
            key: b"a".to_vec(),
        })
        .unwrap();
        let first_anchor = log.checkpoint_anchor().unwrap().unwrap();
        log.push(UndoRecord::Uninsert {
            index_id: 1,
            key: b"b".to_vec(),
        })
        .unwrap();
        let second_anchor = log.checkpoint_anchor().unwrap().unwrap();
        assert_ne!(first_anchor, second_anchor);

        // The earlier anchor still reads exactly the records it covered.
        let (records, _) = read_chain(&store, first_anchor).unwrap();
        assert_eq!(records.len(), 1);
        let (records, _) = read_chain(&store, second_anchor).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_drain_for_rollback_is_newest_first() {
        let store = Arc::new(PageStore::new_mem(512, 4096));
        let mut log = UndoLog::new(store);
        for i in 0..4u8 {
            log.push(UndoRecord::Uninsert {
                index_id: 1,
                key: vec![i],
            })
            .unwrap();
        }
        let drained = log.drain_to(1);
        assert_eq!(drained.len(), 3);
        assert_eq!(
            drained[0],
            UndoRecord::Uninsert {
                index_id: 1,
                key: vec![3]
            }
        );
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_master_undo_round_trip() {
        let store = PageStore::new_mem(512, 4096);
        let anchors: Vec<(u64, u64)> = (0..60).map(|i| (i, 1000 + i)).collect();
        let (first, pages) = write_master_undo(&store, &anchors).unwrap();
        assert_ne!(first, 0);
        assert_eq!(pages.len(), 2);
        let (read, read_pages) = read_master_undo(&store, first).unwrap();
        assert_eq!(read, anchors);
        assert_eq!(read_pages, pages);
        assert_eq!(write_master_undo(&store, &[]).unwrap().0, 0);
    }
}
