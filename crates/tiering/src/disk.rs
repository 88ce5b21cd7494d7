//! Tiered file and I/O engine
//!
//! One append-extensible file per shard (`<prefix><shard-id>`), divided
//! into fixed pages. Page accounting lives with the caller; the actual
//! reads and writes run on a dedicated background thread fed through a
//! channel, and completions are drained back on the shard worker.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error};

use storage::PAGE_SIZE;

/// I/O request handed to the engine thread
enum IoRequest {
    Write { id: u64, offset: u64, data: Vec<u8> },
    Read { id: u64, offset: u64, len: usize },
    Shutdown,
}

/// Completed I/O, tagged with the submitter's id
#[derive(Debug)]
pub enum IoCompletion {
    Write { id: u64, result: io::Result<()> },
    Read { id: u64, result: io::Result<Vec<u8>> },
}

impl IoCompletion {
    pub fn id(&self) -> u64 {
        match self {
            IoCompletion::Write { id, .. } | IoCompletion::Read { id, .. } => *id,
        }
    }
}

/// Background I/O thread over the tiered file
pub struct IoEngine {
    tx: Sender<IoRequest>,
    completions: Receiver<IoCompletion>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IoEngine {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("tiered-io".to_string())
            .spawn(move || Self::io_loop(file, rx, done_tx))?;
        debug!(?path, "tiered file opened");
        Ok(Self { tx, completions: done_rx, handle: Some(handle) })
    }

    fn io_loop(file: File, rx: Receiver<IoRequest>, done: Sender<IoCompletion>) {
        while let Ok(request) = rx.recv() {
            match request {
                IoRequest::Write { id, offset, data } => {
                    let result = file.write_all_at(&data, offset);
                    if let Err(e) = &result {
                        error!(id, offset, "tiered write failed: {e}");
                    }
                    let _ = done.send(IoCompletion::Write { id, result });
                }
                IoRequest::Read { id, offset, len } => {
                    let mut buf = vec![0u8; len];
                    let result = file.read_exact_at(&mut buf, offset).map(|_| buf);
                    if let Err(e) = &result {
                        error!(id, offset, len, "tiered read failed: {e}");
                    }
                    let _ = done.send(IoCompletion::Read { id, result });
                }
                IoRequest::Shutdown => break,
            }
        }
    }

    pub fn submit_write(&self, id: u64, offset: u64, data: Vec<u8>) {
        let _ = self.tx.send(IoRequest::Write { id, offset, data });
    }

    pub fn submit_read(&self, id: u64, offset: u64, len: usize) {
        let _ = self.tx.send(IoRequest::Read { id, offset, len });
    }

    /// Drain completions without blocking
    pub fn try_completions(&self) -> Vec<IoCompletion> {
        let mut out = Vec::new();
        loop {
            match self.completions.try_recv() {
                Ok(done) => out.push(done),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Block for the next completion (tests and drain paths)
    pub fn wait_completion(&self) -> Option<IoCompletion> {
        self.completions.recv().ok()
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Page-grid accounting for the tiered file. Single pages are recycled
/// from a free list; multi-page ranges always extend the file so they
/// stay contiguous.
#[derive(Debug, Default)]
pub struct PageAllocator {
    free_single: VecDeque<u32>,
    next_page: u32,
    allocated_pages: u64,
}

impl PageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous pages; returns the first page index
    pub fn alloc(&mut self, count: u32) -> u32 {
        debug_assert!(count > 0);
        self.allocated_pages += count as u64;
        if count == 1 {
            if let Some(page) = self.free_single.pop_front() {
                return page;
            }
        }
        let first = self.next_page;
        self.next_page += count;
        first
    }

    pub fn free(&mut self, first_page: u32, count: u32) {
        debug_assert!(self.allocated_pages >= count as u64);
        self.allocated_pages -= count as u64;
        for page in first_page..first_page + count {
            self.free_single.push_back(page);
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_pages * PAGE_SIZE as u64
    }

    pub fn offset_of(page: u32) -> u64 {
        page as u64 * PAGE_SIZE as u64
    }

    /// Pages needed for `len` bytes
    pub fn pages_for(len: usize) -> u32 {
        len.div_ceil(PAGE_SIZE) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IoEngine::open(&dir.path().join("tiered-0")).unwrap();
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 256) as u8).collect();
        engine.submit_write(1, 0, data.clone());
        match engine.wait_completion().unwrap() {
            IoCompletion::Write { id, result } => {
                assert_eq!(id, 1);
                result.unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.submit_read(2, 0, PAGE_SIZE);
        match engine.wait_completion().unwrap() {
            IoCompletion::Read { id, result } => {
                assert_eq!(id, 2);
                assert_eq!(result.unwrap(), data);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_read_past_eof_fails_not_panics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IoEngine::open(&dir.path().join("tiered-0")).unwrap();
        engine.submit_read(7, 10 * PAGE_SIZE as u64, 16);
        match engine.wait_completion().unwrap() {
            IoCompletion::Read { id, result } => {
                assert_eq!(id, 7);
                assert!(result.is_err());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_page_allocator_reuse() {
        let mut pages = PageAllocator::new();
        let a = pages.alloc(1);
        let b = pages.alloc(1);
        assert_ne!(a, b);
        assert_eq!(pages.allocated_bytes(), 2 * PAGE_SIZE as u64);
        pages.free(a, 1);
        assert_eq!(pages.allocated_bytes(), PAGE_SIZE as u64);
        assert_eq!(pages.alloc(1), a);

        // Multi-page ranges are contiguous and never reuse singles
        pages.free(b, 1);
        let multi = pages.alloc(3);
        assert!(multi > b);
        assert_eq!(PageAllocator::pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(PageAllocator::pages_for(PAGE_SIZE), 1);
    }
}
