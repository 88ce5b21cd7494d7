//! Shard set
//!
//! The keyspace is split into shards; each shard owns one OS thread
//! running a current-thread tokio runtime. All operations against a
//! shard's portion of the key space execute on that thread, submitted as
//! closures over the shard state. Cooperative tasks (migration streaming,
//! background offload) run as local tasks on the same runtime and yield
//! explicitly, so within a shard nothing ever runs in parallel.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::thread;

use shoal_core::{slots, Config, ShardId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::alloc::{self, ShardAlloc};
use crate::db::{Db, DbLimits};
use crate::hash::HashLimits;
use crate::zset::ZSetLimits;

/// Counters exposed per shard
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    pub ops: u64,
    pub keys: usize,
    pub used_bytes: usize,
}

/// State owned exclusively by one shard worker
pub struct ShardState {
    pub shard_id: ShardId,
    pub db: Db,
    pub alloc: Rc<ShardAlloc>,
    pub ops: u64,
}

impl ShardState {
    fn new(shard_id: ShardId, limits: DbLimits) -> Self {
        let handle = alloc::current();
        Self { shard_id, db: Db::new(limits), alloc: handle, ops: 0 }
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            ops: self.ops,
            keys: self.db.len(),
            used_bytes: self.alloc.used_bytes(),
        }
    }
}

type SyncTask = Box<dyn FnOnce(&mut ShardState) + Send>;
type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type AsyncTask = Box<dyn FnOnce(Rc<RefCell<ShardState>>) -> LocalFuture + Send>;

enum ShardTask {
    Sync(SyncTask),
    Async(AsyncTask),
}

/// Handle to the set of shard workers
pub struct ShardSet {
    senders: Vec<mpsc::UnboundedSender<ShardTask>>,
    handles: Vec<thread::JoinHandle<()>>,
    shard_count: u32,
}

impl ShardSet {
    pub fn new(config: &Config) -> Self {
        let shard_count = config.shard_count.max(1);
        let limits = DbLimits {
            hash: HashLimits {
                max_value_len: config.hash_max_listpack_value_len,
                max_pack_bytes: config.hash_max_listpack_bytes,
            },
            zset: ZSetLimits {
                max_entries: config.zset_max_listpack_entries,
                max_value_len: config.zset_max_listpack_value_len,
            },
        };
        let mut senders = Vec::with_capacity(shard_count as usize);
        let mut handles = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(
                thread::Builder::new()
                    .name(format!("shard-{shard_id}"))
                    .spawn(move || worker_loop(shard_id, limits, rx))
                    .expect("failed to spawn shard worker"),
            );
        }
        info!(shard_count, "shard set started");
        Self { senders, handles, shard_count }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Owning shard of a key
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        slots::shard_for_key(key, self.shard_count)
    }

    /// Run a closure on a shard and await its result
    pub async fn run<R, F>(&self, shard: ShardId, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(
            shard,
            ShardTask::Sync(Box::new(move |state| {
                state.ops += 1;
                let _ = tx.send(f(state));
            })),
        );
        rx.await.expect("shard worker dropped reply")
    }

    /// Run a closure on a shard from synchronous code
    pub fn run_blocking<R, F>(&self, shard: ShardId, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        self.send(
            shard,
            ShardTask::Sync(Box::new(move |state| {
                state.ops += 1;
                let _ = tx.send(f(state));
            })),
        );
        rx.recv().expect("shard worker dropped reply")
    }

    /// Spawn a cooperative task on a shard's local runtime. The task
    /// shares the worker thread and must yield at its suspension points.
    pub fn spawn_on<F>(&self, shard: ShardId, f: F)
    where
        F: FnOnce(Rc<RefCell<ShardState>>) -> LocalFuture + Send + 'static,
    {
        self.send(shard, ShardTask::Async(Box::new(f)));
    }

    fn send(&self, shard: ShardId, task: ShardTask) {
        self.senders[shard as usize]
            .send(task)
            .expect("shard worker terminated");
    }

    /// BZPOPMIN / BZPOPMAX: cooperative blocking pop. The wait is a
    /// suspension point on the caller's task, not the shard worker; the
    /// shard stays responsive between polls.
    pub async fn bzpop(
        &self,
        key: Vec<u8>,
        reverse: bool,
        timeout: std::time::Duration,
    ) -> shoal_core::OpResult<Option<(bytes::Bytes, f64)>> {
        let shard = self.shard_for_key(&key);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let key_for_op = key.clone();
            let mut popped = self
                .run(shard, move |state| {
                    state.db.zpop(&key_for_op, 1, reverse, now_ms())
                })
                .await?;
            if let Some(entry) = popped.pop() {
                return Ok(Some(entry));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(shoal_core::OpStatus::TimedOut);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Stop all workers and wait for them to drain
    pub fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Wall clock in epoch milliseconds, the time base of expiry checks
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn worker_loop(shard_id: ShardId, limits: DbLimits, mut rx: mpsc::UnboundedReceiver<ShardTask>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build shard runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let state = Rc::new(RefCell::new(ShardState::new(shard_id, limits)));
        debug!(shard_id, "shard worker running");
        while let Some(task) = rx.recv().await {
            match task {
                ShardTask::Sync(f) => f(&mut state.borrow_mut()),
                ShardTask::Async(f) => {
                    tokio::task::spawn_local(f(state.clone()));
                }
            }
        }
        debug!(shard_id, "shard worker exiting");
    });
}
