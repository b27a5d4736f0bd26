//! In-memory implementation of the [`Log`] collaborator.
//!
//! Learned values can arrive out of order (slot 5 may be learned before
//! slot 4 reaches this replica). They wait in `pending` until every lower
//! slot is filled, so readers only ever see a dense prefix starting at 0.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::stream;
use tokio::{
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{Error, Result},
    handler::{Log, ValueStream},
};

/// Values buffered between a `pull` producer and its consumer.
const PULL_BUFFER: usize = 64;

#[derive(Debug, Default)]
struct Entries {
    dense: Vec<String>,
    pending: BTreeMap<u64, String>,
}

impl Entries {
    fn head(&self) -> u64 {
        self.dense.len() as u64
    }

    fn learned(&self, n: u64) -> Option<&String> {
        usize::try_from(n)
            .ok()
            .and_then(|index| self.dense.get(index))
            .or_else(|| self.pending.get(&n))
    }

    /// Moves pending values into the dense prefix while the next slot is
    /// available.
    fn compact(&mut self) {
        while let Some(value) = self.pending.remove(&self.head()) {
            self.dense.push(value);
        }
    }
}

#[derive(Debug)]
pub struct MemoryLog {
    entries: Arc<Mutex<Entries>>,
    head_tx: watch::Sender<u64>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            head_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        lock_entries(&self.entries)
    }
}

fn lock_entries(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Log for MemoryLog {
    async fn set(&self, ctx: &Context, n: u64, v: &str) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let head = {
            let mut entries = self.lock();
            match entries.learned(n) {
                Some(existing) if existing == v => return Ok(()),
                Some(_) => return Err(Error::Conflict { index: n }),
                None => {}
            }
            entries.pending.insert(n, v.to_string());
            entries.compact();
            entries.head()
        };

        debug!(slot = n, head, "value learned");
        self.head_tx.send_if_modified(|current| {
            let advanced = head > *current;
            if advanced {
                *current = head;
            }
            advanced
        });
        Ok(())
    }

    async fn get(&self, ctx: &Context, n: u64) -> Result<Vec<String>> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entries = self.lock();
        let head = entries.head();
        if n > head {
            return Err(Error::OutOfRange { index: n, head });
        }
        let start = usize::try_from(n).map_err(|_| Error::OutOfRange { index: n, head })?;
        Ok(entries.dense[start..].to_vec())
    }

    async fn pull(&self, ctx: &Context, n: u64) -> Result<ValueStream> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (tx, rx) = mpsc::channel(PULL_BUFFER);
        let entries = Arc::clone(&self.entries);
        let head_rx = self.head_tx.subscribe();
        tokio::spawn(produce(entries, head_rx, n, ctx.clone(), tx));

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn head(&self) -> u64 {
        *self.head_tx.borrow()
    }
}

/// Feeds values from slot `next` onwards into `tx` until the context is
/// cancelled, the consumer goes away or the log is dropped.
async fn produce(
    entries: Arc<Mutex<Entries>>,
    mut head_rx: watch::Receiver<u64>,
    mut next: u64,
    ctx: Context,
    tx: mpsc::Sender<Result<String>>,
) {
    loop {
        let head = *head_rx.borrow_and_update();
        while next < head {
            let value = usize::try_from(next)
                .ok()
                .and_then(|index| lock_entries(&entries).dense.get(index).cloned());
            let item = value.ok_or_else(|| {
                Error::Storage(format!("slot {next} below head {head} is missing"))
            });
            let failed = item.is_err();

            select! {
                biased;
                _ = ctx.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            if failed {
                warn!(slot = next, "pull producer stopped on a missing slot");
                return;
            }
            next += 1;
        }

        select! {
            biased;
            _ = ctx.cancelled() => return,
            _ = tx.closed() => return,
            changed = head_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
