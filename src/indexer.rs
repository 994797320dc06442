//! Online full-text indexer: a long-running task keeping the text index
//! reconciled with the offer store through the durable queue.

use crate::error::Result;
use crate::index::queue::{IndexQueue, Op, Queued};
use crate::index::OfferIndex;
use crate::offer::{convert_offer, decode_offer};
use crate::store::Store;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

const BATCH_SIZE: usize = 50;

/// Sorted-merge diff between two id sets: ids only in `from` are additions,
/// ids only in `to` are removals.
pub fn diff_ids(mut from: Vec<String>, mut to: Vec<String>) -> (Vec<String>, Vec<String>) {
    from.sort();
    to.sort();
    let added = from
        .iter()
        .filter(|id| to.binary_search(id).is_err())
        .cloned()
        .collect();
    let removed = to
        .iter()
        .filter(|id| from.binary_search(id).is_err())
        .cloned()
        .collect();
    (added, removed)
}

/// Handle on the indexing task. [`Indexer::sync`] coalesces; dropped signals
/// mean a reset is already pending.
pub struct Indexer {
    reset_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl Indexer {
    /// Spawn the indexing task. It assumes it is the sole writer for both
    /// the queue and the index.
    pub fn new(store: Arc<Store>, index: Arc<OfferIndex>, queue: Arc<IndexQueue>) -> Result<Indexer> {
        let writer = index.writer()?;
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (work_tx, work_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let worker = Worker {
            store,
            index,
            queue,
            writer,
            work_tx: work_tx.clone(),
        };
        tokio::spawn(dispatch(worker, reset_rx, work_rx, stop_rx));
        Ok(Indexer { reset_tx, stop_tx })
    }

    /// Ask the task to reconcile index and store. Non-blocking; multiple
    /// calls between two resets collapse into one.
    pub fn sync(&self) {
        let _ = self.reset_tx.try_send(());
    }

    /// Stop the task and wait for its acknowledgement.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct Worker {
    store: Arc<Store>,
    index: Arc<OfferIndex>,
    queue: Arc<IndexQueue>,
    writer: tantivy::IndexWriter,
    work_tx: mpsc::Sender<()>,
}

async fn dispatch(
    mut worker: Worker,
    mut reset_rx: mpsc::Receiver<()>,
    mut work_rx: mpsc::Receiver<()>,
    mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            Some(ack) = stop_rx.recv() => {
                let _ = ack.send(());
                return;
            }
            Some(()) = reset_rx.recv() => {
                tracing::info!("collecting index updates");
                match worker.reset_queue() {
                    Ok(()) => {
                        tracing::info!("collection done");
                        worker.signal_work();
                    }
                    Err(e) => tracing::error!("indexer reset failed: {}", e),
                }
            }
            Some(()) = work_rx.recv() => {
                let pending = worker.queue.size().unwrap_or(-1);
                tracing::info!("indexing documents, {} updates remaining", pending);
                let start = Instant::now();
                match worker.index_some() {
                    Ok(indexed) => {
                        let speed = indexed as f64 / start.elapsed().as_secs_f64();
                        tracing::info!("indexation done, {:.1}/s", speed);
                    }
                    Err(e) => tracing::error!("indexation failed: {}", e),
                }
            }
            else => return,
        }
    }
}

impl Worker {
    fn signal_work(&self) {
        let _ = self.work_tx.try_send(());
    }

    /// Rebuild the queue from a diff of store ids against index ids.
    fn reset_queue(&self) -> Result<()> {
        let stored = self.store.list()?;
        let indexed = self.index.list_ids()?;
        let (added, removed) = diff_ids(stored, indexed);
        tracing::info!("queuing {} additions, {} removals", added.len(), removed.len());

        let mut ops = Vec::with_capacity(added.len() + removed.len());
        for id in removed {
            ops.push(Queued::remove(&id));
        }
        for id in added {
            ops.push(Queued::add(&id));
        }
        self.queue.delete_many(self.queue.size()?.max(0) as usize)?;
        self.queue.queue_many(ops)
    }

    fn apply_one(&mut self, item: &Queued) -> Result<()> {
        match item.op {
            Op::Add => {
                let data = match self.store.get(&item.id)? {
                    Some(d) => d,
                    // Deleted between queuing and indexing; the removal is
                    // already queued behind us.
                    None => return Ok(()),
                };
                let offer = match decode_offer(&data).and_then(|js| convert_offer(&js)) {
                    Ok(o) => o,
                    Err(e) => {
                        tracing::warn!("skipping undecodable offer {}: {}", item.id, e);
                        return Ok(());
                    }
                };
                self.index.remove_offer(&mut self.writer, &item.id);
                self.index.add_offer(&mut self.writer, &offer)
            }
            Op::Remove => {
                self.index.remove_offer(&mut self.writer, &item.id);
                Ok(())
            }
        }
    }

    /// Index one batch from the queue. Entries are only consumed after the
    /// batch commits, so a failed item is retried after restart.
    fn index_some(&mut self) -> Result<usize> {
        let batch = self.queue.fetch_many(BATCH_SIZE)?;
        let mut applied = 0;
        for item in &batch {
            match self.apply_one(item) {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::error!("could not index {}: {}", item.id, e);
                    break;
                }
            }
        }
        if applied > 0 {
            self.writer.commit()?;
            self.index.reader().reload()?;
            self.queue.delete_many(applied)?;
        }
        if batch.len() >= BATCH_SIZE {
            self.signal_work();
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_ids_merge() {
        let (added, removed) = diff_ids(
            vec!["b".into(), "a".into(), "c".into()],
            vec!["c".into(), "d".into()],
        );
        assert_eq!(added, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(removed, vec!["d".to_string()]);

        let (added, removed) = diff_ids(vec![], vec![]);
        assert!(added.is_empty() && removed.is_empty());
    }
}
