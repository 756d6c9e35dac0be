//! Asynchronous index writer.
//!
//! Producers push index commands into a bounded queue; one dedicated thread drains it in
//! batches, applies each command to the tree and commits once per batch. Every command
//! carries its own reply channel, resolved after its batch committed, so failures reach the
//! caller that issued the command.
//!
//! ## Backpressure
//!
//! The queue holds at most `queue_capacity` commands. [`IndexWriter::submit`] blocks while
//! it is full and [`IndexWriter::submit_async`] waits asynchronously. There is no timeout:
//! a stalled consumer stalls its producers.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{
    btree::BTree,
    error::{Error, Result},
    storage::StorageBackend,
};

/// Upper bound on commands applied per commit.
const MAX_BATCH: usize = 256;

/// Name of the consumer thread.
const THREAD_NAME: &str = "arbor-index-writer";

/// Hook run before every batch commit, e.g. to make referenced values durable first.
pub type CommitHook = Box<dyn Fn() -> Result<()> + Send>;

/// A mutation of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCommand {
    /// Insert or overwrite a key.
    Put {
        /// Key.
        key: u64,
        /// Value.
        value: u64,
    },
    /// Remove a key.
    Remove {
        /// Key.
        key: u64,
    },
}

type Reply = oneshot::Sender<Result<Option<u64>>>;

enum Message {
    Write { command: IndexCommand, reply: Reply },
    Sync { reply: oneshot::Sender<Result<()>> },
}

/// Result of a submitted command, available once its batch committed.
///
/// Resolve it with [`wait`](Self::wait) from synchronous code or `.await` it from async
/// code. Dropping it is allowed: a failure is then reported by the next
/// [`IndexWriter::sync`].
#[must_use = "dropping a PendingWrite defers its error to the next sync"]
pub struct PendingWrite {
    receiver: oneshot::Receiver<Result<Option<u64>>>,
}

impl PendingWrite {
    /// Blocks until the command's batch committed and returns the command's result (the
    /// key's previous value).
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<Option<u64>> {
        self.receiver.blocking_recv().unwrap_or(Err(Error::WriterClosed))
    }
}

impl Future for PendingWrite {
    type Output = Result<Option<u64>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::WriterClosed)))
    }
}

/// Single-consumer writer applying queued commands to a tree.
pub struct IndexWriter<S: StorageBackend + 'static> {
    tree: Arc<BTree<S>>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: StorageBackend + 'static> IndexWriter<S> {
    /// Starts the consumer thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero capacity and [`Error::Io`] if the thread
    /// cannot be spawned.
    pub fn spawn(tree: Arc<BTree<S>>, queue_capacity: usize, before_commit: Option<CommitHook>) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(Error::InvalidConfig { reason: "queue_capacity must be non-zero".to_string() });
        }
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let consumer = Consumer { tree: Arc::clone(&tree), before_commit, orphaned: None };
        let worker = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || consumer.run(receiver))?;
        debug!(queue_capacity, "Started index writer");
        Ok(Self { tree, sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) })
    }

    /// The tree written to.
    pub fn tree(&self) -> &Arc<BTree<S>> {
        &self.tree
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>> {
        self.sender.lock().clone().ok_or(Error::WriterClosed)
    }

    /// Queues a command, blocking while the queue is full.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`submit_async`](Self::submit_async) there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriterClosed`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, command: IndexCommand) -> Result<PendingWrite> {
        let (reply, receiver) = oneshot::channel();
        self.sender()?
            .blocking_send(Message::Write { command, reply })
            .map_err(|_| Error::WriterClosed)?;
        Ok(PendingWrite { receiver })
    }

    /// Queues a command, waiting asynchronously while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriterClosed`] after [`shutdown`](Self::shutdown).
    pub async fn submit_async(&self, command: IndexCommand) -> Result<PendingWrite> {
        let (reply, receiver) = oneshot::channel();
        let sender = self.sender()?;
        sender.send(Message::Write { command, reply }).await.map_err(|_| Error::WriterClosed)?;
        Ok(PendingWrite { receiver })
    }

    /// Waits until every earlier command has been applied and committed.
    ///
    /// # Errors
    ///
    /// Returns the first error of a command whose [`PendingWrite`] was dropped since the
    /// previous sync, or [`Error::WriterClosed`] after shutdown.
    pub fn sync(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.sender()?.blocking_send(Message::Sync { reply }).map_err(|_| Error::WriterClosed)?;
        receiver.blocking_recv().unwrap_or(Err(Error::WriterClosed))
    }

    /// Closes the queue, lets the consumer drain and commit what is left, and joins it.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommitFailed`] if the consumer thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        worker.join().map_err(|_| Error::CommitFailed {
            reason: format!("{THREAD_NAME} thread panicked"),
        })?;
        debug!("Stopped index writer");
        Ok(())
    }
}

impl<S: StorageBackend + 'static> Drop for IndexWriter<S> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "Index writer shutdown failed");
        }
    }
}

struct Consumer<S: StorageBackend> {
    tree: Arc<BTree<S>>,
    before_commit: Option<CommitHook>,
    /// First failure of a command whose caller stopped listening.
    orphaned: Option<String>,
}

impl<S: StorageBackend> Consumer<S> {
    fn run(mut self, mut receiver: mpsc::Receiver<Message>) {
        while let Some(first) = receiver.blocking_recv() {
            let mut writes = Vec::new();
            let mut barrier = None;
            match first {
                Message::Write { command, reply } => writes.push((command, reply)),
                Message::Sync { reply } => barrier = Some(reply),
            }
            while barrier.is_none() && writes.len() < MAX_BATCH {
                match receiver.try_recv() {
                    Ok(Message::Write { command, reply }) => writes.push((command, reply)),
                    Ok(Message::Sync { reply }) => barrier = Some(reply),
                    Err(_) => break,
                }
            }
            if !writes.is_empty() {
                self.apply_batch(writes);
            }
            if let Some(reply) = barrier {
                let result = match self.orphaned.take() {
                    Some(reason) => Err(Error::CommitFailed { reason }),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn apply_batch(&mut self, writes: Vec<(IndexCommand, Reply)>) {
        let mut results = Vec::with_capacity(writes.len());
        for (command, reply) in writes {
            let result = match command {
                IndexCommand::Put { key, value } => self.tree.put(key, value),
                IndexCommand::Remove { key } => self.tree.remove(key),
            };
            if let Err(err) = &result {
                error!(?command, error = %err, "Index command failed");
            }
            results.push((result, reply));
        }

        if let Err(err) = self.commit() {
            error!(commands = results.len(), error = %err, "Index batch commit failed");
            let reason = err.to_string();
            for (_, reply) in results {
                self.reply(reply, Err(Error::CommitFailed { reason: reason.clone() }));
            }
            return;
        }
        debug!(commands = results.len(), "Index batch committed");
        for (result, reply) in results {
            self.reply(reply, result);
        }
    }

    fn commit(&self) -> Result<()> {
        if let Some(hook) = &self.before_commit {
            hook()?;
        }
        self.tree.commit()?;
        Ok(())
    }

    fn reply(&mut self, reply: Reply, result: Result<Option<u64>>) {
        if let Err(Err(err)) = reply.send(result) {
            self.orphaned.get_or_insert_with(|| err.to_string());
        }
    }
}
