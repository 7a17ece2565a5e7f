//! Concurrent k-way chunk merger.

use std::error::Error;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log;

use crate::observer::SortObserver;
use crate::record::Record;
use crate::sort::SortError;

/// Chunk worker to merger message.
enum Message<T, S: Error, D: Error> {
    Record(T),
    Failed(SortError<S, D>),
    End,
}

/// Frontier slot: the next candidate record of a chunk.
enum Slot<T> {
    /// No record fetched from the chunk queue yet.
    Waiting,
    Ready(T),
    /// Chunk is completely consumed.
    Drained,
}

impl<T> Slot<T> {
    fn take(&mut self) -> Option<T> {
        match mem::replace(self, Slot::Waiting) {
            Slot::Ready(item) => Some(item),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Merge cancellation handle.
///
/// Cancelling unblocks all chunk workers, makes them drop their chunk readers and causes
/// the merger to yield [`SortError::Cancelled`]. The token can be cloned and sent to other threads.
#[derive(Clone)]
pub struct CancelToken {
    // the merger and the workers observe disconnection of this channel
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelToken {
    fn new() -> (Self, Receiver<()>) {
        let (trigger, cancelled) = channel::bounded(0);
        let token = CancelToken {
            trigger: Arc::new(Mutex::new(Some(trigger))),
        };

        return (token, cancelled);
    }

    /// Cancels the merge. Repeated calls have no effect.
    pub fn cancel(&self) {
        self.trigger.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Checks if the merge was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.trigger.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// K-way chunk merger.
/// Merges multiple sorted chunks into a single sorted output.
///
/// Every chunk is decoded by its own worker thread that pushes records to a bounded queue,
/// so at most *k* \* *queue_capacity* records are held in memory. Records are selected by the iterating thread
/// which keeps one candidate record per chunk and emits the smallest one. Equal records are emitted in chunk
/// order: the chunk that comes first in the input list wins.
///
/// After an error is yielded the merger is finished and returns [`None`].
pub struct ChunkMerger<T, S: Error, D: Error> {
    chunks: Vec<String>,
    queues: Vec<Receiver<Message<T, S, D>>>,
    frontier: Vec<Slot<T>>,
    workers: Vec<thread::JoinHandle<()>>,
    cancel: CancelToken,
    cancelled: Receiver<()>,
    observer: Arc<dyn SortObserver>,
    emitted: u64,
    done: bool,
}

impl<T, S, D> ChunkMerger<T, S, D>
where
    T: Record,
    S: Error + Send + 'static,
    D: Error + Send + 'static,
{
    /// Spawns a worker per chunk and creates a merger over their output.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `sources` - Named sorted chunk streams
    /// * `queue_capacity` - Per chunk queue capacity
    /// * `observer` - Progress observer
    pub fn spawn<I>(
        sources: Vec<(String, I)>,
        queue_capacity: usize,
        observer: Arc<dyn SortObserver>,
    ) -> Result<Self, SortError<S, D>>
    where
        I: Iterator<Item = Result<T, SortError<S, D>>> + Send + 'static,
    {
        let (cancel, cancelled) = CancelToken::new();
        let mut merger = ChunkMerger {
            chunks: Vec::with_capacity(sources.len()),
            queues: Vec::with_capacity(sources.len()),
            frontier: Vec::with_capacity(sources.len()),
            workers: Vec::with_capacity(sources.len()),
            cancel,
            cancelled,
            observer,
            emitted: 0,
            done: false,
        };

        log::info!("setting up readers for {} chunks", sources.len());
        for (idx, (chunk, source)) in sources.into_iter().enumerate() {
            let (queue, queue_rx) = channel::bounded(queue_capacity);
            let cancelled = merger.cancelled.clone();
            let worker_chunk = chunk.clone();

            // spawned workers are cancelled and joined by drop if this fails
            let worker = thread::Builder::new()
                .name(format!("chunk-reader-{}", idx))
                .spawn(move || feed_queue(worker_chunk, source, queue, cancelled))
                .map_err(SortError::IO)?;

            merger.chunks.push(chunk);
            merger.queues.push(queue_rx);
            merger.frontier.push(Slot::Waiting);
            merger.workers.push(worker);
        }

        return Ok(merger);
    }

    /// Returns a handle that can be used to cancel the merge from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stops the merge and releases all chunk resources.
    pub fn cancel(&mut self) {
        self.shutdown();
    }

    /// Returns names of merged chunks.
    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    fn step(&mut self) -> Result<Option<T>, SortError<S, D>> {
        if let Err(TryRecvError::Disconnected) = self.cancelled.try_recv() {
            return Err(SortError::Cancelled);
        }

        self.fill()?;
        self.select()
    }

    /// Fetches a candidate for every chunk that has none.
    fn fill(&mut self) -> Result<(), SortError<S, D>> {
        for idx in 0..self.frontier.len() {
            if !matches!(self.frontier[idx], Slot::Waiting) {
                continue;
            }

            let message = crossbeam::select! {
                recv(self.queues[idx]) -> message => message,
                recv(self.cancelled) -> _ => return Err(SortError::Cancelled),
            };

            self.frontier[idx] = match message {
                Ok(Message::Record(record)) => Slot::Ready(record),
                Ok(Message::End) => Slot::Drained,
                Ok(Message::Failed(err)) => return Err(err),
                Err(_) => {
                    return Err(SortError::WorkerLost {
                        chunk: self.chunks[idx].clone(),
                    })
                }
            };
        }

        return Ok(());
    }

    /// Takes the smallest candidate out of the frontier.
    fn select(&mut self) -> Result<Option<T>, SortError<S, D>> {
        let mut selected: Option<(usize, &T)> = None;

        for (idx, slot) in self.frontier.iter().enumerate() {
            let candidate = match slot {
                Slot::Ready(candidate) => candidate,
                Slot::Waiting | Slot::Drained => continue,
            };

            let is_less = match selected {
                None => true,
                // strict comparison keeps the lower chunk index on ties
                Some((_, current)) => candidate.less(current).map_err(|err| {
                    log::error!("failed to compare records {} and {}", candidate, current);
                    SortError::CompareError(err)
                })?,
            };
            if is_less {
                selected = Some((idx, candidate));
            }
        }

        let selected = selected.map(|(idx, _)| idx);
        return Ok(match selected {
            Some(idx) => self.frontier[idx].take(),
            None => None,
        });
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.cancel.cancel();
        self.queues.clear();
        self.frontier.clear();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("chunk reader thread panicked");
            }
        }
    }
}

impl<T, S, D> Iterator for ChunkMerger<T, S, D>
where
    T: Record,
    S: Error + Send + 'static,
    D: Error + Send + 'static,
{
    type Item = Result<T, SortError<S, D>>;

    /// Returns the next record from the chunks in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(record)) => {
                self.emitted += 1;
                Some(Ok(record))
            }
            Ok(None) => {
                self.shutdown();
                self.observer.merge_finished(self.emitted, self.chunks.len());
                None
            }
            Err(err) => {
                match err {
                    SortError::Cancelled => log::debug!("merge cancelled after {} records", self.emitted),
                    _ => log::error!("merge failed after {} records: {}", self.emitted, err),
                }
                self.shutdown();
                Some(Err(err))
            }
        }
    }
}

impl<T, S: Error, D: Error> Drop for ChunkMerger<T, S, D> {
    fn drop(&mut self) {
        self.done = true;
        self.cancel.cancel();
        self.queues.clear();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Chunk worker loop: moves records from the chunk stream to the merger queue.
fn feed_queue<T, S, D, I>(chunk: String, source: I, queue: Sender<Message<T, S, D>>, cancelled: Receiver<()>)
where
    S: Error,
    D: Error,
    I: Iterator<Item = Result<T, SortError<S, D>>>,
{
    for item in source {
        let (message, failed) = match item {
            Ok(record) => (Message::Record(record), false),
            Err(err) => (Message::Failed(err), true),
        };

        if !send(&queue, &cancelled, message) {
            log::debug!("chunk {} reader stopped", chunk);
            return;
        }
        if failed {
            return;
        }
    }

    if send(&queue, &cancelled, Message::End) {
        log::debug!("chunk {} exhausted", chunk);
    }
}

/// Sends a message unless the merge is cancelled or the merger is gone.
fn send<M>(queue: &Sender<M>, cancelled: &Receiver<()>, message: M) -> bool {
    crossbeam::select! {
        send(queue, message) -> result => result.is_ok(),
        recv(cancelled) -> _ => false,
    }
}
