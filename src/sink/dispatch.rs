//! Bounded-concurrency write admission.
//!
//! [`WriteDispatcher`] decides when a flushed batch may start writing. It
//! tracks the number of in-flight writes and holds a bounded FIFO overflow
//! queue with drop-oldest eviction. Executing the write is the caller's job:
//! every [`Admission::Start`] must eventually be matched by exactly one call
//! to [`WriteDispatcher::complete`].

use std::collections::VecDeque;

use super::Batch;

/// Result of submitting a batch.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// A slot was free; the caller must start the write now.
    Start(Batch),
    /// All slots are busy; the batch waits in the overflow queue.
    Queued,
    /// The batch was queued after evicting the oldest queued batch.
    Evicted(Batch),
    /// No queue capacity at all; the submitted batch itself was dropped.
    Rejected(Batch),
}

#[derive(Debug)]
pub struct WriteDispatcher {
    max_concurrent: usize,
    max_queue: usize,
    running: usize,
    queue: VecDeque<Batch>,
    dropped_events: u64,
    dropped_batches: u64,
}

impl WriteDispatcher {
    pub fn new(max_concurrent: usize, max_queue: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_queue,
            running: 0,
            queue: VecDeque::with_capacity(max_queue),
            dropped_events: 0,
            dropped_batches: 0,
        }
    }

    /// Admits a batch: start now, queue, or shed.
    pub fn submit(&mut self, batch: Batch) -> Admission {
        if self.running < self.max_concurrent {
            self.running += 1;
            return Admission::Start(batch);
        }

        if self.max_queue == 0 {
            self.count_drop(&batch);
            return Admission::Rejected(batch);
        }

        let evicted = if self.queue.len() >= self.max_queue {
            self.queue.pop_front()
        } else {
            None
        };

        self.queue.push_back(batch);

        match evicted {
            Some(evicted) => {
                self.count_drop(&evicted);
                Admission::Evicted(evicted)
            }
            None => Admission::Queued,
        }
    }

    /// Marks one write finished and returns the next queued batch to start.
    pub fn complete(&mut self) -> Option<Batch> {
        self.running = self.running.saturating_sub(1);

        if self.running >= self.max_concurrent {
            return None;
        }

        let next = self.queue.pop_front()?;
        self.running += 1;
        Some(next)
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Records dropped by eviction or rejection.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    fn count_drop(&mut self, batch: &Batch) {
        self.dropped_events += batch.len() as u64;
        self.dropped_batches += 1;
    }
}
