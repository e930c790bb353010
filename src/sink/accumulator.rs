use crate::feed::event::{Category, EventRecord, CATEGORY_COUNT};

use super::{Batch, FlushTrigger};

/// Per-category in-memory buffers with a size-triggered flush.
///
/// Flushing swaps the buffer for a fresh one and returns the captured
/// records as a [`Batch`], so a record is owned by exactly one of the
/// buffer or the batch at any time.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_batch_size: usize,
    buffers: [Vec<EventRecord>; CATEGORY_COUNT],
}

impl BatchAccumulator {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            buffers: Default::default(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Appends records to a category buffer.
    ///
    /// Returns the flushed batch when the buffer reaches the size threshold.
    pub fn append(&mut self, category: Category, records: Vec<EventRecord>) -> Option<Batch> {
        if records.is_empty() {
            return None;
        }

        let buffer = &mut self.buffers[category.index()];
        buffer.extend(records);

        if buffer.len() >= self.max_batch_size {
            return self.flush(category, FlushTrigger::Size);
        }

        None
    }

    /// Flushes one category; `None` if its buffer is empty.
    pub fn flush(&mut self, category: Category, trigger: FlushTrigger) -> Option<Batch> {
        let buffer = &mut self.buffers[category.index()];
        if buffer.is_empty() {
            return None;
        }

        Some(Batch {
            category,
            trigger,
            records: std::mem::take(buffer),
        })
    }

    /// Flushes every non-empty category in [`Category::ALL`] order.
    pub fn flush_all(&mut self, trigger: FlushTrigger) -> Vec<Batch> {
        Category::ALL
            .into_iter()
            .filter_map(|category| self.flush(category, trigger))
            .collect()
    }

    /// Current buffered record count for a category.
    pub fn len(&self, category: Category) -> usize {
        self.buffers[category.index()].len()
    }
}
