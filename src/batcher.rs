use crate::error::SyncError;
use crate::models::{Batch, Record, SourcedRecord};
use log::debug;

/// Streaming partitioner: holds at most `max_batch_size` records at a time.
pub struct Batcher {
    max_batch_size: usize,
    next_index: usize,
    buffer: Vec<Record>,
    buffer_start: Option<u64>,
    last_offset: u64,
}

impl Batcher {
    pub fn new(max_batch_size: usize) -> Result<Self, SyncError> {
        Self::starting_at(max_batch_size, 0)
    }

    /// Batch indices continue from `first_index` (used when resuming a run).
    pub fn starting_at(max_batch_size: usize, first_index: usize) -> Result<Self, SyncError> {
        if max_batch_size == 0 {
            return Err(SyncError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_batch_size,
            next_index: first_index,
            buffer: Vec::with_capacity(max_batch_size),
            buffer_start: None,
            last_offset: 0,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Index the next emitted batch will carry.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Adds a record and returns a full batch once `max_batch_size` is reached.
    pub fn push(&mut self, item: SourcedRecord) -> Option<Batch> {
        let SourcedRecord { offset, record } = item;

        // A batch never holds one key twice; both versions are written, in source order.
        let closed = if self.buffer.iter().any(|buffered| buffered.key == record.key) {
            debug!(
                "Duplicate key {} at offset {} closes batch {}",
                record.key, offset, self.next_index
            );
            self.emit()
        } else {
            None
        };

        if self.buffer_start.is_none() {
            self.buffer_start = Some(offset);
        }
        self.last_offset = offset;
        self.buffer.push(record);

        if closed.is_some() {
            return closed;
        }
        if self.buffer.len() >= self.max_batch_size {
            self.emit()
        } else {
            None
        }
    }

    /// Flushes the trailing partial batch.
    pub fn finish(&mut self) -> Option<Batch> {
        self.emit()
    }

    fn emit(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_batch_size));
        let source_start = self.buffer_start.take().unwrap_or(self.last_offset);
        let batch = Batch {
            index: self.next_index,
            records,
            source_start,
            source_end: self.last_offset + 1,
        };
        self.next_index += 1;
        Some(batch)
    }
}

/// Partitions a whole sequence, numbering source offsets from zero.
pub fn partition<I>(records: I, max_batch_size: usize) -> Result<Vec<Batch>, SyncError>
where
    I: IntoIterator<Item = Record>,
{
    let mut batcher = Batcher::new(max_batch_size)?;
    let mut batches = Vec::new();
    for (offset, record) in records.into_iter().enumerate() {
        if let Some(batch) = batcher.push(SourcedRecord {
            offset: offset as u64,
            record,
        }) {
            batches.push(batch);
        }
    }
    batches.extend(batcher.finish());
    Ok(batches)
}
