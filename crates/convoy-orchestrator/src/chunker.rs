use crate::{Batch, BatchRisk, TaskId};

/// Groups an ordered backlog into batches. Implementations must keep task order.
pub trait BacklogChunker {
    fn chunk(&self, task_ids: &[TaskId]) -> Vec<Batch>;
}

#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    batch_size: usize,
    risk: BatchRisk,
}

impl FixedSizeChunker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            risk: BatchRisk::Low,
        }
    }

    pub fn with_risk(mut self, risk: BatchRisk) -> Self {
        self.risk = risk;
        self
    }
}

impl BacklogChunker for FixedSizeChunker {
    fn chunk(&self, task_ids: &[TaskId]) -> Vec<Batch> {
        task_ids
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, tasks)| Batch {
                id: format!("batch-{:03}", i + 1),
                title: format!("Batch {}", i + 1),
                task_ids: tasks.to_vec(),
                rationale: format!("fixed-size chunk of {} task(s)", tasks.len()),
                risk: self.risk,
            })
            .collect()
    }
}
