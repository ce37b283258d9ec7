// src/scheduler/queue.rs - Pending jobs ordered by (priority, admission sequence)
use crate::print_job::{JobId, PrintJob};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry. `BinaryHeap` is a max-heap, so the ordering is reversed to pop
/// the lowest `(priority, sequence)` first.
#[derive(Debug)]
struct Pending(PrintJob);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.precedence() == other.0.precedence()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.precedence().cmp(&self.0.precedence())
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<Pending>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new or re-queued job. A re-queued job keeps its sequence
    /// number, so it still precedes equal-priority jobs admitted after it.
    pub fn push(&mut self, job: PrintJob) {
        self.heap.push(Pending(job));
    }

    /// Highest-precedence job.
    pub fn pop(&mut self) -> Option<PrintJob> {
        self.heap.pop().map(|p| p.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.heap.iter().any(|p| p.0.id == id)
    }

    /// Take a job out of the queue regardless of its position.
    pub fn remove(&mut self, id: JobId) -> Option<PrintJob> {
        let mut removed = None;
        self.heap.retain(|p| {
            if removed.is_none() && p.0.id == id {
                removed = Some(p.0.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Pending jobs in dispatch order.
    pub fn snapshot(&self) -> Vec<PrintJob> {
        let mut jobs: Vec<PrintJob> = self.heap.iter().map(|p| p.0.clone()).collect();
        jobs.sort_by_key(|j| j.precedence());
        jobs
    }
}
