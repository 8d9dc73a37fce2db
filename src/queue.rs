use std::collections::VecDeque;

use crate::models::TaskId;

/// FIFO of tasks waiting for a free transfer slot.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    queue: VecDeque<TaskId>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task at the back. A task already waiting keeps its place.
    pub fn push(&mut self, id: TaskId) -> bool {
        if self.queue.contains(&id) {
            return false;
        }
        self.queue.push_back(id);
        true
    }

    /// Takes the first task `ready` accepts; the ones it passes over keep their places.
    pub fn pop_ready(&mut self, ready: impl Fn(TaskId) -> bool) -> Option<TaskId> {
        let index = self.queue.iter().position(|id| ready(*id))?;
        self.queue.remove(index)
    }

    /// Takes a task out of line, e.g. when it is paused or cancelled before admission.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
