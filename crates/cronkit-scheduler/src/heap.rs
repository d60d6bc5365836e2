//! Indexed binary min-heap of tasks, one per scheduler shard.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::task::{Task, NOT_SCHEDULED};

struct Entry {
    /// Trigger time captured at push; the heap never re-reads the task's
    /// own clock, so its order cannot change underneath it.
    at: DateTime<Utc>,
    task: Arc<Task>,
}

/// Earliest-due-first priority queue.
///
/// Every member's heap index is kept in sync with its slot so that
/// [`TaskHeap::remove`] can evict an arbitrary member in O(log n).
#[derive(Default)]
pub struct TaskHeap {
    entries: Vec<Entry>,
}

impl TaskHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `task` keyed by its current trigger time.
    ///
    /// Tasks without a trigger time are ignored and `false` is returned.
    pub fn push(&mut self, task: Arc<Task>) -> bool {
        let Some(at) = task.trigger_time() else {
            return false;
        };
        let index = self.entries.len();
        task.set_heap_index(index);
        self.entries.push(Entry { at, task });
        self.sift_up(index);
        true
    }

    /// Earliest member and its key, without removing it.
    pub fn peek(&self) -> Option<(DateTime<Utc>, &Arc<Task>)> {
        self.entries.first().map(|e| (e.at, &e.task))
    }

    /// Remove and return the earliest member.
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Evict `task` if it is a member. Returns whether anything was removed.
    pub fn remove(&mut self, task: &Arc<Task>) -> bool {
        let Some(index) = task.heap_index() else {
            return false;
        };
        // The index may belong to another shard; only trust it on identity.
        match self.entries.get(index) {
            Some(entry) if Arc::ptr_eq(&entry.task, task) => {
                self.remove_at(index);
                true
            }
            _ => false,
        }
    }

    /// Members in storage order. Only index 0 is guaranteed to be the minimum.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.entries.iter().map(|e| e.task.clone()).collect()
    }

    /// Drop every member, marking each as unscheduled.
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            entry.task.set_heap_index(NOT_SCHEDULED);
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (DateTime<Utc>, &Arc<Task>)> {
        self.entries.iter().map(|e| (e.at, &e.task))
    }

    fn remove_at(&mut self, index: usize) -> Arc<Task> {
        let removed = self.entries.swap_remove(index).task;
        removed.set_heap_index(NOT_SCHEDULED);
        if index < self.entries.len() {
            self.entries[index].task.set_heap_index(index);
            // The element moved in from the back may need to travel either way.
            if !self.sift_up(index) {
                self.sift_down(index);
            }
        }
        removed
    }

    /// Returns whether the element moved.
    fn sift_up(&mut self, mut index: usize) -> bool {
        let start = index;
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].at >= self.entries[parent].at {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index != start
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.entries[right].at < self.entries[left].at {
                right
            } else {
                left
            };
            if self.entries[child].at >= self.entries[index].at {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.entries[a].task.set_heap_index(a);
        self.entries[b].task.set_heap_index(b);
    }
}

impl std::fmt::Debug for TaskHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.task.name(), e.at)))
            .finish()
    }
}
