use std::collections::HashMap;

use crate::clock::delay_to_next_second;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TaskHandle(u64);

#[derive(Debug, Clone, Copy)]
struct ScheduledTick {
    handle: TaskHandle,
    due_at_ms: i64,
}

/// Per-timer one-shot tick callbacks. Each timer id owns at most one pending
/// tick; scheduling again replaces (cancels) the previous one. A tick fires
/// on the next wall-clock second boundary so updates land near :000 ms
/// instead of drifting with a fixed interval.
#[derive(Debug, Default)]
pub struct TickScheduler {
    next_handle: u64,
    entries: HashMap<String, ScheduledTick>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, timer_id: &str, now_ms: i64) -> TaskHandle {
        self.next_handle += 1;
        let handle = TaskHandle(self.next_handle);
        let due_at_ms = now_ms + delay_to_next_second(now_ms);
        self.entries
            .insert(timer_id.to_string(), ScheduledTick { handle, due_at_ms });
        handle
    }

    /// Cancels by handle. A stale handle (already replaced or fired) is a
    /// no-op and returns false.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let owner = self
            .entries
            .iter()
            .find(|(_, tick)| tick.handle == handle)
            .map(|(id, _)| id.clone());
        match owner {
            Some(id) => self.entries.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn cancel_timer(&mut self, timer_id: &str) -> Option<TaskHandle> {
        self.entries.remove(timer_id).map(|tick| tick.handle)
    }

    pub fn handle_for(&self, timer_id: &str) -> Option<TaskHandle> {
        self.entries.get(timer_id).map(|tick| tick.handle)
    }

    pub fn is_scheduled(&self, timer_id: &str) -> bool {
        self.entries.contains_key(timer_id)
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.entries.values().map(|tick| tick.due_at_ms).min()
    }

    /// Removes and returns every timer whose tick is due, earliest first.
    /// A fired tick is consumed; the owner must reschedule it.
    pub fn take_due(&mut self, now_ms: i64) -> Vec<String> {
        let mut due = self
            .entries
            .iter()
            .filter(|(_, tick)| tick.due_at_ms <= now_ms)
            .map(|(id, tick)| (tick.due_at_ms, id.clone()))
            .collect::<Vec<_>>();
        due.sort();
        for (_, id) in &due {
            self.entries.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
