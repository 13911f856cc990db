//! Ring buffer of operator notifications. Ids are assigned under the
//! hub's lock in publisher order and are never reused, even across
//! evictions.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

struct State {
    buffer: VecDeque<Notification>,
    next_id: u64,
}

pub struct NotificationHub {
    capacity: usize,
    state: Mutex<State>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    pub fn publish(
        &self,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        state.buffer.push_back(Notification {
            id,
            severity,
            title: title.into(),
            message: message.into(),
            time: chrono::Utc::now(),
        });
        if state.buffer.len() > self.capacity {
            state.buffer.pop_front();
        }
        id
    }

    pub fn get_since(&self, id: u64) -> Vec<Notification> {
        self.state
            .lock()
            .buffer
            .iter()
            .filter(|n| n.id > id)
            .cloned()
            .collect()
    }

    pub fn get_all(&self) -> Vec<Notification> {
        self.state.lock().buffer.iter().cloned().collect()
    }

    pub fn last_id(&self) -> u64 {
        self.state
            .lock()
            .buffer
            .back()
            .map(|n| n.id)
            .unwrap_or(0)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
