//! Per-agent inbox: FIFO queue plus a wakeup for blocked receivers

use crate::protocol::Message;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct Mailbox {
    pub(crate) agent_id: String,
    meta: RwLock<Map<String, Value>>,
    active: AtomicBool,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    pub(crate) registered_at: DateTime<Utc>,
}

impl Mailbox {
    pub(crate) fn new(agent_id: &str, meta: Map<String, Value>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            meta: RwLock::new(meta),
            active: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            registered_at: Utc::now(),
        }
    }

    pub(crate) fn push(&self, message: Message) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Message> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Wait up to `timeout` for a message; `None` means do not wait at all
    pub(crate) async fn pop(&self, timeout: Option<Duration>) -> Option<Message> {
        let Some(timeout) = timeout else {
            return self.try_pop();
        };
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            // notify_one stores a permit, so a push between try_pop and here is not lost
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Remove queued messages matching `predicate`, keeping the rest in order
    pub(crate) fn drain_matching<F>(&self, predicate: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let (drained, kept): (VecDeque<Message>, VecDeque<Message>) =
            queue.drain(..).partition(|m| predicate(m));
        *queue = kept;
        drained.into_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        // Wake a blocked receiver so it can observe the change
        self.notify.notify_waiters();
    }

    pub(crate) fn meta(&self) -> Map<String, Value> {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_meta(&self, meta: Map<String, Value>) {
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = meta;
    }
}
