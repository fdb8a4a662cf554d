//! Correlation waiters
//!
//! A waiter is registered for a correlation id before the request goes out. When
//! a response-kind message carrying that id is sent to the waiter's owner, the hub
//! hands it to the waiter instead of the owner's mailbox, so correlated replies
//! never race with unrelated mail.

use crate::protocol::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
struct Waiter {
    owner: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
pub(crate) struct WaiterTable {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl WaiterTable {
    fn insert(&self, owner: &str, correlation_ids: &[String], tx: &mpsc::UnboundedSender<Message>) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        for id in correlation_ids {
            waiters.insert(
                id.clone(),
                Waiter {
                    owner: owner.to_string(),
                    tx: tx.clone(),
                },
            );
        }
    }

    fn remove(&self, correlation_ids: &[String]) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        for id in correlation_ids {
            waiters.remove(id);
        }
    }

    /// Hand the message to a matching waiter, or give it back for mailbox delivery
    pub(crate) fn try_deliver(&self, message: Message) -> Result<(), Message> {
        if !message.kind.is_response() {
            return Err(message);
        }
        let Some(correlation_id) = message.correlation_id.clone() else {
            return Err(message);
        };

        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let owned_by_receiver = waiters
            .get(&correlation_id)
            .map(|w| w.owner == message.receiver)
            .unwrap_or(false);
        if !owned_by_receiver {
            return Err(message);
        }

        match waiters.remove(&correlation_id) {
            Some(waiter) => waiter.tx.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receives the responses for a set of correlation ids
///
/// Dropping the batch deregisters any ids that never answered; late replies then
/// fall through to the owner's mailbox.
#[derive(Debug)]
pub struct ResponseBatch {
    table: Arc<WaiterTable>,
    correlation_ids: Vec<String>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ResponseBatch {
    pub(crate) fn register(table: Arc<WaiterTable>, owner: &str, correlation_ids: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(owner, &correlation_ids, &tx);
        Self {
            table,
            correlation_ids,
            rx,
        }
    }

    /// Next correlated response, or `None` once `deadline` passes
    pub async fn next_before(&mut self, deadline: Instant) -> Option<Message> {
        tokio::time::timeout_at(deadline, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn correlation_ids(&self) -> &[String] {
        &self.correlation_ids
    }
}

impl Drop for ResponseBatch {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_ids);
    }
}
