//! Request/response correlation.
//!
//! Outstanding `iq` requests are keyed by their `id`. Each entry is either a
//! one-shot waiter (synchronous requests) or a callback (asynchronous
//! requests) and is removed exactly once: when its reply arrives, when the
//! waiter gives up, or when the connection is torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Result, XmppError};
use crate::stanza::Iq;

/// Invoked with the request id and the reply, or the reason no reply will come.
pub type IqCallback = Box<dyn FnOnce(String, Result<Iq>) + Send + 'static>;

pub type ReplyReceiver = oneshot::Receiver<Result<Iq>>;

enum Pending {
    Waiter(oneshot::Sender<Result<Iq>>),
    Callback(IqCallback),
}

impl Pending {
    fn complete(self, id: String, reply: Result<Iq>) {
        match self {
            // The receiver may have timed out and gone away.
            Pending::Waiter(tx) => {
                let _ = tx.send(reply);
            }
            // Callbacks never run on the dispatcher so a slow one cannot
            // hold up delivery of later stanzas.
            Pending::Callback(cb) => {
                tokio::task::spawn_blocking(move || cb(id, reply));
            }
        }
    }
}

pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Pending>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh request identifier, unique for the lifetime of this table.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn insert(&self, id: &str, entry: Pending) -> Result<()> {
        let mut table = self.table();
        if table.contains_key(id) {
            return Err(XmppError::Misuse(format!("request id {} is already pending", id)));
        }
        table.insert(id.to_string(), entry);
        Ok(())
    }

    /// Register a waiter for the reply to `id`.
    pub fn register_waiter(&self, id: &str) -> Result<ReplyReceiver> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Pending::Waiter(tx))?;
        Ok(rx)
    }

    /// Register a callback for the reply to `id`.
    pub fn register_callback(&self, id: &str, callback: IqCallback) -> Result<()> {
        self.insert(id, Pending::Callback(callback))
    }

    /// Forget `id` without completing it (the waiter gave up or the send failed).
    pub fn cancel(&self, id: &str) -> bool {
        self.table().remove(id).is_some()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand a reply to whoever is waiting for it.
    ///
    /// Returns the stanza back if it is not a reply to one of our pending
    /// requests, so the caller can dispatch it as an ordinary event.
    pub fn resolve(&self, iq: Iq) -> Option<Iq> {
        if iq.is_request() {
            return Some(iq);
        }
        let Some(id) = iq.id().map(str::to_string) else {
            return Some(iq);
        };
        // Lookup and removal happen under one lock; the entry is completed
        // after the lock is released.
        let entry = self.table().remove(&id);
        match entry {
            Some(entry) => {
                trace!(id = %id, "Resolved pending request");
                entry.complete(id, Ok(iq));
                None
            }
            None => Some(iq),
        }
    }

    /// Fail every outstanding request with `reason`. Returns how many there were.
    pub fn release_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Pending)> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.complete(id, Err(XmppError::Disconnected(reason.to_string())));
        }
        if count > 0 {
            debug!(count, reason, "Released pending requests");
        }
        count
    }
}
