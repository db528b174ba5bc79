//! Listener registration and failure-isolated event delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::error::XmppError;
use crate::stanza::{Iq, Message, Presence};

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerList<T: ?Sized> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerList<T> {
    fn add(&self, listener: Listener<T>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Invoke every listener. A panicking listener is logged and skipped.
    fn raise(&self, kind: &'static str, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = kind, "Listener panicked, continuing dispatch");
            }
        }
    }
}

/// Subscribers for the engine's public events.
#[derive(Default)]
pub struct Listeners {
    error: ListenerList<XmppError>,
    iq: ListenerList<Iq>,
    message: ListenerList<Message>,
    presence: ListenerList<Presence>,
}

impl Listeners {
    pub fn on_error(&self, f: impl Fn(&XmppError) + Send + Sync + 'static) {
        self.error.add(Arc::new(f));
    }

    pub fn on_iq(&self, f: impl Fn(&Iq) + Send + Sync + 'static) {
        self.iq.add(Arc::new(f));
    }

    pub fn on_message(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        self.message.add(Arc::new(f));
    }

    pub fn on_presence(&self, f: impl Fn(&Presence) + Send + Sync + 'static) {
        self.presence.add(Arc::new(f));
    }

    pub(crate) fn raise_error(&self, e: &XmppError) {
        self.error.raise("error", e);
    }

    pub(crate) fn raise_iq(&self, iq: &Iq) {
        self.iq.raise("iq", iq);
    }

    pub(crate) fn raise_message(&self, m: &Message) {
        self.message.raise("message", m);
    }

    pub(crate) fn raise_presence(&self, p: &Presence) {
        self.presence.raise("presence", p);
    }
}
