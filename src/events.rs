//! In-process signal relay.
//!
//! Carries the small fixed set of cross-component signals. Components get the
//! bus injected; a [`Subscription`] unregisters its listener when dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Login,
    UserUpdated,
    InvoicesUpdated,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Login, Signal::UserUpdated, Signal::InvoicesUpdated];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Login => "login",
            Signal::UserUpdated => "userUpdated",
            Signal::InvoicesUpdated => "invoicesUpdated",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signal::ALL
            .into_iter()
            .find(|signal| signal.as_str() == s)
            .ok_or_else(|| format!("unknown signal: {}", s))
    }
}

type Listener = Arc<dyn Fn(Signal) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<Signal, Vec<(u64, Listener)>>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, signal: Signal, listener: F) -> Subscription
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(signal)
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            signal,
            id,
        }
    }

    /// Call every listener of `signal` and return how many were notified.
    /// Listeners run on the caller's stack; long work belongs on a task.
    pub fn emit(&self, signal: Signal) -> usize {
        // Snapshot so listeners may subscribe or unsubscribe re-entrantly.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .get(&signal)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        tracing::debug!("Emitting {} to {} listener(s)", signal, listeners.len());

        for listener in &listeners {
            listener(signal);
        }
        listeners.len()
    }

    pub fn listener_count(&self, signal: Signal) -> usize {
        self.inner
            .listeners
            .read()
            .get(&signal)
            .map_or(0, Vec::len)
    }
}

/// Registration handle; dropping it removes the listener.
pub struct Subscription {
    bus: Weak<BusInner>,
    signal: Signal,
    id: u64,
}

impl Subscription {
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some(entries) = bus.listeners.write().get_mut(&self.signal) {
                entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
