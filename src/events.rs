//! Event-Registrierung mit expliziten Subscription-Handles
//!
//! Transports melden ihre Events über einen `EventEmitter`. Jeder
//! registrierte Handler liefert ein `Subscription`-Handle zurück; wird das
//! Handle fallengelassen oder widerrufen, ist genau dieser Handler entfernt.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

// ============================================================================
// EVENT EMITTER
// ============================================================================

/// Verteilt Events synchron an alle registrierten Handler
pub struct EventEmitter<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Registriert einen Handler
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().handlers.retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Liefert ein Event an alle Handler aus
    ///
    /// Die Handler laufen ausserhalb des Registry-Locks, damit sie selbst
    /// Subscriptions anlegen oder widerrufen dürfen.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .registry
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().handlers.len()
    }

    /// Entfernt alle Handler
    pub fn clear(&self) {
        self.registry.lock().handlers.clear();
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.registry.lock().handlers.len())
            .finish()
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Handle auf einen registrierten Handler
///
/// Drop widerruft die Registrierung.
#[must_use = "dropping a Subscription removes the handler immediately"]
pub struct Subscription {
    revoke: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(revoke: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            revoke: Some(Box::new(revoke)),
        }
    }

    /// Subscription ohne Wirkung (z.B. für Fakes)
    pub fn noop() -> Self {
        Self { revoke: None }
    }

    /// Widerruft den Handler sofort
    pub fn revoke(mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(revoke) = self.revoke.take() {
            revoke();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.revoke.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_handler() {
        let emitter = EventEmitter::<u32>::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let sum_clone = Arc::clone(&sum);

        let _sub = emitter.on(move |v| {
            sum_clone.fetch_add(*v as usize, Ordering::SeqCst);
        });

        emitter.emit(&3);
        emitter.emit(&4);
        assert_eq!(sum.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_drop_revokes_only_own_handler() {
        let emitter = EventEmitter::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let first = emitter.on(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _second = emitter.on(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        drop(first);
        emitter.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_revoke_after_emitter_dropped() {
        let emitter = EventEmitter::<()>::new();
        let sub = emitter.on(|_| {});
        drop(emitter);

        // Registry ist weg, Widerruf darf trotzdem nicht fehlschlagen
        sub.revoke();
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let emitter = Arc::new(EventEmitter::<()>::new());
        let held = Arc::new(Mutex::new(Vec::new()));

        let emitter_clone = Arc::clone(&emitter);
        let held_clone = Arc::clone(&held);
        let _sub = emitter.on(move |_| {
            held_clone.lock().push(emitter_clone.on(|_| {}));
        });

        emitter.emit(&());
        assert_eq!(emitter.listener_count(), 2);
    }
}
