//! Listener registration handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Cancel = Box<dyn FnOnce() + Send>;

/// Handle returned by every `on_*` registration.
///
/// Calling [`Subscription::unsubscribe`] (or dropping the handle) removes the
/// listener. Unsubscribing more than once is a no-op.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    cancel: Mutex<Option<Cancel>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A handle with nothing to remove.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A set of callbacks that all receive each emitted value.
pub struct ListenerSet<T> {
    next_id: Arc<AtomicU64>,
    listeners: Arc<RwLock<Vec<(u64, Listener<T>)>>>,
}

impl<T: Clone + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Listener<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Invoke every listener with a clone of `value`.
    ///
    /// The listener list is snapshotted first, so a listener may register or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, value: T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removed_on_unsubscribe() {
        let set = ListenerSet::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sub = set.add(Arc::new(move |v| {
            s.fetch_add(v as usize, Ordering::SeqCst);
        }));

        set.emit(2);
        sub.unsubscribe();
        set.emit(5);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let set = Arc::new(ListenerSet::<()>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in = slot.clone();
        let sub = set.add(Arc::new(move |_| {
            if let Some(sub) = slot_in.lock().unwrap().take() {
                sub.unsubscribe();
            }
        }));
        *slot.lock().unwrap() = Some(sub);

        set.emit(());
        assert!(set.is_empty());
    }
}
