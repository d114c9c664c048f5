//! Named-event subscription and synchronous dispatch.
//!
//! Connections hold an [`EventEmitter`] and expose `on`/`once`/`remove_listener`
//! by delegation. Listeners are identified by the [`ListenerId`] handed out at
//! registration, so a `once` listener can be removed without the callback ever
//! referring to itself.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Identity of one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback<E> = Rc<dyn Fn(&E)>;

struct Entry<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: Rc::clone(&self.callback),
        }
    }
}

/// Per-instance listener table.
///
/// All methods take `&self`; a callback may therefore hold an `Rc` to the
/// emitter and emit or unsubscribe from inside its own invocation.
pub struct EventEmitter<E> {
    listeners: RefCell<HashMap<String, Vec<Entry<E>>>>,
    next_id: Cell<u64>,
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    /// Registration primitive. Returns the id needed by [`remove_listener`](Self::remove_listener).
    pub fn add_listener<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&E) + 'static,
    {
        self.register(event, false, Rc::new(callback))
    }

    /// Registers a listener that fires on the next emission only.
    pub fn add_once_listener<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&E) + 'static,
    {
        self.register(event, true, Rc::new(callback))
    }

    pub fn on<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&E) + 'static,
    {
        self.add_listener(event, callback);
        self
    }

    pub fn once<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&E) + 'static,
    {
        self.add_once_listener(event, callback);
        self
    }

    /// Invokes every listener registered for `event`, in registration order.
    ///
    /// The listener list is snapshotted first: listeners added during the
    /// emission wait for the next one, and removing a sibling never shifts
    /// the iteration. A `once` entry is taken out of the table before its
    /// callback runs, and is skipped if a nested emission already consumed it.
    pub fn emit(&self, event: &str, payload: &E) -> &Self {
        let snapshot: Vec<Entry<E>> = match self.listeners.borrow().get(event) {
            Some(entries) if !entries.is_empty() => entries.clone(),
            _ => return self,
        };

        for entry in snapshot {
            if entry.once && !self.take(event, entry.id) {
                continue;
            }
            (entry.callback)(payload);
        }

        self
    }

    /// Removes the listener registered under `id`. Unknown ids are ignored.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> &Self {
        self.take(event, id);
        self
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.borrow().get(event).map_or(0, Vec::len)
    }

    fn register(&self, event: &str, once: bool, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.listeners
            .borrow_mut()
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, once, callback });
        id
    }

    fn take(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let Some(index) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        entries.remove(index);
        if entries.is_empty() {
            listeners.remove(event);
        }
        true
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        let mut counts: Vec<(&String, usize)> =
            listeners.iter().map(|(name, entries)| (name, entries.len())).collect();
        counts.sort();
        f.debug_struct("EventEmitter").field("listeners", &counts).finish()
    }
}
