//! The flow's event table: `idle`, `uncaughtException`, `reset`.

use std::collections::HashMap;

use promise::FlowError;

#[derive(Clone, Debug)]
pub enum Event {
    Idle,
    UncaughtException(FlowError),
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Idle,
    UncaughtException,
    Reset,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Idle => EventKind::Idle,
            Event::UncaughtException(_) => EventKind::UncaughtException,
            Event::Reset => EventKind::Reset,
        }
    }
}

/// Handle returned by [`EventTable::on`]/[`EventTable::once`], used to
/// unregister a specific listener with `off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    callback: Box<dyn FnMut(&Event)>,
    once: bool,
}

#[derive(Default)]
pub(crate) struct EventTable {
    listeners: HashMap<EventKind, Vec<Listener>>,
    next_id: u64,
}

impl EventTable {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 1,
        }
    }

    fn register(&mut self, kind: EventKind, callback: Box<dyn FnMut(&Event)>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.entry(kind).or_default().push(Listener {
            id,
            callback,
            once,
        });
        id
    }

    pub fn on(&mut self, kind: EventKind, callback: Box<dyn FnMut(&Event)>) -> ListenerId {
        self.register(kind, callback, false)
    }

    pub fn once(&mut self, kind: EventKind, callback: Box<dyn FnMut(&Event)>) -> ListenerId {
        self.register(kind, callback, true)
    }

    pub fn off(&mut self, id: ListenerId) {
        for listeners in self.listeners.values_mut() {
            listeners.retain(|l| l.id != id);
        }
    }

    /// Fires `event` to every listener registered for its kind, in
    /// registration order, removing `once` listeners afterward.
    pub fn emit(&mut self, event: &Event) {
        let kind = event.kind();
        let Some(listeners) = self.listeners.get_mut(&kind) else {
            return;
        };
        for listener in listeners.iter_mut() {
            (listener.callback)(event);
        }
        listeners.retain(|l| !l.once);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn once_fires_exactly_once() {
        let mut table = EventTable::new();
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        table.once(EventKind::Idle, Box::new(move |_| *count2.borrow_mut() += 1));
        table.emit(&Event::Idle);
        table.emit(&Event::Idle);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn off_removes_listener() {
        let mut table = EventTable::new();
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        let id = table.on(EventKind::Reset, Box::new(move |_| *count2.borrow_mut() += 1));
        table.off(id);
        table.emit(&Event::Reset);
        assert_eq!(*count.borrow(), 0);
    }
}
