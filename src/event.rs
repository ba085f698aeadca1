use crate::error::{Error, Result};
use std::sync::mpsc::{channel, Receiver, Sender};

/// What an event handler asks the caller to do after it has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Continue,
    Stop,
}

/// The event types the oracle can notify. Only one type is currently
/// supported, fired just before `compute` terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    BeforeTermination,
}

pub type EventHandler = Box<dyn FnMut() -> EventAction + Send>;

/// Registry of event handlers, keyed by type and by the id returned at
/// registration time. Ids stay valid across removals of other handlers.
#[derive(Default)]
pub struct EventRegistry {
    before_termination: Vec<Option<EventHandler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new handler and returns its id. The id is only unique
    /// within its event type.
    pub fn set_handler(&mut self, event_type: EventType, handler: EventHandler) -> usize {
        let handlers = self.handlers_mut(event_type);
        handlers.push(Some(handler));
        handlers.len() - 1
    }

    /// Unregisters the handler with the given id. The slot is kept so the
    /// ids of the remaining handlers do not shift.
    pub fn reset_handler(&mut self, event_type: EventType, id: usize) -> Result<()> {
        let handlers = self.handlers_mut(event_type);
        match handlers.get_mut(id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                // drop empty tail slots so ids can be reused
                while handlers.last().is_some_and(|slot| slot.is_none()) {
                    handlers.pop();
                }
                Ok(())
            }
            _ => Err(Error::OutOfRange(format!(
                "no event handler with id {id} for type {event_type:?}"
            ))),
        }
    }

    /// Runs every handler of the given type, stopping early if one of
    /// them returns [`EventAction::Stop`].
    pub fn fire(&mut self, event_type: EventType) -> EventAction {
        for handler in self.handlers_mut(event_type).iter_mut().flatten() {
            if handler() == EventAction::Stop {
                return EventAction::Stop;
            }
        }
        EventAction::Continue
    }

    fn handlers_mut(&mut self, event_type: EventType) -> &mut Vec<Option<EventHandler>> {
        match event_type {
            EventType::BeforeTermination => &mut self.before_termination,
        }
    }
}

/// Outbound modification messages for the master solver driving the
/// oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Linearizations were stored in the global pool under these names.
    PoolAdded(Vec<usize>),
    /// Linearizations were removed from the global pool. An empty list
    /// means that every entry was removed.
    PoolRemoved(Vec<usize>),
    /// Everything changed: cached values and every pool constant are no
    /// longer valid.
    NaNShift,
    /// Decision variables with these indices were removed.
    VariablesRemoved(Vec<usize>),
}

/// Fan-out channel for [`Modification`] messages. Subscribers that have
/// been dropped are pruned on the next broadcast.
#[derive(Default)]
pub struct ModificationBus {
    senders: Vec<Sender<Modification>>,
}

impl ModificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<Modification> {
        let (sender, receiver) = channel();
        self.senders.push(sender);
        receiver
    }

    pub fn broadcast(&mut self, modification: Modification) {
        self.senders
            .retain(|sender| sender.send(modification.clone()).is_ok());
    }
}
