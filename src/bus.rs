//! # Event Bus
//!
//! Process-local typed publish/subscribe. Every event type gets its own
//! broadcast channel with a fixed replay/lag buffer; publishing never
//! blocks the publisher, and a subscriber that falls too far behind
//! observes a `Lagged` gap rather than slowing the stack down. Dropping
//! the receiver unsubscribes.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::identity::PeerId;
use crate::transport::Direction;

/// Default per-type channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Anything publishable on the bus
pub trait Event: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Event for T {}

/// Typed pub/sub hub
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl EventBus {
    /// Bus with the default buffer size
    pub fn new() -> EventBus {
        EventBus::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with `capacity` buffered events per type
    pub fn with_capacity(capacity: usize) -> EventBus {
        EventBus {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender<E: Event>(&self) -> broadcast::Sender<E> {
        let mut channels = self.channels.lock();
        let entry = channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(broadcast::channel::<E>(self.capacity).0));
        entry
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("channel type keyed by TypeId")
            .clone()
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish<E: Event>(&self, event: E) -> usize {
        self.sender::<E>().send(event).unwrap_or(0)
    }

    /// Subscribe to all future events of type `E`
    pub fn subscribe<E: Event>(&self) -> broadcast::Receiver<E> {
        self.sender::<E>().subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("types", &self.channels.lock().len())
            .finish()
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// The local host's protocol handler table changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProtocolsUpdated {
    /// Newly registered protocol ids
    pub added: Vec<String>,
    /// Deregistered protocol ids
    pub removed: Vec<String>,
}

/// A connection to a peer was established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnected {
    /// The remote peer
    pub peer: PeerId,
    /// Their transport address
    pub addr: Multiaddr,
    /// Who initiated
    pub direction: Direction,
}

/// A connection to a peer went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDisconnected {
    /// The remote peer
    pub peer: PeerId,
    /// Root-cause kind of the teardown
    pub cause: ErrorKind,
}

/// A listener came up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddressAdded(
    /// The bound address
    pub Multiaddr,
);

/// A listener went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddressRemoved(
    /// The address no longer listened on
    pub Multiaddr,
);

// ============================================================================
// TESTS
// ============================================================================
