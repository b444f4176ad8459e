//! Event mechanics: the `Event` contract, envelopes, and a pub/sub bus.
//!
//! The catalog publishes product events here; the sync engine subscribes.
//! Nothing in this crate knows about marketplaces.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
