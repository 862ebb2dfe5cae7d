//! # Event Bus Module
//!
//! Publish/subscribe channel between the communication layer and whatever
//! UI sits on top of it. Publishers emit typed [`AppEvent`]s; subscribers
//! filter by category or by collaborator event name.
//!
//! ```rust,ignore
//! use snapkit_core::event_bus::{AppEvent, EventBus, EventFilter};
//!
//! let bus = EventBus::new();
//! let id = bus.subscribe(EventFilter::Names(vec!["connection:connected"]), |event| {
//!     println!("{}", event.description());
//! });
//! bus.unsubscribe(id);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;
