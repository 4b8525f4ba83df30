//! # Event Selection
//!
//! The [`Selectable`] contract, the [`EventMultiplexer`] that schedules
//! between selectables, and the non-channel sources ([`SelectableEvent`],
//! [`SelectableTimer`]).

pub mod event;
pub mod multiplexer;
pub mod selectable;

pub use event::{EventTrigger, SelectableEvent, SelectableTimer};
pub use multiplexer::{EventMultiplexer, MultiplexerStats, SelectOutcome, SelectableId};
pub use selectable::Selectable;
