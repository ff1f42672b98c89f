//! Events Domain
//!
//! Names and payloads of the events exchanged between the user service, the
//! task service and the notification worker.
//!
//! ```text
//! user service ──► user-signuped ─┐
//!                                 ├─► user_events (topic) ─► queue per event ─► events worker
//! task service ──► task-created ──┤
//!              └─► task-updated ──┘
//! ```

mod names;
mod payloads;

pub use names::EventName;
pub use payloads::{DomainEvent, TaskCreated, TaskUpdated, UserSignedUp, decode_payload};
