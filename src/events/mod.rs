//! # Events
//!
//! Fire-and-forget lifecycle notifications for observers of the
//! orchestrator (dashboards, audit trails, tests).

pub mod publisher;
pub mod types;

pub use publisher::EventPublisher;
pub use types::{OrchestrationEvent, PublishedEvent};
