//! pinrelay Core - Shared types for remote pin control
//!
//! This crate provides the domain types shared between the dispatcher
//! daemon (pinrelayd) and the nodes that own the pins (pinrelay-node).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod actuator;
pub mod error;
pub mod pin;
pub mod pin_registry;
pub mod queue;
pub mod registration;
pub mod schedule;
pub mod session;

// Re-exports for convenience
pub use actuator::{Actuator, SimulatedActuator};
pub use error::{DomainError, DomainResult};
pub use pin::{validate_pin_name, PinCommand, TextMessage, RESERVED_PIN_KEYWORD};
pub use pin_registry::PinRegistry;
pub use queue::ScheduleQueue;
pub use registration::{ActionBatch, RegistrationRequest, RegistrationResult, RegistrationStatus};
pub use schedule::{ScheduleOperation, ScheduledCommand, TimeOfDay};
pub use session::{NodeView, SessionId};
