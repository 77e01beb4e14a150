//! pinrelay node - owns a set of pins and serves them to the dispatcher.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────────────┐
//!              │     Dispatcher     │
//!              └─────────▲──────────┘
//!                        │ register / check_for_actions / submit_message
//!              ┌─────────┴──────────┐
//!              │ ReconnectingClient │───── schedule ops ────┐
//!              └─────────┬──────────┘                       ▼
//!                        │ commands             ┌────────────────────┐
//!                        ▼                      │     Scheduler      │
//!              ┌────────────────────┐◀──────────┤ (ScheduleQueue)    │
//!              │   LocalDispatch    │  due      └────────────────────┘
//!              │ Actuator + reports │  commands
//!              └────────────────────┘
//! ```
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, or `todo!()` outside tests.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod rpc;
pub mod scheduler;

pub use client::{ClientConfig, ClientState, ReconnectingClient};
pub use config::{ConfigError, NodeConfig, ScheduleEntry};
pub use dispatch::{report_channel, LocalDispatch};
pub use error::{NodeError, Result};
pub use node::run_node;
pub use rpc::{DaemonConnection, REQUEST_TIMEOUT};
pub use scheduler::{spawn_scheduler, SchedulerHandle};
