//! pinrelay Daemon - Session registry, long-poll dispatch and control server
//!
//! This crate provides the dispatcher side of pinrelay:
//! - `registry` - Session registry actor owning pin ownership and inboxes
//! - `dispatch` - Routing of commands and schedule operations, long polls
//! - `chat` - Chat-style text commands turned into dispatcher calls
//! - `server` - TCP server speaking the newline-delimited JSON protocol
//! - `config` - Daemon configuration file
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      pinrelayd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│        Dispatcher           │   │
//! │  │  (TcpListener)  │     │  (route, poll, messages)    │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ commands          │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │       RegistryActor         │   │
//! │  │ (node / control)│     │  (session state owner)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod chat;
pub mod config;
pub mod dispatch;
pub mod registry;
pub mod server;
