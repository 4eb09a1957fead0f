//! Structured, namespace-filtered logging with in-memory retention and
//! optional remote forwarding over a WebSocket (spec.md §4.3).
//!
//! A [`LoggerGroup`] owns the shared state (namespace filter, retained
//! history, remote fan-out); individual [`Logger`] handles are cheap,
//! namespaced views over one group, the same cheap-handle-over-shared-actor
//! shape used throughout this workspace (see `percy_queue::PriorityQueue`).

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

mod entry;
mod error;
mod filter;
mod logger;
mod progress;
mod remote;

pub use entry::{LogEntry, WireMessage};
pub use error::LoggerError;
pub use filter::{LogLevel, NamespaceFilter};
pub use logger::{Logger, LoggerGroup, RemoteEnv};
pub use remote::{connect, serve};
