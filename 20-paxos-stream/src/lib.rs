//! Replicated append-only value log over a line-oriented TCP protocol.
//!
//! Every replica holds an ordered log of string values. A value is appended
//! with `push`, which runs a Paxos round across the cluster so that every
//! replica agrees on what occupies each slot. Clients read committed values
//! with `get` or subscribe to them with `pull`. Replicas talk to each other
//! over the same protocol using the `prepare`, `accept` and `set` commands.
//!
//! # Protocol
//!
//! One request per line: a command word followed by space-separated
//! arguments. Each request produces one response line, except `pull`, which
//! streams one line per value until the connection closes. Failures are
//! reported as `error: <reason>`.
//!
//! | command   | arguments     | response                         |
//! |-----------|---------------|----------------------------------|
//! | `push`    | `v`           | `ok` once `v` is committed       |
//! | `get`     | `n`           | values from index `n` to head    |
//! | `pull`    | `n`           | values from `n`, then new ones   |
//! | `status`  |               | JSON snapshot of the replica     |
//! | `prepare` | `n`           | promise flag and accepted value  |
//! | `accept`  | `n id v`      | `true` or `false`                |
//! | `set`     | `n id v`      | `ok`                             |
//!
//! # Modules
//!
//! - [`request`]: line parsing and typed request builders
//! - [`handler`]: dispatch of one request to the log or the consensus node
//! - [`log`]: in-memory log with change notification
//! - [`paxos`]: acceptor, proposer and the replica abstraction
//! - [`server`] / [`client`]: TCP transport
//! - [`runtime`]: wiring a replica together

pub mod cli;
pub mod client;
pub mod command;
pub mod context;
pub mod error;
pub mod handler;
pub mod log;
pub mod paxos;
pub mod request;
pub mod runtime;
pub mod server;
pub mod wire;

pub use command::Command;
pub use context::Context;
pub use error::{Error, Result};
pub use handler::Handler;
pub use request::Request;
