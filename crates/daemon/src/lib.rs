//! The cintel daemon: a persistent source-code intelligence server for
//! C/C++/ObjC that preprocesses translation units, schedules indexing jobs
//! across a local worker pool and a LAN of peer daemons, reconciles racing
//! results first-wins, and answers symbol queries over a unix socket.

pub mod connection;
pub mod extract;
pub mod http;
pub mod jobs;
pub mod lifecycle;
pub mod peers;
pub mod preprocess;
pub mod projects;
pub mod query;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod workers;

pub use lifecycle::{Daemon, LifecycleError};
pub use server::{Client, Server, ServerError, ShutdownHandle};
