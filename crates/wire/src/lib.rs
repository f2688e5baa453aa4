//! The cintel wire layer.
//!
//! Every persistent connection, local clients and workers on the unix
//! socket as well as peer daemons on TCP, speaks the same length-prefixed
//! CBOR frames
//! carrying [`Message`] values. Client queries ride inside `Message::Query`
//! and are answered with a stream of `Message::Output` lines followed by a
//! `Message::Finish` code.

mod codec;
mod error;
mod message;
mod method;
mod protocol;
mod worker;

pub use codec::{FramedIo, MAX_FRAME_LEN, decode, encode, framed, recv, send};
pub use error::WireError;
pub use message::{JobResponse, Message, ShippedJob};
pub use method::Method;
pub use protocol::Request;
pub use worker::{WorkerDestination, WorkerJob, read_worker_job, write_worker_job};
