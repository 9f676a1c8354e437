#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Inter-process plumbing for workhive
//!
//! - [`Hub`]: rendezvous service that authenticates freshly spawned workers
//!   with single-use keys and hands back an established [`Channel`]
//! - [`Channel`]: ordered, length-delimited message transport
//! - [`Context`]: one managed worker process ([`ProcessContext`]) or thread
//!   ([`ThreadContext`])
//! - [`remote`]: the worker side of the handshake

pub mod channel;
pub mod context;
pub mod hub;
pub mod packet;
pub mod remote;
pub mod transport;

pub use channel::Channel;
pub use context::{Context, ContextExt, ProcessContext, ThreadContext};
pub use hub::Hub;
pub use packet::{ExitResult, Packet, PanicReport};
pub use remote::RemoteChannel;
pub use transport::Endpoint;
