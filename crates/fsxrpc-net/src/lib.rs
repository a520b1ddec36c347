#![warn(missing_docs)]

//! fsxrpc network subsystem: raw IPv4 stream sockets with deadline-bounded
//! reliable I/O, and host interface enumeration.
//!
//! Everything here is blocking and meant to be driven from dedicated OS
//! threads. Sockets are never shared between threads.

pub mod deadline;
pub mod error;
pub mod ifconf;
pub mod socket;

pub use deadline::Deadline;
pub use error::{NetError, NetResult, SocketSetupError};
pub use ifconf::{enumerate_interfaces, query_interface, InterfaceInfo, IFNAMSIZ};
pub use socket::StreamSocket;
