//! Control-plane rendezvous sockets.
//!
//! Every worker gets its own Unix socket, allocated by the parent before the
//! worker is launched. The worker dials back to it after dropping
//! privileges; accepted connections are handed to the routing layer.

mod server;

pub use server::{ControlError, ControlSocketServer, RendezvousAllocator, SocketConn};
