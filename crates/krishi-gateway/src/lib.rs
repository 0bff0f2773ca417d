pub mod connection;
pub mod handler;
pub mod rooms;

pub use handler::{Gateway, HandshakeError, Session};
pub use rooms::{ConnId, Room, Rooms};
