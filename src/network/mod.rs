//! Networking
//!
//! The non-deterministic edge of the server: the wire protocol, the
//! identity store boundary, the session directory and the WebSocket
//! connection router.

pub mod directory;
pub mod identity;
pub mod protocol;
pub mod router;

pub use directory::SessionDirectory;
pub use protocol::{ClientPacket, ServerPacket};
pub use router::{QuizServer, ServerConfig};
