//! # Quiz Royale Game Server
//!
//! Authoritative server for Quiz Royale: players are matched into rounds,
//! answer timed multiple-choice questions, and lose health when their
//! answer is not among the majority; survivors proceed until two or fewer
//! remain.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    QUIZ ROYALE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/            - Game logic                               │
//! │  ├── player.rs    - Durable identities, connection fan-out   │
//! │  ├── question.rs  - Question corpus and decoy drawing        │
//! │  └── session.rs   - Phase state machine and tallying         │
//! │                                                              │
//! │  network/         - Networking                               │
//! │  ├── protocol.rs  - JSON packet types                        │
//! │  ├── identity.rs  - Identity store boundary + registry       │
//! │  ├── directory.rs - Matchmaking and session lifecycle        │
//! │  └── router.rs    - WebSocket server and packet dispatch     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Each session's packet handling and timer callbacks are serialized by the
//! session's own lock, so tallying, health mutation and the broadcasts they
//! produce are observed as one atomic step by every client of that session.
//! Independent sessions share nothing but the directory map and the
//! players' session back-references, each behind its own narrow lock.
//! Outbound packets are best-effort, fire-and-forget per connection; a dead
//! socket never blocks a session.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::player::{PlayerId, PlayerIdentity};
pub use game::question::{CorpusError, QuestionCorpus};
pub use game::session::{
    GameId, GamePhase, GameSession, SessionConfig, SessionError, MIN_ALIVE_TO_CONTINUE,
    STARTING_LIFES,
};
pub use network::directory::{SessionDirectory, SessionSnapshot};
pub use network::identity::{IdentityRecord, IdentityStore, PlayerRegistry};
pub use network::protocol::{ClientPacket, GameRetransmission, ServerPacket, HIDDEN_ANSWER};
pub use network::router::{QuizServer, ServerConfig, ServerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
