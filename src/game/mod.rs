//! Game Logic
//!
//! Everything that makes up one round of the quiz: durable player
//! identities, the question corpus, and the session state machine.
//!
//! - `player`: durable identity with multi-connection fan-out
//! - `question`: question + decoy-answer supplier
//! - `session`: waiting room, countdown, question/result loop, results

pub mod player;
pub mod question;
pub mod session;

pub use player::{PlayerId, PlayerIdentity};
pub use question::QuestionCorpus;
pub use session::{GameId, GamePhase, GameSession, SessionConfig, SessionError};
