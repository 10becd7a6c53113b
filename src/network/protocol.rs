//! Protocol Packets
//!
//! Wire format for client-server communication over WebSocket.
//! All packets are JSON objects tagged by a `type` discriminator; timestamps
//! travel as epoch milliseconds and durations as seconds, so clients derive
//! remaining time locally from `begin + duration * 1000`.

use serde::{Deserialize, Serialize};

use crate::game::player::PlayerId;

/// Reserved answer value broadcast in place of another player's live,
/// in-progress choice. Never stored in session state.
pub const HIDDEN_ANSWER: i32 = -1;

// =============================================================================
// CLIENT -> SERVER PACKETS
// =============================================================================

/// Packets sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientPacket {
    /// Liveness probe.
    Ping,

    /// Authenticate this connection, either as a returning player
    /// (id + token) or as a new one.
    Authentication {
        /// Durable id of a returning player.
        #[serde(default)]
        player_id: Option<PlayerId>,
        /// Secret token matching `player_id`.
        #[serde(default)]
        token: Option<String>,
        /// Requested display name for a new player.
        #[serde(default)]
        name: Option<String>,
    },

    /// Ask to be matched into a game.
    JoinGame,

    /// Leave the current game (waiting room or results only).
    LeaveGame,

    /// Submit an answer index for the live question.
    AnswerQuestion {
        /// Chosen answer index.
        answer: i32,
    },
}

// =============================================================================
// SERVER -> CLIENT PACKETS
// =============================================================================

/// Packets sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerPacket {
    /// Reply to `ping`.
    Pong,

    /// Authentication succeeded. `game` carries a full retransmission when
    /// the player was already mid-session.
    Authenticate {
        /// Durable player id.
        id: PlayerId,
        /// Secret token to present on the next authentication.
        token: String,
        /// Display name.
        name: String,
        /// Current-session snapshot for reconnecting clients.
        game: Option<GameRetransmission>,
    },

    /// Sent to a player who just joined a game.
    JoinGame {
        /// Current roster, in join order (including the recipient).
        players: Vec<PlayerSummary>,
        /// Session capacity.
        #[serde(rename = "maxPlayers")]
        max_players: usize,
    },

    /// Another player joined the recipient's game.
    NewPlayer {
        /// The joining player.
        player: PlayerSummary,
    },

    /// A player left the waiting room.
    RemovePlayer {
        /// The leaving player.
        player_id: PlayerId,
    },

    /// The waiting room filled; the game begins after this countdown.
    TimerBeforeBegin {
        /// Countdown anchor, epoch milliseconds.
        begin: i64,
        /// Countdown length, seconds.
        duration: u64,
    },

    /// The question loop starts with these health values.
    GameBegin {
        /// `(player id, health)` for every participant.
        #[serde(rename = "playerLifes")]
        player_lifes: Vec<(PlayerId, u8)>,
    },

    /// A new question is live.
    NewQuestion {
        /// Question text and answer choices.
        question: QuestionSummary,
        /// Answer-window anchor, epoch milliseconds.
        begin_timestamp: i64,
        /// Answer-window length, seconds.
        duration: u64,
    },

    /// A player locked in an answer. The submitter receives the real index;
    /// everyone else receives [`HIDDEN_ANSWER`] until results.
    PlayerAnswer {
        /// The answering player.
        player_id: PlayerId,
        /// Answer index, or the hidden sentinel.
        answer: i32,
    },

    /// The answer window closed; full tally and damage for the round.
    QuestionResults {
        /// Every recorded answer, unredacted.
        #[serde(rename = "playerAnswers")]
        player_answers: Vec<(PlayerId, i32)>,
        /// `(player id, new health)` for every player damaged this round.
        #[serde(rename = "playersDamaged")]
        players_damaged: Vec<(PlayerId, u8)>,
        /// Result-window anchor, epoch milliseconds.
        #[serde(rename = "resultBeginTimestamp")]
        result_begin_timestamp: i64,
        /// Result-window length, seconds.
        #[serde(rename = "resultDuration")]
        result_duration: u64,
        /// Every answer index that reached the top tally.
        #[serde(rename = "winningAnswers")]
        winning_answers: Vec<u32>,
    },

    /// The game ended; at most two players survived.
    GameFinish {
        /// Ids of the surviving players.
        winners: Vec<PlayerId>,
    },
}

// =============================================================================
// SHARED PAYLOADS
// =============================================================================

/// Roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSummary {
    /// Durable player id.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
}

/// Question text plus its fixed-order answer choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSummary {
    /// Question text.
    pub text: String,
    /// Answer choices; index order is stable for the round.
    pub answers: Vec<String>,
}

/// Full current-session snapshot sent to a reconnecting client, so it can
/// resume without replaying history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRetransmission {
    /// Roster in join order.
    pub players: Vec<PlayerSummary>,
    /// Phase-specific state.
    pub state: PhaseRetransmission,
}

/// Phase payload of a retransmission, tagged like live packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PhaseRetransmission {
    /// Waiting room.
    Waiting {
        /// Session capacity.
        #[serde(rename = "maxPlayers")]
        max_players: usize,
    },

    /// Countdown before the question loop.
    TimerBeforeBegin {
        /// Countdown anchor, epoch milliseconds.
        begin: i64,
        /// Countdown length, seconds.
        duration: u64,
    },

    /// Mid question/result loop.
    Question {
        /// Question history, oldest first.
        questions: Vec<QuestionSummary>,
        /// Current-question answers; other players' live answers are
        /// redacted with [`HIDDEN_ANSWER`] until results are showing.
        #[serde(rename = "playerAnswers")]
        player_answers: Vec<(PlayerId, i32)>,
        /// Current health per participant.
        #[serde(rename = "playerLifes")]
        player_lifes: Vec<(PlayerId, u8)>,
        /// Answer-window anchor, epoch milliseconds.
        #[serde(rename = "questionBegin")]
        question_begin: i64,
        /// Answer-window length, seconds.
        #[serde(rename = "questionDuration")]
        question_duration: u64,
        /// Result-window anchor when results are showing.
        #[serde(rename = "resultBegin")]
        result_begin: Option<i64>,
        /// Result-window length when results are showing.
        #[serde(rename = "resultDuration")]
        result_duration: Option<u64>,
        /// Winning answers of the round when results are showing.
        #[serde(rename = "winningAnswers")]
        winning_answers: Option<Vec<u32>>,
    },

    /// Post-game results window.
    Results {
        /// Ids of the surviving players.
        winners: Vec<PlayerId>,
    },
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientPacket {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerPacket {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
