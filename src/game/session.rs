//! Game Session
//!
//! The finite-state machine for one round of the game: waiting room,
//! pre-start countdown, question/result loop, and post-game results window.
//! Players answer timed multiple-choice questions and lose health when their
//! answer is not among the majority; the game ends once fewer than three
//! players are left alive.
//!
//! A session lives inside an `Arc<RwLock<GameSession>>` owned by the
//! directory; every mutation and the broadcasts it produces happen under one
//! write guard, so clients observe tallying, health changes and packets as a
//! single atomic step. Phase timers are spawned tasks that re-lock the
//! session and present the epoch they were armed with; a timer whose epoch
//! is no longer current is stale and does nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::game::player::{PlayerId, PlayerIdentity};
use crate::game::question::QuestionCorpus;
use crate::network::protocol::{
    GameRetransmission, PhaseRetransmission, PlayerSummary, QuestionSummary, ServerPacket,
    HIDDEN_ANSWER,
};

/// Health every player starts the question loop with.
pub const STARTING_LIFES: u8 = 3;

/// The question loop keeps going while at least this many players are alive.
pub const MIN_ALIVE_TO_CONTINUE: usize = 3;

/// Session identifier, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GameId(pub u64);

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a game session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum players; reaching it starts the game.
    pub capacity: usize,
    /// Countdown between a full waiting room and the first question.
    pub prestart_duration: Duration,
    /// Answer window per question.
    pub answer_duration: Duration,
    /// Result display window per question.
    pub result_duration: Duration,
    /// How long a finished game lingers before it is retired.
    pub results_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            prestart_duration: Duration::from_secs(10),
            answer_duration: Duration::from_secs(15),
            result_duration: Duration::from_secs(10),
            results_grace: Duration::from_secs(600),
        }
    }
}

/// One asked question and the answers recorded for it.
#[derive(Debug, Clone)]
pub struct QuestionRecord {
    /// Question text.
    pub text: String,
    /// Answer choices; index order is stable for the round.
    pub answers: Vec<String>,
    /// Validated answers per player. Only real indices are stored; the
    /// hidden sentinel exists solely on the wire.
    pub player_answers: BTreeMap<PlayerId, u32>,
}

/// Payload of the question/result loop.
#[derive(Debug, Clone)]
pub struct QuestionPhase {
    /// Question history, oldest first. Never empty while this phase is
    /// active.
    pub questions: Vec<QuestionRecord>,
    /// Remaining health per participant; decrement-only, floor 0.
    pub lifes: BTreeMap<PlayerId, u8>,
    /// Answer-window anchor, epoch milliseconds.
    pub question_begin_ms: i64,
    /// Answer-window length.
    pub question_duration: Duration,
    /// Result-window anchor, set once the answer window closed.
    pub result_begin_ms: Option<i64>,
    /// Result-window length, set together with the anchor.
    pub result_duration: Option<Duration>,
    /// Winning answers of the current question, set with the results.
    pub winning_answers: Option<Vec<u32>>,
}

/// Session phase. Each variant carries only its own state, so accessing a
/// field of the wrong phase is impossible by construction.
#[derive(Debug, Clone)]
pub enum GamePhase {
    /// Collecting players.
    Waiting,
    /// Full roster, counting down to the first question.
    PreStart {
        /// Countdown anchor, epoch milliseconds.
        begin_ms: i64,
        /// Countdown length.
        duration: Duration,
    },
    /// The question/result loop.
    Question(QuestionPhase),
    /// Game over; lingering so latecomers can still see the outcome.
    Results {
        /// Players still alive when the game ended.
        winners: Vec<PlayerId>,
        /// Grace-window anchor, epoch milliseconds.
        begin_ms: i64,
        /// Grace-window length.
        duration: Duration,
    },
}

impl GamePhase {
    /// Wire name of the phase.
    pub fn name(&self) -> &'static str {
        match self {
            GamePhase::Waiting => "waiting",
            GamePhase::PreStart { .. } => "timer-before-begin",
            GamePhase::Question(_) => "question",
            GamePhase::Results { .. } => "results",
        }
    }
}

/// Session errors. All of them are protocol or invariant violations that the
/// caller logs and drops; none of them disturb the session itself.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Session roster is at capacity.
    #[error("session is full")]
    SessionFull,

    /// Player already belongs to a session.
    #[error("player is already in a session")]
    AlreadyInSession,

    /// Player is not part of this session.
    #[error("player is not in this session")]
    PlayerNotFound,

    /// Operation is not valid in the current phase.
    #[error("not allowed in the {0} phase")]
    WrongPhase(&'static str),

    /// Player already answered the live question.
    #[error("player already answered this question")]
    AlreadyAnswered,

    /// Answer index outside the choice range.
    #[error("answer index {0} is out of range")]
    AnswerOutOfRange(i32),

    /// Player has no health left.
    #[error("player has no health left")]
    PlayerEliminated,

    /// Question phase without a drawn question.
    #[error("no question is active")]
    NoActiveQuestion,
}

/// A scheduled phase timer: sleep `delay`, then fire with `epoch`.
#[derive(Debug, Clone, Copy)]
pub struct TimerArm {
    /// Wall-clock delay before the timer fires.
    pub delay: Duration,
    /// Epoch the session had when the timer was armed.
    pub epoch: u64,
}

/// What the owner must do after a timer handler ran.
#[derive(Debug, Clone, Copy)]
pub enum TimerFollowUp {
    /// Arm the next phase timer.
    Arm(TimerArm),
    /// The session completed; remove it from the directory.
    Retire,
    /// Nothing to schedule.
    None,
}

/// Tally of one question.
#[derive(Debug, Clone)]
pub struct TallyOutcome {
    /// Vote count per answer index.
    pub counts: Vec<u32>,
    /// Highest vote count (0 when nobody answered).
    pub max_count: u32,
    /// Every answer index whose count equals `max_count`.
    pub winning_answers: Vec<u32>,
}

/// Count recorded answers and derive the winning set. Ties all win; an
/// unanswered question makes every index a winner.
pub fn tally(answer_count: usize, player_answers: &BTreeMap<PlayerId, u32>) -> TallyOutcome {
    let mut counts = vec![0u32; answer_count];
    for &answer in player_answers.values() {
        if let Some(slot) = counts.get_mut(answer as usize) {
            *slot += 1;
        }
    }

    let max_count = counts.iter().copied().max().unwrap_or(0);
    let winning_answers = (0..answer_count as u32)
        .filter(|&a| counts[a as usize] == max_count)
        .collect();

    TallyOutcome { counts, max_count, winning_answers }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One round of the game from waiting room to results.
pub struct GameSession {
    /// Session identifier.
    pub id: GameId,
    config: SessionConfig,
    phase: GamePhase,
    /// Roster in join order. Append-only once the question loop started.
    players: Vec<Arc<PlayerIdentity>>,
    /// Bumped whenever a timer is armed; stale timers compare against it.
    epoch: u64,
    corpus: Arc<QuestionCorpus>,
}

impl GameSession {
    /// Create a session in the waiting phase.
    pub fn new(id: GameId, config: SessionConfig, corpus: Arc<QuestionCorpus>) -> Self {
        Self {
            id,
            config,
            phase: GamePhase::Waiting,
            players: Vec::new(),
            epoch: 0,
            corpus,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &GamePhase {
        &self.phase
    }

    /// Wire name of the current phase.
    pub fn phase_name(&self) -> &'static str {
        self.phase.name()
    }

    /// Whether the session still collects players.
    pub fn is_waiting(&self) -> bool {
        matches!(self.phase, GamePhase::Waiting)
    }

    /// Roster size.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Roster in join order.
    pub fn players(&self) -> &[Arc<PlayerIdentity>] {
        &self.players
    }

    /// Number of questions asked so far, if the question loop is running.
    pub fn questions_asked(&self) -> Option<usize> {
        match &self.phase {
            GamePhase::Question(round) => Some(round.questions.len()),
            _ => None,
        }
    }

    /// Current timer epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn arm(&mut self, delay: Duration) -> TimerArm {
        self.epoch += 1;
        TimerArm { delay, epoch: self.epoch }
    }

    fn broadcast_to(players: &[Arc<PlayerIdentity>], packet: &ServerPacket) {
        for player in players {
            player.send_packet(packet);
        }
    }

    fn broadcast_except(players: &[Arc<PlayerIdentity>], except: PlayerId, packet: &ServerPacket) {
        for player in players.iter().filter(|p| p.id != except) {
            player.send_packet(packet);
        }
    }

    /// Add a player to the waiting room.
    ///
    /// Returns `Ok(true)` when this join filled the session; the caller must
    /// then call [`GameSession::begin_prestart`] under the same guard.
    pub fn join(&mut self, player: &Arc<PlayerIdentity>) -> Result<bool, SessionError> {
        if !self.is_waiting() {
            return Err(SessionError::WrongPhase(self.phase_name()));
        }
        if player.session().is_some() {
            return Err(SessionError::AlreadyInSession);
        }
        if self.players.len() >= self.config.capacity {
            return Err(SessionError::SessionFull);
        }

        Self::broadcast_to(&self.players, &ServerPacket::NewPlayer { player: player.summary() });

        player.set_session(Some(self.id));
        self.players.push(Arc::clone(player));

        info!(game = %self.id, player = %player.id, "player joins game");

        player.send_packet(&ServerPacket::JoinGame {
            players: self.players.iter().map(|p| p.summary()).collect(),
            max_players: self.config.capacity,
        });

        Ok(self.players.len() >= self.config.capacity)
    }

    /// Remove a player.
    ///
    /// In the waiting room this is a true roster removal, announced to
    /// everyone including the leaver. In the results window it only clears
    /// the player's session reference; the roster stays intact for the
    /// result display. Any other phase rejects the operation.
    pub fn leave(&mut self, player: &Arc<PlayerIdentity>) -> Result<(), SessionError> {
        match &self.phase {
            GamePhase::Waiting => {
                let i = self
                    .players
                    .iter()
                    .position(|p| p.id == player.id)
                    .ok_or(SessionError::PlayerNotFound)?;
                let removed = self.players.remove(i);
                removed.clear_session_if(self.id);

                let packet = ServerPacket::RemovePlayer { player_id: removed.id };
                Self::broadcast_to(&self.players, &packet);
                removed.send_packet(&packet);

                info!(game = %self.id, player = %removed.id, "player leaves game");
                Ok(())
            }
            GamePhase::Results { .. } => {
                player.clear_session_if(self.id);
                Ok(())
            }
            _ => Err(SessionError::WrongPhase(self.phase_name())),
        }
    }

    /// Record an answer for the live question.
    ///
    /// The submitter gets the real index echoed back; everyone else is told
    /// the player answered, with the value hidden until results.
    pub fn answer(&mut self, player: &Arc<PlayerIdentity>, answer: i32) -> Result<(), SessionError> {
        let phase_name = self.phase.name();
        let GamePhase::Question(round) = &mut self.phase else {
            return Err(SessionError::WrongPhase(phase_name));
        };

        let player_id = player.id;
        let record = round.questions.last_mut().ok_or(SessionError::NoActiveQuestion)?;

        if record.player_answers.contains_key(&player_id) {
            return Err(SessionError::AlreadyAnswered);
        }
        if answer < 0 || answer as usize >= record.answers.len() {
            return Err(SessionError::AnswerOutOfRange(answer));
        }
        if round.lifes.get(&player_id).copied().unwrap_or(0) == 0 {
            return Err(SessionError::PlayerEliminated);
        }

        record.player_answers.insert(player_id, answer as u32);
        let question = round.questions.len();

        info!(game = %self.id, player = %player_id, answer, question, "player answer");

        player.send_packet(&ServerPacket::PlayerAnswer { player_id, answer });
        Self::broadcast_except(
            &self.players,
            player_id,
            &ServerPacket::PlayerAnswer { player_id, answer: HIDDEN_ANSWER },
        );

        Ok(())
    }

    /// Leave the waiting room for the pre-start countdown.
    pub fn begin_prestart(&mut self) -> Result<TimerArm, SessionError> {
        if !self.is_waiting() {
            return Err(SessionError::WrongPhase(self.phase_name()));
        }

        let begin_ms = now_ms();
        let duration = self.config.prestart_duration;
        self.phase = GamePhase::PreStart { begin_ms, duration };

        Self::broadcast_to(
            &self.players,
            &ServerPacket::TimerBeforeBegin { begin: begin_ms, duration: duration.as_secs() },
        );

        info!(game = %self.id, seconds = duration.as_secs(), "countdown before begin started");

        Ok(self.arm(duration))
    }

    /// Handle the currently armed phase timer.
    ///
    /// The caller has already verified the timer's epoch is still current.
    pub fn on_timer_elapsed(&mut self) -> TimerFollowUp {
        enum Step {
            BeginQuestions,
            FinishQuestion,
            AdvanceRound,
            FinishGame,
            Unexpected,
        }

        let step = match &self.phase {
            GamePhase::Waiting => Step::Unexpected,
            GamePhase::PreStart { .. } => Step::BeginQuestions,
            GamePhase::Question(round) if round.result_begin_ms.is_none() => Step::FinishQuestion,
            GamePhase::Question(_) => Step::AdvanceRound,
            GamePhase::Results { .. } => Step::FinishGame,
        };

        match step {
            Step::BeginQuestions => self.begin_questions(),
            Step::FinishQuestion => self.finish_question(),
            Step::AdvanceRound => self.advance_round(),
            Step::FinishGame => self.finish_game(),
            Step::Unexpected => {
                error!(game = %self.id, phase = self.phase_name(), "phase timer fired in unexpected phase");
                TimerFollowUp::None
            }
        }
    }

    /// End the results window early, detaching everyone and asking the owner
    /// to retire the session.
    pub fn finish_now(&mut self) -> TimerFollowUp {
        if !matches!(self.phase, GamePhase::Results { .. }) {
            error!(game = %self.id, phase = self.phase_name(), "finish_now called in wrong phase");
            return TimerFollowUp::None;
        }

        // Supersede the grace timer.
        self.epoch += 1;
        self.finish_game()
    }

    /// Countdown elapsed: hand out health and start the first question.
    fn begin_questions(&mut self) -> TimerFollowUp {
        let lifes: BTreeMap<PlayerId, u8> =
            self.players.iter().map(|p| (p.id, STARTING_LIFES)).collect();
        let player_lifes: Vec<(PlayerId, u8)> = lifes.iter().map(|(&p, &l)| (p, l)).collect();

        self.phase = GamePhase::Question(QuestionPhase {
            questions: Vec::new(),
            lifes,
            question_begin_ms: 0,
            question_duration: self.config.answer_duration,
            result_begin_ms: None,
            result_duration: None,
            winning_answers: None,
        });

        Self::broadcast_to(&self.players, &ServerPacket::GameBegin { player_lifes });
        info!(game = %self.id, "game started");

        self.start_question()
    }

    /// Draw and announce a fresh question, arming the answer window.
    fn start_question(&mut self) -> TimerFollowUp {
        let drawn = self.corpus.draw();
        let begin_ms = now_ms();
        let duration = self.config.answer_duration;

        let phase_name = self.phase.name();
        let GamePhase::Question(round) = &mut self.phase else {
            error!(game = %self.id, phase = phase_name, "start_question called in wrong phase");
            return TimerFollowUp::None;
        };

        round.question_begin_ms = begin_ms;
        round.question_duration = duration;
        round.result_begin_ms = None;
        round.result_duration = None;
        round.winning_answers = None;

        let summary = QuestionSummary { text: drawn.text.clone(), answers: drawn.answers.clone() };
        round.questions.push(QuestionRecord {
            text: drawn.text,
            answers: drawn.answers,
            player_answers: BTreeMap::new(),
        });
        let question = round.questions.len();

        Self::broadcast_to(
            &self.players,
            &ServerPacket::NewQuestion {
                question: summary,
                begin_timestamp: begin_ms,
                duration: duration.as_secs(),
            },
        );

        info!(game = %self.id, question, "question start");

        TimerFollowUp::Arm(self.arm(duration))
    }

    /// Answer window elapsed: tally, damage the losers, show results.
    fn finish_question(&mut self) -> TimerFollowUp {
        let result_duration = self.config.result_duration;

        let phase_name = self.phase.name();
        let GamePhase::Question(round) = &mut self.phase else {
            error!(game = %self.id, phase = phase_name, "finish_question called in wrong phase");
            return TimerFollowUp::None;
        };
        let Some(record) = round.questions.last() else {
            error!(game = %self.id, "question phase without an active question");
            return TimerFollowUp::None;
        };

        let outcome = tally(record.answers.len(), &record.player_answers);

        // Every living player outside the winning set loses one health.
        // An entirely unanswered question makes every index a winner and
        // damages no one.
        let damaged: Vec<PlayerId> = if outcome.max_count == 0 {
            Vec::new()
        } else {
            round
                .lifes
                .iter()
                .filter(|(_, &life)| life > 0)
                .map(|(&id, _)| id)
                .filter(|id| match record.player_answers.get(id) {
                    Some(answer) => !outcome.winning_answers.contains(answer),
                    None => true,
                })
                .collect()
        };

        let player_answers: Vec<(PlayerId, i32)> =
            record.player_answers.iter().map(|(&p, &a)| (p, a as i32)).collect();

        for id in &damaged {
            if let Some(life) = round.lifes.get_mut(id) {
                *life = life.saturating_sub(1);
            }
        }

        let begin_ms = now_ms();
        round.result_begin_ms = Some(begin_ms);
        round.result_duration = Some(result_duration);
        round.winning_answers = Some(outcome.winning_answers.clone());

        let players_damaged: Vec<(PlayerId, u8)> = damaged
            .iter()
            .filter_map(|id| round.lifes.get(id).map(|&life| (*id, life)))
            .collect();

        info!(
            game = %self.id,
            question = round.questions.len(),
            winning_answers = ?outcome.winning_answers,
            damaged = ?damaged,
            "question finish"
        );

        Self::broadcast_to(
            &self.players,
            &ServerPacket::QuestionResults {
                player_answers,
                players_damaged,
                result_begin_timestamp: begin_ms,
                result_duration: result_duration.as_secs(),
                winning_answers: outcome.winning_answers,
            },
        );

        TimerFollowUp::Arm(self.arm(result_duration))
    }

    /// Result window elapsed: either the game is over or the next question
    /// starts.
    fn advance_round(&mut self) -> TimerFollowUp {
        let alive: Vec<PlayerId> = match &self.phase {
            GamePhase::Question(round) => round
                .lifes
                .iter()
                .filter(|(_, &life)| life > 0)
                .map(|(&id, _)| id)
                .collect(),
            _ => {
                error!(game = %self.id, phase = self.phase_name(), "advance_round called in wrong phase");
                return TimerFollowUp::None;
            }
        };

        if alive.len() < MIN_ALIVE_TO_CONTINUE {
            let begin_ms = now_ms();
            let duration = self.config.results_grace;
            self.phase = GamePhase::Results { winners: alive.clone(), begin_ms, duration };

            info!(game = %self.id, winners = ?alive, "game over");

            Self::broadcast_to(&self.players, &ServerPacket::GameFinish { winners: alive });
            return TimerFollowUp::Arm(self.arm(duration));
        }

        self.start_question()
    }

    /// Grace window elapsed (or forced): detach everyone still attached and
    /// let the directory retire the session.
    fn finish_game(&mut self) -> TimerFollowUp {
        for player in &self.players {
            player.clear_session_if(self.id);
        }

        info!(game = %self.id, "game finish");
        TimerFollowUp::Retire
    }

    /// Full session snapshot for a reconnecting client. Other players' live
    /// answers are redacted exactly like the live broadcast until results
    /// are showing.
    pub fn retransmission(&self, viewer: PlayerId) -> GameRetransmission {
        let players: Vec<PlayerSummary> = self.players.iter().map(|p| p.summary()).collect();

        let state = match &self.phase {
            GamePhase::Waiting => PhaseRetransmission::Waiting { max_players: self.config.capacity },
            GamePhase::PreStart { begin_ms, duration } => PhaseRetransmission::TimerBeforeBegin {
                begin: *begin_ms,
                duration: duration.as_secs(),
            },
            GamePhase::Question(round) => {
                let results_showing = round.result_begin_ms.is_some();
                let player_answers: Vec<(PlayerId, i32)> = round
                    .questions
                    .last()
                    .map(|record| {
                        record
                            .player_answers
                            .iter()
                            .map(|(&id, &answer)| {
                                if results_showing || id == viewer {
                                    (id, answer as i32)
                                } else {
                                    (id, HIDDEN_ANSWER)
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                PhaseRetransmission::Question {
                    questions: round
                        .questions
                        .iter()
                        .map(|q| QuestionSummary { text: q.text.clone(), answers: q.answers.clone() })
                        .collect(),
                    player_answers,
                    player_lifes: round.lifes.iter().map(|(&p, &l)| (p, l)).collect(),
                    question_begin: round.question_begin_ms,
                    question_duration: round.question_duration.as_secs(),
                    result_begin: round.result_begin_ms,
                    result_duration: round.result_duration.map(|d| d.as_secs()),
                    winning_answers: round.winning_answers.clone(),
                }
            }
            GamePhase::Results { winners, .. } => {
                PhaseRetransmission::Results { winners: winners.clone() }
            }
        };

        GameRetransmission { players, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::Connection;
    use crate::game::question::CorpusEntry;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn corpus() -> Arc<QuestionCorpus> {
        Arc::new(
            QuestionCorpus::from_parts(
                vec![CorpusEntry { question: "Best cheese?".into(), real_answer: "comte".into() }],
                vec!["comte".into(), "brie".into(), "roquefort".into()],
            )
            .unwrap(),
        )
    }

    fn test_player(id: u32) -> (Arc<PlayerIdentity>, mpsc::UnboundedReceiver<ServerPacket>) {
        let player = Arc::new(PlayerIdentity::new(
            PlayerId(id),
            format!("player-{id}"),
            format!("token-{id}"),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        player.attach_connection(Connection::new(tx));
        (player, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerPacket>) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }
        packets
    }

    fn session_with_capacity(capacity: usize) -> GameSession {
        let config = SessionConfig { capacity, ..SessionConfig::default() };
        GameSession::new(GameId(1), config, corpus())
    }

    /// Three players, advanced into the first question.
    #[allow(clippy::type_complexity)]
    fn question_session() -> (
        GameSession,
        Vec<Arc<PlayerIdentity>>,
        Vec<mpsc::UnboundedReceiver<ServerPacket>>,
    ) {
        let mut session = session_with_capacity(3);
        let mut players = Vec::new();
        let mut receivers = Vec::new();

        for id in 1..=3 {
            let (player, rx) = test_player(id);
            session.join(&player).unwrap();
            players.push(player);
            receivers.push(rx);
        }

        session.begin_prestart().unwrap();
        session.on_timer_elapsed(); // countdown elapsed, first question live
        (session, players, receivers)
    }

    fn lifes_of(session: &GameSession) -> BTreeMap<PlayerId, u8> {
        match session.phase() {
            GamePhase::Question(round) => round.lifes.clone(),
            other => panic!("not in question phase: {}", other.name()),
        }
    }

    fn set_life(session: &mut GameSession, player: PlayerId, life: u8) {
        match &mut session.phase {
            GamePhase::Question(round) => {
                round.lifes.insert(player, life);
            }
            other => panic!("not in question phase: {}", other.name()),
        }
    }

    #[test]
    fn reaching_capacity_reports_exactly_one_start() {
        let mut session = session_with_capacity(3);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);
        let (c, _rx_c) = test_player(3);

        assert!(!session.join(&a).unwrap());
        assert!(!session.join(&b).unwrap());
        assert!(session.join(&c).unwrap());
        assert_eq!(session.player_count(), 3);
    }

    #[test]
    fn join_rejected_when_full() {
        let mut session = session_with_capacity(2);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);
        let (c, _rx_c) = test_player(3);

        session.join(&a).unwrap();
        session.join(&b).unwrap();

        let result = session.join(&c);
        assert!(matches!(result, Err(SessionError::SessionFull)));
        assert_eq!(session.player_count(), 2);
    }

    #[test]
    fn join_rejected_outside_waiting() {
        let (mut session, _players, _receivers) = question_session();
        let (late, _rx) = test_player(9);

        let result = session.join(&late);
        assert!(matches!(result, Err(SessionError::WrongPhase("question"))));
    }

    #[test]
    fn waiting_leave_removes_player_and_notifies_everyone() {
        let mut session = session_with_capacity(3);
        let (a, mut rx_a) = test_player(1);
        let (b, mut rx_b) = test_player(2);
        session.join(&a).unwrap();
        session.join(&b).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        session.leave(&a).unwrap();

        assert_eq!(session.player_count(), 1);
        assert_eq!(a.session(), None);
        assert!(drain(&mut rx_a)
            .iter()
            .any(|p| matches!(p, ServerPacket::RemovePlayer { player_id } if *player_id == a.id)));
        assert!(drain(&mut rx_b)
            .iter()
            .any(|p| matches!(p, ServerPacket::RemovePlayer { player_id } if *player_id == a.id)));
    }

    #[test]
    fn leave_rejected_mid_question() {
        let (mut session, players, _receivers) = question_session();

        let result = session.leave(&players[0]);
        assert!(matches!(result, Err(SessionError::WrongPhase("question"))));
        assert_eq!(session.player_count(), 3);
    }

    #[test]
    fn countdown_then_question_with_three_lifes_each() {
        let mut session = session_with_capacity(3);
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (player, rx) = test_player(id);
            session.join(&player).unwrap();
            receivers.push(rx);
        }

        let arm = session.begin_prestart().unwrap();
        assert_eq!(arm.delay, session.config.prestart_duration);
        assert!(matches!(session.phase(), GamePhase::PreStart { .. }));

        let follow_up = session.on_timer_elapsed();
        assert!(matches!(follow_up, TimerFollowUp::Arm(_)));
        assert_eq!(
            lifes_of(&session),
            BTreeMap::from([(PlayerId(1), 3), (PlayerId(2), 3), (PlayerId(3), 3)])
        );

        // Every player saw countdown, game begin and the first question.
        for rx in receivers.iter_mut() {
            let packets = drain(rx);
            assert!(packets.iter().any(|p| matches!(p, ServerPacket::TimerBeforeBegin { .. })));
            assert!(packets
                .iter()
                .any(|p| matches!(p, ServerPacket::GameBegin { player_lifes } if player_lifes.len() == 3)));
            assert!(packets.iter().any(|p| matches!(p, ServerPacket::NewQuestion { .. })));
        }
    }

    #[test]
    fn answer_echoes_real_value_and_hides_it_from_others() {
        let (mut session, players, mut receivers) = question_session();
        for rx in receivers.iter_mut() {
            drain(rx);
        }

        session.answer(&players[0], 1).unwrap();

        let to_submitter = drain(&mut receivers[0]);
        assert!(to_submitter
            .iter()
            .any(|p| matches!(p, ServerPacket::PlayerAnswer { player_id, answer }
                if *player_id == players[0].id && *answer == 1)));

        for rx in receivers[1..].iter_mut() {
            let packets = drain(rx);
            assert!(packets
                .iter()
                .any(|p| matches!(p, ServerPacket::PlayerAnswer { player_id, answer }
                    if *player_id == players[0].id && *answer == HIDDEN_ANSWER)));
        }
    }

    #[test]
    fn duplicate_answer_rejected() {
        let (mut session, players, _receivers) = question_session();

        session.answer(&players[0], 0).unwrap();
        let result = session.answer(&players[0], 1);
        assert!(matches!(result, Err(SessionError::AlreadyAnswered)));
    }

    #[test]
    fn out_of_range_answer_rejected() {
        let (mut session, players, _receivers) = question_session();

        assert!(matches!(
            session.answer(&players[0], 3),
            Err(SessionError::AnswerOutOfRange(3))
        ));
        assert!(matches!(
            session.answer(&players[0], -1),
            Err(SessionError::AnswerOutOfRange(-1))
        ));
    }

    #[test]
    fn eliminated_player_cannot_answer() {
        let (mut session, players, _receivers) = question_session();
        set_life(&mut session, players[2].id, 0);

        let result = session.answer(&players[2], 0);
        assert!(matches!(result, Err(SessionError::PlayerEliminated)));
    }

    #[test]
    fn majority_damages_the_minority() {
        let (mut session, players, mut receivers) = question_session();
        session.answer(&players[0], 0).unwrap();
        session.answer(&players[1], 0).unwrap();
        session.answer(&players[2], 1).unwrap();
        for rx in receivers.iter_mut() {
            drain(rx);
        }

        session.on_timer_elapsed(); // answer window closes

        let lifes = lifes_of(&session);
        assert_eq!(lifes[&players[0].id], 3);
        assert_eq!(lifes[&players[1].id], 3);
        assert_eq!(lifes[&players[2].id], 2);

        let packets = drain(&mut receivers[0]);
        let results = packets
            .iter()
            .find_map(|p| match p {
                ServerPacket::QuestionResults { winning_answers, players_damaged, player_answers, .. } => {
                    Some((winning_answers.clone(), players_damaged.clone(), player_answers.clone()))
                }
                _ => None,
            })
            .expect("question results broadcast");

        assert_eq!(results.0, vec![0]);
        assert_eq!(results.1, vec![(players[2].id, 2)]);
        // Results are unredacted for everyone.
        assert!(results.2.contains(&(players[2].id, 1)));
    }

    #[test]
    fn tie_spares_every_top_voter() {
        let (mut session, players, _receivers) = question_session();
        session.answer(&players[0], 0).unwrap();
        session.answer(&players[1], 1).unwrap();
        // players[2] stays silent

        session.on_timer_elapsed();

        let lifes = lifes_of(&session);
        assert_eq!(lifes[&players[0].id], 3);
        assert_eq!(lifes[&players[1].id], 3);
        assert_eq!(lifes[&players[2].id], 2);

        match session.phase() {
            GamePhase::Question(round) => {
                assert_eq!(round.winning_answers.as_deref(), Some(&[0, 1][..]));
            }
            other => panic!("not in question phase: {}", other.name()),
        }
    }

    #[test]
    fn unanswered_question_damages_nobody() {
        let (mut session, players, _receivers) = question_session();

        session.on_timer_elapsed();

        let lifes = lifes_of(&session);
        for player in &players {
            assert_eq!(lifes[&player.id], 3);
        }
        match session.phase() {
            GamePhase::Question(round) => {
                assert_eq!(round.winning_answers.as_deref(), Some(&[0, 1, 2][..]));
            }
            other => panic!("not in question phase: {}", other.name()),
        }
    }

    #[test]
    fn health_never_drops_below_zero() {
        let (mut session, players, _receivers) = question_session();
        set_life(&mut session, players[2].id, 0);
        session.answer(&players[0], 0).unwrap();

        session.on_timer_elapsed();

        // Dead player is outside the damage set and stays at the floor.
        assert_eq!(lifes_of(&session)[&players[2].id], 0);
    }

    #[test]
    fn game_continues_while_three_players_live() {
        let (mut session, _players, _receivers) = question_session();
        session.on_timer_elapsed(); // close unanswered question
        let follow_up = session.on_timer_elapsed(); // result window elapses

        assert!(matches!(follow_up, TimerFollowUp::Arm(_)));
        assert_eq!(session.questions_asked(), Some(2));
    }

    #[test]
    fn game_ends_when_fewer_than_three_live() {
        let (mut session, players, mut receivers) = question_session();
        set_life(&mut session, players[1].id, 1);
        set_life(&mut session, players[2].id, 1);
        session.answer(&players[0], 0).unwrap();
        session.on_timer_elapsed(); // B and C each drop to 0
        for rx in receivers.iter_mut() {
            drain(rx);
        }

        let follow_up = session.on_timer_elapsed(); // result window elapses

        assert!(matches!(follow_up, TimerFollowUp::Arm(_)));
        match session.phase() {
            GamePhase::Results { winners, .. } => assert_eq!(winners, &vec![players[0].id]),
            other => panic!("expected results phase, got {}", other.name()),
        }
        assert!(drain(&mut receivers[1])
            .iter()
            .any(|p| matches!(p, ServerPacket::GameFinish { winners } if winners == &vec![players[0].id])));

        // Grace window elapses: everyone detached, session retires.
        let follow_up = session.on_timer_elapsed();
        assert!(matches!(follow_up, TimerFollowUp::Retire));
        for player in &players {
            assert_eq!(player.session(), None);
        }
    }

    #[test]
    fn results_leave_detaches_without_touching_roster() {
        let (mut session, players, _receivers) = question_session();
        set_life(&mut session, players[1].id, 0);
        set_life(&mut session, players[2].id, 0);
        session.on_timer_elapsed(); // close question
        session.on_timer_elapsed(); // into results

        session.leave(&players[1]).unwrap();

        assert_eq!(session.player_count(), 3);
        assert_eq!(players[1].session(), None);
    }

    #[test]
    fn second_device_sees_the_same_broadcasts_and_roster_survives_its_loss() {
        let (mut session, players, mut receivers) = question_session();

        // Same identity, second device.
        let (tx, mut second_rx) = mpsc::unbounded_channel();
        let second = Connection::new(tx);
        let second_id = second.id;
        players[0].attach_connection(second);
        drain(&mut receivers[0]);

        session.answer(&players[1], 1).unwrap();

        let first_packets = drain(&mut receivers[0]);
        let second_packets = drain(&mut second_rx);
        assert_eq!(first_packets.len(), second_packets.len());
        assert!(second_packets
            .iter()
            .any(|p| matches!(p, ServerPacket::PlayerAnswer { player_id, answer }
                if *player_id == players[1].id && *answer == HIDDEN_ANSWER)));

        // Losing one device must not touch the roster.
        players[0].detach_connection(second_id);
        assert_eq!(session.player_count(), 3);
        assert!(players[0].is_online());
    }

    #[test]
    fn each_armed_timer_gets_a_fresh_epoch() {
        let mut session = session_with_capacity(2);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);
        session.join(&a).unwrap();
        session.join(&b).unwrap();

        let first = session.begin_prestart().unwrap();
        assert_eq!(session.epoch(), first.epoch);

        let TimerFollowUp::Arm(second) = session.on_timer_elapsed() else {
            panic!("expected a follow-up timer");
        };
        assert_ne!(first.epoch, second.epoch);
        assert_eq!(session.epoch(), second.epoch);
    }

    #[test]
    fn retransmission_redacts_live_answers_of_others() {
        let (mut session, players, _receivers) = question_session();
        session.answer(&players[0], 0).unwrap();
        session.answer(&players[1], 2).unwrap();

        let snapshot = session.retransmission(players[0].id);
        match snapshot.state {
            PhaseRetransmission::Question { player_answers, result_begin, .. } => {
                assert_eq!(result_begin, None);
                assert!(player_answers.contains(&(players[0].id, 0)));
                assert!(player_answers.contains(&(players[1].id, HIDDEN_ANSWER)));
            }
            other => panic!("expected question state, got {:?}", other),
        }
    }

    #[test]
    fn retransmission_reveals_answers_once_results_show() {
        let (mut session, players, _receivers) = question_session();
        session.answer(&players[0], 0).unwrap();
        session.answer(&players[1], 2).unwrap();
        session.on_timer_elapsed(); // results showing

        let snapshot = session.retransmission(players[0].id);
        match snapshot.state {
            PhaseRetransmission::Question { player_answers, result_begin, winning_answers, .. } => {
                assert!(result_begin.is_some());
                assert!(winning_answers.is_some());
                assert!(player_answers.contains(&(players[1].id, 2)));
            }
            other => panic!("expected question state, got {:?}", other),
        }
    }

    #[test]
    fn finish_now_supersedes_grace_timer() {
        let (mut session, players, _receivers) = question_session();
        set_life(&mut session, players[1].id, 0);
        set_life(&mut session, players[2].id, 0);
        session.on_timer_elapsed(); // close question
        let TimerFollowUp::Arm(grace) = session.on_timer_elapsed() else {
            panic!("expected grace timer");
        };

        let follow_up = session.finish_now();
        assert!(matches!(follow_up, TimerFollowUp::Retire));
        assert_ne!(session.epoch(), grace.epoch);
    }

    // ==========================================================================
    // TALLY PROPERTIES
    // ==========================================================================

    proptest! {
        #[test]
        fn winning_answers_are_exactly_the_argmax_set(
            answer_count in 1usize..8,
            votes in proptest::collection::vec(0u32..8, 0..24),
        ) {
            let player_answers: BTreeMap<PlayerId, u32> = votes
                .iter()
                .enumerate()
                .filter(|(_, &v)| (v as usize) < answer_count)
                .map(|(i, &v)| (PlayerId(i as u32), v))
                .collect();

            let outcome = tally(answer_count, &player_answers);

            for index in 0..answer_count as u32 {
                let count = outcome.counts[index as usize];
                prop_assert!(count <= outcome.max_count);
                prop_assert_eq!(
                    outcome.winning_answers.contains(&index),
                    count == outcome.max_count
                );
            }
        }

        #[test]
        fn unanswered_tally_makes_every_index_win(answer_count in 1usize..8) {
            let outcome = tally(answer_count, &BTreeMap::new());

            prop_assert_eq!(outcome.max_count, 0);
            prop_assert_eq!(
                outcome.winning_answers,
                (0..answer_count as u32).collect::<Vec<_>>()
            );
        }
    }
}
