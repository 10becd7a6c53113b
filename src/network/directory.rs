//! Session Directory
//!
//! Owns every in-progress game session, matches joining players to the
//! first waiting session with spare capacity (or creates one), drives the
//! sessions' phase timers, and retires finished sessions. The directory map
//! is the one piece of state shared across sessions; scan-and-assign happens
//! as a single atomic operation under its lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::game::player::PlayerIdentity;
use crate::game::question::QuestionCorpus;
use crate::game::session::{GameId, GameSession, SessionConfig, TimerArm, TimerFollowUp};
use crate::network::protocol::PlayerSummary;

/// Read-only view of one session, for the administrative boundary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: GameId,
    /// Wire name of the current phase.
    pub phase: &'static str,
    /// Roster in join order.
    pub players: Vec<PlayerSummary>,
    /// Configured capacity.
    pub capacity: usize,
    /// Questions asked so far, when the question loop is running.
    pub questions_asked: Option<usize>,
}

/// The set of in-progress sessions and the matchmaker over them.
pub struct SessionDirectory {
    sessions: Mutex<BTreeMap<GameId, Arc<RwLock<GameSession>>>>,
    next_game_id: AtomicU64,
    /// Capacity used for sessions created from now on; never touches
    /// sessions that already exist.
    default_capacity: AtomicUsize,
    base_config: SessionConfig,
    corpus: Arc<QuestionCorpus>,
}

impl SessionDirectory {
    /// Create an empty directory. `base_config` supplies the timer durations
    /// and the initial default capacity for new sessions.
    pub fn new(base_config: SessionConfig, corpus: Arc<QuestionCorpus>) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_game_id: AtomicU64::new(1),
            default_capacity: AtomicUsize::new(base_config.capacity),
            base_config,
            corpus,
        }
    }

    /// Match a player into a session.
    ///
    /// A membership in a waiting session is detached first (join there again
    /// and you get the same seat back); a membership in an active game
    /// rejects the join with a warning. Sessions are scanned in creation
    /// order and the first waiting one with room wins; if none exists a new
    /// session is created with the current default capacity.
    pub async fn join(self: &Arc<Self>, player: &Arc<PlayerIdentity>) {
        if let Some(current) = player.session() {
            match self.get(current).await {
                Some(session) => {
                    let mut guard = session.write().await;
                    if !guard.is_waiting() {
                        warn!(
                            player = %player.id,
                            game = %current,
                            phase = guard.phase_name(),
                            "join rejected, player is in an active game"
                        );
                        return;
                    }
                    if let Err(e) = guard.leave(player) {
                        error!(
                            player = %player.id,
                            game = %current,
                            error = %e,
                            "could not detach player from waiting game"
                        );
                    }
                }
                None => {
                    error!(
                        player = %player.id,
                        game = %current,
                        "player references a game missing from the directory"
                    );
                    player.clear_session_if(current);
                }
            }
        }

        let mut sessions = self.sessions.lock().await;

        let mut target = None;
        for session in sessions.values() {
            let guard = session.read().await;
            if guard.is_waiting() && guard.player_count() < guard.capacity() {
                target = Some(Arc::clone(session));
                break;
            }
        }

        let session = match target {
            Some(session) => session,
            None => {
                let id = GameId(self.next_game_id.fetch_add(1, Ordering::Relaxed));
                let config = SessionConfig {
                    capacity: self.default_capacity.load(Ordering::Relaxed),
                    ..self.base_config.clone()
                };
                let session =
                    Arc::new(RwLock::new(GameSession::new(id, config, Arc::clone(&self.corpus))));
                sessions.insert(id, Arc::clone(&session));
                info!(game = %id, "new game created");
                session
            }
        };

        let armed = {
            let mut guard = session.write().await;
            match guard.join(player) {
                Ok(false) => None,
                Ok(true) => match guard.begin_prestart() {
                    Ok(arm) => Some(arm),
                    Err(e) => {
                        error!(game = %guard.id, error = %e, "could not start full game");
                        None
                    }
                },
                Err(e) => {
                    warn!(player = %player.id, game = %guard.id, error = %e, "join rejected");
                    None
                }
            }
        };

        drop(sessions);

        if let Some(arm) = armed {
            self.arm_timer(&session, arm);
        }
    }

    /// Schedule a session's phase timer.
    ///
    /// The task sleeps, re-locks the session and only acts when the epoch it
    /// was armed with is still current; anything newer means the phase moved
    /// on and this timer is stale.
    pub(crate) fn arm_timer(self: &Arc<Self>, session: &Arc<RwLock<GameSession>>, arm: TimerArm) {
        let directory = Arc::clone(self);
        let session = Arc::clone(session);

        tokio::spawn(async move {
            tokio::time::sleep(arm.delay).await;

            let (id, follow_up) = {
                let mut guard = session.write().await;
                if guard.epoch() != arm.epoch {
                    debug!(game = %guard.id, "stale phase timer ignored");
                    return;
                }
                (guard.id, guard.on_timer_elapsed())
            };

            match follow_up {
                TimerFollowUp::Arm(next) => directory.arm_timer(&session, next),
                TimerFollowUp::Retire => directory.retire(id).await,
                TimerFollowUp::None => {}
            }
        });
    }

    /// Look up a session by id.
    pub async fn get(&self, id: GameId) -> Option<Arc<RwLock<GameSession>>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    /// Remove a finished session. Retiring twice is an inconsistency that is
    /// logged but harmless.
    pub async fn retire(&self, id: GameId) {
        if self.sessions.lock().await.remove(&id).is_none() {
            error!(game = %id, "retire called for a game not in the directory");
        } else {
            info!(game = %id, "game retired");
        }
    }

    /// Cut a session's results window short, detaching its players and
    /// retiring it.
    pub async fn force_finish(&self, id: GameId) {
        let Some(session) = self.get(id).await else {
            warn!(game = %id, "force_finish for unknown game");
            return;
        };

        let follow_up = session.write().await.finish_now();
        if matches!(follow_up, TimerFollowUp::Retire) {
            self.retire(id).await;
        }
    }

    /// Number of in-progress sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Capacity applied to sessions created from now on.
    pub fn default_capacity(&self) -> usize {
        self.default_capacity.load(Ordering::Relaxed)
    }

    /// Update the capacity for future sessions. Existing sessions keep the
    /// capacity they were created with.
    pub fn set_default_capacity(&self, capacity: usize) {
        if capacity == 0 {
            warn!("ignoring request to set default capacity to 0");
            return;
        }
        self.default_capacity.store(capacity, Ordering::Relaxed);
        info!(capacity, "default capacity updated");
    }

    /// Read-only snapshots of every session, for the administrative
    /// boundary.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        let mut snapshots = Vec::with_capacity(sessions.len());

        for session in sessions.values() {
            let guard = session.read().await;
            snapshots.push(SessionSnapshot {
                id: guard.id,
                phase: guard.phase_name(),
                players: guard.players().iter().map(|p| p.summary()).collect(),
                capacity: guard.capacity(),
                questions_asked: guard.questions_asked(),
            });
        }

        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::{Connection, PlayerId};
    use crate::game::question::CorpusEntry;
    use crate::game::session::GamePhase;
    use crate::network::protocol::ServerPacket;
    use std::time::Duration;
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

    fn directory_with_capacity(capacity: usize) -> Arc<SessionDirectory> {
        let config = SessionConfig { capacity, ..SessionConfig::default() };
        Arc::new(SessionDirectory::new(config, corpus()))
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

    #[tokio::test]
    async fn join_creates_a_session_and_assigns_the_player() {
        let directory = directory_with_capacity(3);
        let (player, _rx) = test_player(1);

        directory.join(&player).await;

        assert_eq!(directory.session_count().await, 1);
        assert!(player.session().is_some());
    }

    #[tokio::test]
    async fn joins_fill_the_first_waiting_session() {
        let directory = directory_with_capacity(3);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);

        directory.join(&a).await;
        directory.join(&b).await;

        assert_eq!(directory.session_count().await, 1);
        assert_eq!(a.session(), b.session());
    }

    #[tokio::test]
    async fn full_session_starts_and_next_join_opens_a_new_one() {
        let directory = directory_with_capacity(2);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);
        let (c, _rx_c) = test_player(3);

        directory.join(&a).await;
        directory.join(&b).await;

        let first = directory.get(a.session().unwrap()).await.unwrap();
        assert!(matches!(first.read().await.phase(), GamePhase::PreStart { .. }));

        directory.join(&c).await;
        assert_eq!(directory.session_count().await, 2);
        assert_ne!(a.session(), c.session());
    }

    #[tokio::test]
    async fn join_while_in_an_active_game_is_rejected() {
        let directory = directory_with_capacity(2);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);

        directory.join(&a).await;
        directory.join(&b).await; // session full, countdown running

        let before = a.session();
        directory.join(&a).await;

        assert_eq!(a.session(), before);
        assert_eq!(directory.session_count().await, 1);
    }

    #[tokio::test]
    async fn rejoin_from_a_waiting_session_keeps_one_membership() {
        let directory = directory_with_capacity(3);
        let (a, _rx_a) = test_player(1);

        directory.join(&a).await;
        directory.join(&a).await;

        assert_eq!(directory.session_count().await, 1);
        let session = directory.get(a.session().unwrap()).await.unwrap();
        assert_eq!(session.read().await.player_count(), 1);
    }

    #[tokio::test]
    async fn retire_is_idempotent() {
        let directory = directory_with_capacity(3);
        let (a, _rx_a) = test_player(1);
        directory.join(&a).await;
        let id = a.session().unwrap();

        directory.retire(id).await;
        assert_eq!(directory.session_count().await, 0);

        // Second retirement logs an inconsistency but must not fail.
        directory.retire(id).await;
    }

    #[tokio::test]
    async fn default_capacity_only_affects_future_sessions() {
        let directory = directory_with_capacity(3);
        let (a, _rx_a) = test_player(1);
        directory.join(&a).await;

        directory.set_default_capacity(5);
        let snapshots = directory.snapshot().await;
        assert_eq!(snapshots[0].capacity, 3);

        let (b, _rx_b) = test_player(2);
        let (c, _rx_c) = test_player(3);
        let (d, _rx_d) = test_player(4);
        directory.join(&b).await;
        directory.join(&c).await; // fills the capacity-3 session
        directory.join(&d).await; // lands in a fresh capacity-5 session

        let snapshots = directory.snapshot().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].capacity, 5);
    }

    #[tokio::test]
    async fn zero_default_capacity_is_ignored() {
        let directory = directory_with_capacity(3);
        directory.set_default_capacity(0);
        assert_eq!(directory.default_capacity(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_game_runs_to_retirement() {
        let directory = directory_with_capacity(3);
        let (a, _rx_a) = test_player(1);
        let (b, _rx_b) = test_player(2);
        let (c, mut rx_c) = test_player(3);

        directory.join(&a).await;
        directory.join(&b).await;
        directory.join(&c).await;

        let id = a.session().unwrap();
        let session = directory.get(id).await.unwrap();

        // Countdown elapses, the first question goes live.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(session.read().await.phase_name(), "question");

        // Majority picks 0, the third player sticks to 1 until eliminated.
        for round in 1..=3u8 {
            {
                let mut guard = session.write().await;
                guard.answer(&a, 0).unwrap();
                guard.answer(&b, 0).unwrap();
                if round < 3 {
                    guard.answer(&c, 1).unwrap();
                }
            }
            tokio::time::sleep(Duration::from_secs(16)).await; // answer window
            tokio::time::sleep(Duration::from_secs(11)).await; // result window
        }

        // Two players left alive ends the game.
        assert_eq!(session.read().await.phase_name(), "results");
        let packets: Vec<ServerPacket> = std::iter::from_fn(|| rx_c.try_recv().ok()).collect();
        assert!(packets
            .iter()
            .any(|p| matches!(p, ServerPacket::GameFinish { winners }
                if winners.contains(&a.id) && winners.contains(&b.id) && !winners.contains(&c.id))));

        // Grace window elapses, the session is retired and players detached.
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(directory.session_count().await, 0);
        assert_eq!(a.session(), None);
        assert_eq!(c.session(), None);
    }
}
