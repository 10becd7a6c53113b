//! WebSocket Connection Router
//!
//! Accepts transport connections, runs the authentication handshake
//! (new vs. returning player) and dispatches inbound packets to the owning
//! session or to matchmaking. The router is the only component that knows
//! about sockets; everything below it works with [`PlayerIdentity`]
//! connection fan-out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::player::{Connection, PlayerId, PlayerIdentity};
use crate::game::question::QuestionCorpus;
use crate::game::session::{GameSession, SessionConfig, SessionError};
use crate::network::directory::{SessionDirectory, SessionSnapshot};
use crate::network::identity::{IdentityStore, PlayerRegistry};
use crate::network::protocol::{ClientPacket, ServerPacket};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Capacity for newly created sessions.
    pub default_capacity: usize,
    /// Path of the question corpus file.
    pub corpus_path: PathBuf,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            default_capacity: 10,
            corpus_path: PathBuf::from("data/questions.json"),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Build a config from environment variables, falling back to defaults
    /// on anything missing or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("QUIZ_BIND") {
            match value.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(_) => warn!(%value, "invalid QUIZ_BIND, keeping default"),
            }
        }
        if let Ok(value) = std::env::var("QUIZ_DEFAULT_CAPACITY") {
            match value.parse::<usize>() {
                Ok(capacity) if capacity >= 2 => config.default_capacity = capacity,
                _ => warn!(%value, "invalid QUIZ_DEFAULT_CAPACITY, keeping default"),
            }
        }
        if let Ok(value) = std::env::var("QUIZ_CORPUS") {
            config.corpus_path = PathBuf::from(value);
        }

        config
    }
}

/// Router errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// Shared handles every connection task works with.
#[derive(Clone)]
struct RouterContext {
    directory: Arc<SessionDirectory>,
    store: Arc<IdentityStore>,
    registry: Arc<PlayerRegistry>,
}

/// Per-connection state: the socket's outbound channel and, after the
/// handshake, the identity this socket belongs to.
struct ConnectionState {
    id: Uuid,
    tx: mpsc::UnboundedSender<ServerPacket>,
    player: Option<Arc<PlayerIdentity>>,
}

/// The quiz game server.
pub struct QuizServer {
    config: ServerConfig,
    directory: Arc<SessionDirectory>,
    store: Arc<IdentityStore>,
    registry: Arc<PlayerRegistry>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QuizServer {
    /// Create a server around a loaded question corpus.
    pub fn new(config: ServerConfig, corpus: Arc<QuestionCorpus>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let session_config =
            SessionConfig { capacity: config.default_capacity, ..SessionConfig::default() };

        Self {
            directory: Arc::new(SessionDirectory::new(session_config, corpus)),
            store: Arc::new(IdentityStore::new()),
            registry: Arc::new(PlayerRegistry::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            config,
        }
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(version = %self.config.version, "quiz server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        info!(%addr, "new connection");
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Spawn the tasks serving one WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = RouterContext {
            directory: Arc::clone(&self.directory),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
        };
        let connections = Arc::clone(&self.connections);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!(%addr, error = %e, "websocket handshake failed");
                    return;
                }
            };
            connections.fetch_add(1, Ordering::Relaxed);

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<ServerPacket>();

            // Writer task: drains the outbound channel onto the socket.
            let sender_task = tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    let text = match packet.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to serialize packet");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut state = ConnectionState { id: Uuid::new_v4(), tx, player: None };

            loop {
                tokio::select! {
                    frame = ws_receiver.next() => match frame {
                        Some(Ok(Message::Text(text))) => match ClientPacket::from_json(&text) {
                            Ok(packet) => handle_client_packet(&ctx, &mut state, packet).await,
                            Err(e) => warn!(%addr, error = %e, "could not parse client packet"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(%addr, "client disconnected");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(%addr, error = %e, "websocket error");
                            break;
                        }
                        _ => {}
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }

            sender_task.abort();

            if let Some(player) = state.player.take() {
                on_connection_closed(&ctx, &player, state.id).await;
            }
            connections.fetch_sub(1, Ordering::Relaxed);
            debug!(%addr, "connection cleaned up");
        });
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Live transport connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Identities with at least one live connection.
    pub fn online_player_count(&self) -> usize {
        self.registry.online_count()
    }

    /// In-progress sessions.
    pub async fn session_count(&self) -> usize {
        self.directory.session_count().await
    }

    /// Read-only session snapshots for the administrative boundary.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.directory.snapshot().await
    }

    /// The session directory.
    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// The identity store.
    pub fn identity_store(&self) -> &Arc<IdentityStore> {
        &self.store
    }
}

/// Dispatch one parsed client packet.
async fn handle_client_packet(ctx: &RouterContext, state: &mut ConnectionState, packet: ClientPacket) {
    match packet {
        ClientPacket::Ping => {
            let _ = state.tx.send(ServerPacket::Pong);
        }
        ClientPacket::Authentication { player_id, token, name } => {
            handle_authentication(ctx, state, player_id, token, name).await;
        }
        ClientPacket::JoinGame => {
            let Some(player) = &state.player else {
                warn!("join-game before authentication");
                return;
            };
            info!(player = %player.id, "join game packet");
            ctx.directory.join(player).await;
        }
        ClientPacket::LeaveGame => {
            dispatch_to_session(ctx, state, "leave-game", |session, player| session.leave(player))
                .await;
        }
        ClientPacket::AnswerQuestion { answer } => {
            dispatch_to_session(ctx, state, "answer-question", |session, player| {
                session.answer(player, answer)
            })
            .await;
        }
    }
}

/// Authentication handshake: resolve or mint an identity, attach this
/// connection, retransmit the running game if there is one, otherwise hand
/// the player to matchmaking.
async fn handle_authentication(
    ctx: &RouterContext,
    state: &mut ConnectionState,
    player_id: Option<PlayerId>,
    token: Option<String>,
    name: Option<String>,
) {
    info!(?player_id, name = name.as_deref().unwrap_or_default(), "authentication");

    let player =
        authenticate_player(&ctx.store, &ctx.registry, player_id, token.as_deref(), name.as_deref())
            .await;

    player.attach_connection(Connection { id: state.id, tx: state.tx.clone() });
    state.player = Some(Arc::clone(&player));

    let game = match player.session() {
        Some(game_id) => match ctx.directory.get(game_id).await {
            Some(session) => Some(session.read().await.retransmission(player.id)),
            None => {
                error!(
                    player = %player.id,
                    game = %game_id,
                    "player references a game missing from the directory"
                );
                player.clear_session_if(game_id);
                None
            }
        },
        None => None,
    };
    let in_game = game.is_some();

    player.send_packet(&ServerPacket::Authenticate {
        id: player.id,
        token: player.token.clone(),
        name: player.name.clone(),
        game,
    });

    if !in_game {
        ctx.directory.join(&player).await;
    }
}

/// Resolve credentials to an identity. A known id with a matching token
/// reuses the live in-memory instance; anything else mints a fresh player.
pub(crate) async fn authenticate_player(
    store: &IdentityStore,
    registry: &PlayerRegistry,
    player_id: Option<PlayerId>,
    token: Option<&str>,
    name: Option<&str>,
) -> Arc<PlayerIdentity> {
    if let (Some(id), Some(token)) = (player_id, token) {
        if let Some(record) = store.lookup(id).await {
            if record.token == token {
                return registry.resolve_or_insert(record);
            }
        }
        debug!(player = %id, "unknown id or token mismatch, minting a fresh identity");
    }

    let name = name.filter(|n| !n.is_empty()).unwrap_or("Guest");
    let record = store.create(name).await;
    registry.resolve_or_insert(record)
}

/// Route a packet to the player's session under its write guard.
async fn dispatch_to_session<F>(ctx: &RouterContext, state: &ConnectionState, kind: &'static str, apply: F)
where
    F: FnOnce(&mut GameSession, &Arc<PlayerIdentity>) -> Result<(), SessionError>,
{
    let Some(player) = &state.player else {
        warn!(packet = kind, "packet before authentication");
        return;
    };
    let Some(game) = player.session() else {
        warn!(player = %player.id, packet = kind, "packet while not in a game");
        return;
    };
    let Some(session) = ctx.directory.get(game).await else {
        error!(player = %player.id, game = %game, "player references a game missing from the directory");
        player.clear_session_if(game);
        return;
    };

    let mut guard = session.write().await;
    if let Err(e) = apply(&mut guard, player) {
        warn!(player = %player.id, game = %game, packet = kind, error = %e, "packet dropped");
    }
}

/// Disconnect bookkeeping. Only when the last connection goes does the
/// player count as offline, and only a waiting-room membership is released;
/// mid-question and results disconnects keep the seat for reconnection.
async fn on_connection_closed(ctx: &RouterContext, player: &Arc<PlayerIdentity>, connection_id: Uuid) {
    match player.detach_connection(connection_id) {
        None => {
            error!(player = %player.id, "closed connection was not attached to its player");
        }
        Some(0) => {
            debug!(player = %player.id, "player offline");
            if let Some(game) = player.session() {
                if let Some(session) = ctx.directory.get(game).await {
                    let mut guard = session.write().await;
                    if guard.is_waiting() {
                        if let Err(e) = guard.leave(player) {
                            error!(player = %player.id, game = %game, error = %e, "implicit leave failed");
                        }
                    }
                }
            }
        }
        Some(_) => {}
    }
}
