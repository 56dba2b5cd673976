//! Session manager: the engine's single orchestrator.
//!
//! Discovery, transport and the consumer handle all feed one event queue;
//! a single loop task consumes it and is the only writer of the connected
//! set and the message log. The consumer-facing [`ChatSession`] handle
//! never blocks: `start`, `stop` and `send` enqueue and return, and
//! outcomes surface as [`ChatEvent`]s or state snapshots.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use crate::config::EngineConfig;
use crate::discovery::{adapt_service_event, Discovery, DiscoveryEvent};
use crate::error::{SendError, TransportError};
use crate::identity::local_identity;
use crate::peer::{ConnectionState, InboundMessage, PeerId};
use crate::transport::{Session, SessionEvent};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Consumer notifications, delivered through [`ChatSession::subscribe`].
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageReceived(InboundMessage),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

enum Command {
    Start,
    Stop,
    Broadcast(String),
    // Invite a peer at a known address without waiting for discovery.
    Invite(PeerId, SocketAddr),
}

/// Snapshots readable by the consumer; written only by the engine loop.
struct Shared {
    connected: Mutex<HashSet<PeerId>>,
    messages: Mutex<Vec<InboundMessage>>,
}

/// Handle to a running chat engine. Cheap to clone; all clones drive the
/// same engine.
#[derive(Clone)]
pub struct ChatSession {
    identity: PeerId,
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ChatEvent>,
    transport: Session,
}

impl ChatSession {
    /// Derives the local identity, opens the transport endpoint and spawns
    /// the engine loop. Discovery does not begin until [`start`] is called.
    ///
    /// [`start`]: ChatSession::start
    pub fn new(config: EngineConfig) -> Result<Self, TransportError> {
        let identity = local_identity(&config);
        let shared = Arc::new(Shared {
            connected: Mutex::new(HashSet::new()),
            messages: Mutex::new(Vec::new()),
        });
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (session_tx, session_rx) = mpsc::channel(EVENT_QUEUE);

        let transport = Session::open(identity.clone(), &config, session_tx)?;
        tracing::info!(%identity, "chat engine ready");

        let engine = Engine {
            identity: identity.clone(),
            config,
            transport: transport.clone(),
            shared: Arc::clone(&shared),
            events: events.clone(),
            discovery: None,
            started: false,
        };
        tokio::spawn(engine.run(commands_rx, session_rx));

        Ok(Self {
            identity,
            commands: commands_tx,
            shared,
            events,
            transport,
        })
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Address the transport endpoint is bound to. Useful with
    /// [`invite`](ChatSession::invite) when discovery is unavailable.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.transport.local_addr()
    }

    /// Begins advertising and browsing. No-op if already started.
    pub fn start(&self) {
        self.enqueue(Command::Start);
    }

    /// Stops browsing and advertising, then disconnects the transport if
    /// any peer is connected. Safe to call before `start` or repeatedly.
    pub fn stop(&self) {
        self.enqueue(Command::Stop);
    }

    /// Invites a peer at a known address, bypassing discovery. Duplicate
    /// invites to a connecting or connected peer are no-ops.
    pub fn invite(&self, peer: PeerId, addr: SocketAddr) {
        self.enqueue(Command::Invite(peer, addr));
    }

    /// Broadcasts a text message to every connected peer.
    ///
    /// Validation errors come back synchronously and nothing reaches the
    /// transport; transport failures on the actual send are logged by the
    /// engine loop after this returns.
    pub fn send(&self, text: &str) -> Result<(), SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if self.shared.connected.lock().unwrap().is_empty() {
            return Err(SendError::NoRecipients);
        }
        self.commands
            .try_send(Command::Broadcast(text.to_string()))
            .map_err(|_| SendError::Transport("engine stopped".into()))
    }

    pub fn connected_peer_count(&self) -> usize {
        self.shared.connected.lock().unwrap().len()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connected.lock().unwrap().iter().cloned().collect()
    }

    /// Ordered log of every message received so far.
    pub fn messages(&self) -> Vec<InboundMessage> {
        self.shared.messages.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn enqueue(&self, command: Command) {
        if self.commands.try_send(command).is_err() {
            tracing::warn!("engine command queue unavailable, dropping command");
        }
    }
}

struct Engine {
    identity: PeerId,
    config: EngineConfig,
    transport: Session,
    shared: Arc<Shared>,
    events: broadcast::Sender<ChatEvent>,
    discovery: Option<Discovery>,
    started: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        let (disc_tx, mut disc_rx) = mpsc::channel(EVENT_QUEUE);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(c) => self.handle_command(c, &disc_tx).await,
                    None => break,
                },
                Some(event) = session_events.recv() => self.handle_transport(event),
                Some(event) = disc_rx.recv() => self.handle_discovery(event),
            }
        }
        tracing::debug!("engine loop finished");
    }

    async fn handle_command(&mut self, command: Command, disc_tx: &mpsc::Sender<DiscoveryEvent>) {
        match command {
            Command::Start => self.start_discovery(disc_tx),
            Command::Stop => self.stop_engine().await,
            Command::Broadcast(text) => self.broadcast(&text).await,
            Command::Invite(peer, addr) => self.transport.connect(peer, addr),
        }
    }

    /// Begins advertising and browsing concurrently. Discovery failures
    /// are logged and leave discovery inactive; a later `start` retries.
    fn start_discovery(&mut self, disc_tx: &mpsc::Sender<DiscoveryEvent>) {
        if self.started {
            tracing::debug!("start called while running, ignoring");
            return;
        }
        let port = match self.transport.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::error!(error = %e, "cannot read endpoint address");
                return;
            }
        };
        let mut discovery = match Discovery::new(&self.config.service_type) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "discovery unavailable");
                return;
            }
        };
        let advertising = match discovery.advertise(&self.identity, port) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "advertising failed, staying inactive");
                false
            }
        };
        let browsing = match discovery.browse() {
            Ok(receiver) => {
                let local_id = self.identity.clone();
                let disc_tx = disc_tx.clone();
                tokio::spawn(async move {
                    while let Ok(event) = receiver.recv_async().await {
                        if let Some(adapted) = adapt_service_event(event, &local_id) {
                            if disc_tx.send(adapted).await.is_err() {
                                return;
                            }
                        }
                    }
                });
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "browsing failed, staying inactive");
                false
            }
        };
        self.discovery = Some(discovery);
        // A partial start stays retryable: calling start again replaces
        // this Discovery (re-register is idempotent) and tries both roles.
        self.started = advertising && browsing;
    }

    /// Teardown in order: browser, advertiser, then transport — the last
    /// only when something is actually connected. Every step is safe even
    /// if `start` never ran.
    async fn stop_engine(&mut self) {
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop_browsing();
            discovery.stop_advertising();
        }
        self.discovery = None;
        let has_peers = !self.shared.connected.lock().unwrap().is_empty();
        if has_peers {
            self.transport.disconnect().await;
        }
        self.started = false;
        tracing::info!("engine stopped");
    }

    async fn broadcast(&self, text: &str) {
        let recipients: Vec<PeerId> = {
            let connected = self.shared.connected.lock().unwrap();
            connected.iter().cloned().collect()
        };
        if recipients.is_empty() {
            // The peer set may have emptied between the handle check and
            // here; the message is simply dropped.
            tracing::warn!("no connected peers, dropping message");
            return;
        }
        if let Err(e) = self.transport.send(text, &recipients).await {
            tracing::warn!(error = %e, "broadcast failed");
        }
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound { peer, addr } => {
                tracing::info!(%peer, %addr, "peer found, inviting");
                // Rediscovery re-invites; the transport treats invites to a
                // connecting or connected peer as no-ops.
                self.transport.connect(peer, addr);
            }
            DiscoveryEvent::PeerLost { peer } => {
                // Lost from discovery does not mean disconnected; only
                // transport events drive connection state.
                tracing::info!(%peer, "peer lost from discovery");
            }
        }
    }

    fn handle_transport(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { peer, state } => self.apply_state(peer, state),
            SessionEvent::Data { peer, payload } => self.append_message(peer, payload),
        }
    }

    fn apply_state(&mut self, peer: PeerId, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                let inserted = self.shared.connected.lock().unwrap().insert(peer.clone());
                if inserted {
                    tracing::info!(%peer, "peer connected");
                    let _ = self.events.send(ChatEvent::PeerConnected(peer));
                }
            }
            ConnectionState::NotConnected => {
                let removed = self.shared.connected.lock().unwrap().remove(&peer);
                if removed {
                    tracing::info!(%peer, "peer disconnected");
                    let _ = self.events.send(ChatEvent::PeerDisconnected(peer));
                }
            }
            ConnectionState::Connecting => {
                tracing::debug!(%peer, "connecting");
            }
        }
    }

    fn append_message(&mut self, peer: PeerId, payload: Vec<u8>) {
        let text = String::from_utf8_lossy(&payload).into_owned();
        let message = InboundMessage { sender: peer, text };
        tracing::debug!(line = %message.display_line(), "message received");
        self.shared.messages.lock().unwrap().push(message.clone());
        let _ = self.events.send(ChatEvent::MessageReceived(message));
    }
}
