// TCP client for joining a spectate relay.
//
// Architecture:
// - `connect()` opens the TCP connection on the calling thread, then spawns a
//   background reader thread for the lifetime of the connection.
// - The reader thread decodes messages and runs the protocol: it answers
//   `Challenge` with `Login`, adopts the name from `Accept`, tracks the
//   roster (`Connected` / `Disconnected`), the story name and start time.
//   Frames and story starts are handed to the owner as `ClientEvent`s over an
//   `mpsc` channel.
// - The owner drains events with `poll()` (non-blocking) or
//   `recv_timeout()`, and calls the outbound operations (`send_frames`,
//   `send_story_started`, ...) synchronously on its own thread.
//
// Any transport failure, on either side, closes the connection; the reader
// thread then reports `ClientEvent::Closed` and exits. Writes are serialized
// by a mutex, since the reader thread also writes (`Login`, `StoryNamed`).

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flipped_protocol::codec;
use flipped_protocol::{
    CodecError, DEFAULT_NAME, DEFAULT_STORY_NAME, Message, MessageKind, Role, SessionId,
};
use thiserror::Error;

/// Time limit reported for a role nobody holds.
pub const DEFAULT_TIME_LIMIT: u32 = 0;

/// Errors from connecting or sending.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Who this client is, as announced in its `Login`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub name: String,
    pub role: Role,
    pub time_limit: Option<u32>,
    /// Sent only if the server's `Challenge` asks for one.
    pub password: Option<String>,
    /// Controllers announce this story name once accepted.
    pub story_name: Option<String>,
    pub version: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            role: Role::Spectator,
            time_limit: None,
            password: None,
            story_name: None,
            version: Some(env!("CARGO_PKG_VERSION").into()),
        }
    }
}

/// Something the owner needs to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A frame from the player (raw image bytes).
    FrameReceived(Vec<u8>),
    /// The player started the story.
    StoryStarted {
        name: String,
        started_at: DateTime<Utc>,
    },
    /// The connection is gone; no more events will follow.
    Closed,
}

/// A peer as described by a `Connected` notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: SessionId,
    pub name: String,
    pub role: Role,
    pub time_limit: Option<u32>,
}

impl PeerInfo {
    fn from_connected(message: &Message) -> Option<Self> {
        Some(Self {
            id: message.id()?,
            name: message.name().to_owned(),
            role: message.role(),
            time_limit: message.time_limit(),
        })
    }
}

/// Connection-local view of the session, updated by the reader thread.
#[derive(Default)]
struct ClientState {
    name: String,
    story_name: Option<String>,
    story_started_at: Option<DateTime<Utc>>,
    controller: Option<PeerInfo>,
    player: Option<PeerInfo>,
    peers: Vec<PeerInfo>,
}

/// State shared between the owner and the reader thread.
struct Shared {
    config: ClientConfig,
    peer_label: String,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    state: Mutex<ClientState>,
    events: Sender<ClientEvent>,
    closed: AtomicBool,
}

/// TCP client for a spectate relay.
pub struct RelayClient {
    shared: Arc<Shared>,
    inbox: Receiver<ClientEvent>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to a relay and start the reader thread. The handshake runs on
    /// that thread, driven by the server's `Challenge`.
    pub fn connect(address: &str, port: u16, config: ClientConfig) -> Result<Self, ClientError> {
        let peer_label = format!("{address}:{port}");
        let stream = TcpStream::connect((address, port)).map_err(|source| ClientError::Connect {
            addr: peer_label.clone(),
            source,
        })?;
        log::info!("connected to {peer_label}");

        let clone = |stream: &TcpStream| {
            stream.try_clone().map_err(|source| ClientError::Connect {
                addr: peer_label.clone(),
                source,
            })
        };
        let reader = BufReader::new(clone(&stream)?);
        let writer = BufWriter::new(clone(&stream)?);

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState {
                name: config.name.clone(),
                story_name: config.story_name.clone(),
                ..ClientState::default()
            }),
            config,
            peer_label,
            stream,
            writer: Mutex::new(writer),
            events: tx,
            closed: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_thread = thread::spawn(move || reader_loop(reader_shared, reader));

        Ok(Self {
            shared,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    // -- Outbound ------------------------------------------------------------

    /// Player only: send one `Frame` per blob, in order. The first failure
    /// closes the connection and abandons the remaining frames.
    pub fn send_frames<F: AsRef<[u8]>>(&self, frames: &[F]) -> Result<(), ClientError> {
        log::info!("sending {} frames to server", frames.len());
        for frame in frames {
            if let Err(e) = self.shared.send(&Message::frame(frame.as_ref())) {
                log::error!("failed to send frames: {e}");
                self.shared.close();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Player only: record now as the story start and announce it. Returns
    /// the recorded time, even if sending failed (the connection is then
    /// closed).
    pub fn send_story_started(&self) -> DateTime<Utc> {
        let started_at = Utc::now();
        self.shared.state().story_started_at = Some(started_at);
        let _ = self.send_or_close(&Message::story_started(started_at), "story started");
        started_at
    }

    /// Controller only: rename the story for everyone.
    pub fn send_story_named(&self, name: &str) -> Result<(), ClientError> {
        self.shared.state().story_name = Some(name.to_owned());
        self.send_or_close(&Message::story_named(name), "story name")
    }

    /// Controller only: tell the player SiD is up.
    pub fn send_sid_started(&self, port: Option<u16>) -> Result<(), ClientError> {
        self.send_or_close(&Message::sid_started(port), "SiD started")
    }

    /// Chat to one peer, or to everyone else when `to` is `None`.
    pub fn send_chat(&self, to: Option<SessionId>, message: &str) -> Result<(), ClientError> {
        self.send_or_close(&Message::chat(None, to, message), "chat")
    }

    /// Say goodbye and close the connection.
    pub fn quit(&self, message: Option<&str>) {
        let _ = self.send_or_close(&Message::quit(message), "quit");
        self.shared.close();
    }

    fn send_or_close(&self, message: &Message, what: &str) -> Result<(), ClientError> {
        self.shared.send(message).inspect_err(|e| {
            log::error!("failed to send {what}: {e}");
            self.shared.close();
        })
    }

    // -- Events --------------------------------------------------------------

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    // -- Session view --------------------------------------------------------

    /// Our name, as accepted (or renamed) by the server.
    pub fn name(&self) -> String {
        self.shared.state().name.clone()
    }

    pub fn role(&self) -> Role {
        self.shared.config.role
    }

    pub fn controller(&self) -> Option<PeerInfo> {
        self.shared.state().controller.clone()
    }

    pub fn player(&self) -> Option<PeerInfo> {
        self.shared.state().player.clone()
    }

    pub fn controller_name(&self) -> String {
        self.controller()
            .map_or_else(|| DEFAULT_NAME.to_owned(), |c| c.name)
    }

    pub fn controller_time_limit(&self) -> u32 {
        self.controller()
            .and_then(|c| c.time_limit)
            .unwrap_or(DEFAULT_TIME_LIMIT)
    }

    pub fn player_name(&self) -> String {
        self.player().map_or_else(|| DEFAULT_NAME.to_owned(), |p| p.name)
    }

    pub fn player_time_limit(&self) -> u32 {
        self.player()
            .and_then(|p| p.time_limit)
            .unwrap_or(DEFAULT_TIME_LIMIT)
    }

    /// Everyone the server has told us about, ourselves included.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.state().peers.clone()
    }

    pub fn story_name(&self) -> String {
        self.shared.state().story_name()
    }

    /// Set the story name a controller announces on its next `Accept`.
    pub fn set_story_name(&self, name: &str) {
        self.shared.state().story_name = Some(name.to_owned());
    }

    pub fn story_started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.state().story_started_at
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // Unblocks the reader thread.
        self.shared.close();
    }
}

impl ClientState {
    fn story_name(&self) -> String {
        self.story_name
            .clone()
            .unwrap_or_else(|| DEFAULT_STORY_NAME.to_owned())
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing connection to {}", self.peer_label);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn send(&self, message: &Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        log::debug!("sending {}", message.kind().name());
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        codec::write_message(&mut *writer, message)?;
        Ok(())
    }

    /// Send from the reader thread; a failure closes the connection.
    fn reply(&self, message: &Message) {
        if let Err(e) = self.send(message) {
            log::error!("failed to send {}: {e}", message.kind().name());
            self.close();
        }
    }

    fn notify(&self, event: ClientEvent) {
        // The owner may have dropped its receiver; nothing left to tell.
        let _ = self.events.send(event);
    }

    fn dispatch(&self, message: Message) {
        match message.kind() {
            MessageKind::Frame => match message.frame_data() {
                Ok(data) => {
                    log::info!("received frame ({} bytes)", data.len());
                    self.notify(ClientEvent::FrameReceived(data));
                }
                Err(e) => log::error!("discarding frame: {e}"),
            },
            MessageKind::Challenge => {
                log::info!("server at {} identified", self.peer_label);
                let password = if message.requires_password() {
                    self.config.password.as_deref()
                } else {
                    None
                };
                let name = self.state().name.clone();
                self.reply(&Message::login(
                    &name,
                    self.config.role,
                    self.config.time_limit,
                    self.config.version.as_deref(),
                    password,
                ));
            }
            MessageKind::Accept => {
                log::info!("login accepted");
                let story_name = {
                    let mut state = self.state();
                    if let Some(renamed_as) = message.renamed_as() {
                        state.name = renamed_as.to_owned();
                    }
                    state.story_name.clone()
                };
                // Tell everyone else what the story is called.
                if let (Role::Controller, Some(story_name)) = (self.config.role, story_name) {
                    self.reply(&Message::story_named(&story_name));
                }
            }
            MessageKind::Connected => {
                let Some(peer) = PeerInfo::from_connected(&message) else {
                    log::error!("Connected notice without an id");
                    return;
                };
                match peer.role {
                    Role::Controller => log::info!(
                        "controller '{}' connected with {:?}s turns",
                        peer.name,
                        peer.time_limit
                    ),
                    Role::Player => log::info!(
                        "player '{}' connected with {:?}s turns",
                        peer.name,
                        peer.time_limit
                    ),
                    Role::Spectator => log::info!("spectator '{}' connected", peer.name),
                }
                let mut state = self.state();
                match peer.role {
                    Role::Controller => state.controller = Some(peer.clone()),
                    Role::Player => state.player = Some(peer.clone()),
                    Role::Spectator => {}
                }
                state.peers.retain(|p| p.id != peer.id);
                state.peers.push(peer);
            }
            MessageKind::Disconnected => {
                let Some(id) = message.id() else {
                    log::error!("Disconnected notice without an id");
                    return;
                };
                let mut state = self.state();
                if let Some(index) = state.peers.iter().position(|p| p.id == id) {
                    let gone = state.peers.remove(index);
                    log::info!("'{}' disconnected", gone.name);
                }
                if state.controller.as_ref().is_some_and(|c| c.id == id) {
                    state.controller = None;
                }
                if state.player.as_ref().is_some_and(|p| p.id == id) {
                    state.player = None;
                }
            }
            MessageKind::StoryNamed => {
                log::info!("story named as '{}'", message.name());
                self.state().story_name = Some(message.name().to_owned());
            }
            MessageKind::StoryStarted => {
                let Some(started_at) = message.started_at() else {
                    log::error!("story started without a valid timestamp");
                    return;
                };
                let name = {
                    let mut state = self.state();
                    state.story_started_at = Some(started_at);
                    state.story_name()
                };
                log::info!("story '{name}' started at {started_at}");
                self.notify(ClientEvent::StoryStarted { name, started_at });
            }
            MessageKind::Login
            | MessageKind::Reject
            | MessageKind::SiDStarted
            | MessageKind::Rename
            | MessageKind::Chat
            | MessageKind::Kick
            | MessageKind::Quit => {
                log::error!("unrecognised message type: {}", message.kind().name());
            }
        }
    }
}

/// Reader thread: decode and dispatch until the connection ends.
fn reader_loop(shared: Arc<Shared>, mut reader: BufReader<TcpStream>) {
    loop {
        match codec::decode(&mut reader) {
            Ok(message) => shared.dispatch(message),
            Err(e) if e.is_closed() || shared.is_closed() => {
                log::info!("connection to {} closed", shared.peer_label);
                break;
            }
            Err(e) => {
                log::error!("failed to read message: {e}");
                break;
            }
        }
    }
    shared.close();
    shared.notify(ClientEvent::Closed);
}
