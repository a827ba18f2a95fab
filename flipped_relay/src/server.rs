// TCP server for spectate sessions.
//
// Architecture: thread-per-connection over shared, lock-guarded state.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts connections
//   and spawns one connection thread for each.
// - **Connection threads**: each registers its `Session`, runs the handshake
//   (`Challenge` -> `Login`), performs the join procedure (roster exchange,
//   story replay, frame replay), then loops reading and dispatching that
//   peer's messages until the connection ends.
//
// There is no writer thread. A broadcast is written synchronously by
// whichever connection thread received the triggering message, while it
// holds the registry lock. Everything shared lives in `RelayState`:
// - `registry` and `frames` (see `registry.rs`; Registry before FrameLog).
// - `roles` and `story`, small leaf locks that are never held while taking
//   another lock. Story metadata is stored and broadcast under the registry
//   lock, the same lock a join replays it under.
//
// Joining: the new session is marked logged in under the registry lock, in
// the same critical section that replays the frame log to it. A frame that
// arrives concurrently is appended either before (and then replayed) or
// after (and then broadcast from the advanced cursor), never both and never
// neither.
//
// Failures: a transport error on a session's own connection is handled per
// `SessionErrorPolicy`. A failed send to some *other* session during a
// broadcast only closes that session; its own thread then disconnects it.
//
// Shutdown: `RelayHandle::stop`, or a session failure under
// `SessionErrorPolicy::ShutdownServer`, sets `shut_down`, closes every
// session and lets the listener thread exit.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use flipped_protocol::codec;
use flipped_protocol::{CodecError, Message, MessageKind, Role, SessionId};

use crate::registry::{FrameLog, Registry, RegistryGuard};
use crate::session::{Profile, Session};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7778;

/// How long a new connection has to send its `Login`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the listener checks for shutdown while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to do when reading from a session fails mid-stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionErrorPolicy {
    /// Close the whole server, every session included.
    #[default]
    ShutdownServer,
    /// Close only the failing session and tell the others it left.
    DropSession,
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_address: String,
    pub port: u16,
    /// When set, the `Challenge` carries a password seed. Passwords are
    /// passed through, not verified.
    pub password: Option<String>,
    /// Version announced in the `Challenge`.
    pub version: Option<String>,
    pub on_session_error: SessionErrorPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            password: None,
            version: None,
            on_session_error: SessionErrorPolicy::default(),
        }
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    state: Arc<RelayState>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Shut the server down and wait for the listener to exit.
    pub fn stop(mut self) {
        self.state.shutdown();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// True once the server has shut down, by `stop` or by a session failure.
    pub fn is_shut_down(&self) -> bool {
        self.state.is_shut_down()
    }

    /// Number of connected sessions, logged in or not.
    pub fn session_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Number of frames received from the player so far.
    pub fn frame_count(&self) -> usize {
        self.state.frames.len()
    }
}

/// Bind the listener and start accepting on a background thread. Returns a
/// handle for stopping it and the bound address (useful with port 0).
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind_address.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    // Non-blocking so the accept loop can notice shutdown.
    listener.set_nonblocking(true)?;
    log::info!("spectate relay waiting for connections on {addr}");

    let state = Arc::new(RelayState::new(config));
    let listener_state = Arc::clone(&state);
    let thread = thread::spawn(move || accept_loop(listener, listener_state));

    Ok((
        RelayHandle {
            state,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Last-write-wins session metadata, replayed to joiners.
#[derive(Clone, Default)]
struct StoryState {
    named: Option<Message>,
    started: Option<Message>,
    sid_started: Option<Message>,
}

/// Current holders of the single-occupant roles.
#[derive(Default)]
struct RoleSlots {
    player: Option<Arc<Session>>,
    controller: Option<Arc<Session>>,
}

struct RelayState {
    config: RelayConfig,
    registry: Registry,
    frames: FrameLog,
    next_id: AtomicU32,
    roles: Mutex<RoleSlots>,
    story: Mutex<StoryState>,
    shut_down: AtomicBool,
}

/// Whether a connection's read loop should keep going.
enum Flow {
    Continue,
    Quit,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            frames: FrameLog::new(),
            next_id: AtomicU32::new(1),
            roles: Mutex::new(RoleSlots::default()),
            story: Mutex::new(StoryState::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("shutting down spectate relay");
        for session in self.registry.drain() {
            session.close();
        }
    }

    fn story(&self) -> StoryState {
        self.story
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_story(&self, update: impl FnOnce(&mut StoryState)) {
        update(&mut self.story.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn current_player(&self) -> Option<Arc<Session>> {
        self.roles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .player
            .clone()
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Register a new connection, run its handshake and join, then serve it
    /// until it ends.
    fn serve(&self, stream: TcpStream) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = match Session::new(id, stream) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                log::error!("failed to set up session {id}: {e}");
                return;
            }
        };
        let mut reader = match session.reader() {
            Ok(reader) => reader,
            Err(e) => {
                log::error!("failed to set up session {id}: {e}");
                session.close();
                return;
            }
        };

        self.registry.add(Arc::clone(&session));
        if self.is_shut_down() {
            // Raced with shutdown after the registry was drained.
            session.close();
            return;
        }
        match session.peer() {
            Some(peer) => log::info!("session {id} connected from {peer}"),
            None => log::info!("session {id} connected"),
        }

        if let Err(e) = self.handshake(&session, &mut reader) {
            log::warn!("handshake with session {id} failed: {e}");
            session.close();
            self.disconnect_session(&session);
            return;
        }

        if let Err(e) = self.connect_session(&session) {
            self.session_failed(&session, &e);
        } else {
            self.read_loop(&session, &mut reader);
        }
        self.disconnect_session(&session);
    }

    /// Send `Challenge` and read exactly one `Login`.
    fn handshake(
        &self,
        session: &Session,
        reader: &mut BufReader<TcpStream>,
    ) -> Result<(), CodecError> {
        let seed = self
            .config
            .password
            .as_ref()
            .map(|_| format!("{:016x}", rand::random::<u64>()));
        session.send(&Message::challenge(
            self.config.version.as_deref(),
            seed.as_deref(),
        ))?;

        session.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
        let login = codec::decode(reader)?;
        session.set_read_timeout(None);

        if login.kind() != MessageKind::Login {
            return Err(CodecError::MalformedPayload(format!(
                "expected Login, got {}",
                login.kind().name()
            )));
        }
        if seed.is_some() && login.password().is_none() {
            log::warn!("session {} sent no password", session.id());
        }
        session.set_profile(Profile::from_login(&login));
        log::info!(
            "session {} logged in as {} '{}'",
            session.id(),
            login.role(),
            login.name()
        );
        Ok(())
    }

    /// Bring a freshly logged-in session into the session: role slot,
    /// `Accept`, roster exchange, then replay of story metadata and frames.
    fn connect_session(&self, session: &Arc<Session>) -> Result<(), CodecError> {
        {
            let mut roles = self.roles.lock().unwrap_or_else(PoisonError::into_inner);
            match session.role() {
                Role::Player => roles.player = Some(Arc::clone(session)),
                Role::Controller => roles.controller = Some(Arc::clone(session)),
                Role::Spectator => {}
            }
        }

        session.send(&Message::accept(None))?;

        // Remind them about themselves first.
        let introduction = session.connected_notice();
        session.send(&introduction)?;

        let registry = self.registry.lock();
        let introduction = codec::encode(&introduction)?;
        for other in registry.logged_in() {
            if let Err(e) = other.send_encoded(&introduction) {
                log::warn!("failed to introduce session {} to {}: {e}", session.id(), other.id());
                other.close();
            }
            session.send(&other.connected_notice())?;
        }
        session.set_logged_in();

        let story = self.story();
        if let Some(named) = &story.named {
            session.send(named)?;
        }
        if let Some(started) = &story.started {
            session.send(started)?;
        }

        if session.is_player() {
            if let Some(sid_started) = &story.sid_started {
                session.send(sid_started)?;
            }
        } else {
            let sent = self.frames.replay_to(&registry, session)?;
            if sent > 0 {
                log::info!("replayed {sent} frames to session {}", session.id());
            }
        }
        Ok(())
    }

    /// Read and dispatch messages until the connection ends.
    fn read_loop(&self, session: &Session, reader: &mut BufReader<TcpStream>) {
        while !self.is_shut_down() {
            match codec::decode(reader) {
                Ok(message) => {
                    if let Flow::Quit = self.dispatch(session, message) {
                        log::info!("session {} quit", session.id());
                        session.close();
                        return;
                    }
                }
                Err(e) if e.is_closed() || session.is_closed() => {
                    log::info!("session {} closed its connection", session.id());
                    return;
                }
                Err(e) => {
                    self.session_failed(session, &e);
                    return;
                }
            }
        }
    }

    /// Handle a failure reading from or writing to `session` itself.
    fn session_failed(&self, session: &Session, error: &CodecError) {
        let transport = matches!(
            error,
            CodecError::Io(_) | CodecError::TruncatedHeader | CodecError::TruncatedBody { .. }
        );
        if transport && self.config.on_session_error == SessionErrorPolicy::ShutdownServer {
            log::error!("problem when waiting for messages from session {}: {error}", session.id());
            self.shutdown();
        } else {
            log::warn!("dropping session {}: {error}", session.id());
            session.close();
        }
    }

    /// Remove `session` and tell everyone left. No-op once shut down.
    fn disconnect_session(&self, session: &Session) {
        if self.is_shut_down() {
            return;
        }
        session.close();

        let id = session.id();
        {
            let mut roles = self.roles.lock().unwrap_or_else(PoisonError::into_inner);
            if roles.player.as_ref().is_some_and(|p| p.id() == id) {
                roles.player = None;
            }
            if roles.controller.as_ref().is_some_and(|c| c.id() == id) {
                roles.controller = None;
            }
        }

        let mut registry = self.registry.lock();
        if registry.remove(id).is_none() {
            return;
        }
        log::info!("session {id} disconnected");
        match codec::encode(&Message::disconnected(id)) {
            Ok(notice) => Self::send_all(&registry, &notice, |_| true),
            Err(e) => log::error!("failed to encode Disconnected: {e}"),
        }
    }

    // -- Dispatch ------------------------------------------------------------

    fn dispatch(&self, session: &Session, message: Message) -> Flow {
        let kind = message.kind();
        log::debug!("received {} from session {}", kind.name(), session.id());
        match kind {
            MessageKind::StoryNamed => {
                if !session.is_controller() {
                    log::warn!("story named by non-controller session {}", session.id());
                }
                log::info!("story named '{}'", message.name());
                self.publish_story(&message, |story| story.named = Some(message.clone()));
            }
            MessageKind::SiDStarted => {
                // Under the registry lock, like a join, so a joining player
                // sees this notice exactly once.
                let _registry = self.registry.lock();
                self.update_story(|story| story.sid_started = Some(message.clone()));
                match self.current_player().filter(|p| p.logged_in()) {
                    Some(player) => {
                        if let Err(e) = player.send(&message) {
                            log::warn!("failed to forward SiD start to player {}: {e}", player.id());
                            player.close();
                        }
                    }
                    None => log::debug!("no player logged in to forward SiD start to"),
                }
            }
            MessageKind::Frame => {
                if !session.is_player() {
                    log::warn!("frame from non-player session {}", session.id());
                }
                match codec::encode(&message) {
                    Ok(frame) => {
                        let len = self.frames.append(frame);
                        log::info!("received frame #{len} from session {}", session.id());
                        self.update_spectators();
                    }
                    Err(e) => log::error!("failed to encode frame: {e}"),
                }
            }
            MessageKind::StoryStarted => {
                self.publish_story(&message, |story| story.started = Some(message.clone()));
            }
            MessageKind::Chat => self.route_chat(session, message),
            MessageKind::Quit => return Flow::Quit,
            MessageKind::Challenge
            | MessageKind::Login
            | MessageKind::Accept
            | MessageKind::Reject
            | MessageKind::Connected
            | MessageKind::Disconnected
            | MessageKind::Rename
            | MessageKind::Kick => {
                log::error!(
                    "unexpected {} from session {}; ignoring",
                    kind.name(),
                    session.id()
                );
            }
        }
        Flow::Continue
    }

    /// Bring every logged-in non-player up to the end of the frame log.
    fn update_spectators(&self) {
        let registry = self.registry.lock();
        for other in registry.logged_in().filter(|s| !s.is_player()) {
            if let Err(e) = self.frames.replay_to(&registry, other) {
                log::warn!("failed to update session {}: {e}", other.id());
                other.close();
            }
        }
    }

    /// Deliver a chat line to its addressee, or to everyone but the sender
    /// when it has none. Lines addressed to anything but a logged-in session
    /// are dropped.
    fn route_chat(&self, sender: &Session, mut message: Message) {
        message.set("from", sender.id().0);
        let registry = self.registry.lock();
        if !message.is_addressed() {
            match codec::encode(&message) {
                Ok(wire) => Self::send_all(&registry, &wire, |s| s.id() != sender.id()),
                Err(e) => log::error!("failed to encode chat: {e}"),
            }
            return;
        }
        let target = message
            .recipient()
            .and_then(|to| registry.find(to))
            .filter(|s| s.logged_in());
        match target {
            Some(target) => {
                if let Err(e) = target.send(&message) {
                    log::warn!("failed to deliver chat to session {}: {e}", target.id());
                    target.close();
                }
            }
            None => log::debug!("dropping chat to unknown session {}", message.get("to")),
        }
    }

    /// Store story metadata and announce it to every logged-in session. Both
    /// happen under the registry lock, so a joiner gets it either from its
    /// replay or from this broadcast, never both.
    fn publish_story(&self, message: &Message, update: impl FnOnce(&mut StoryState)) {
        let registry = self.registry.lock();
        self.update_story(update);
        match codec::encode(message) {
            Ok(wire) => Self::send_all(&registry, &wire, |_| true),
            Err(e) => log::error!("failed to encode {}: {e}", message.kind().name()),
        }
    }

    fn send_all(registry: &RegistryGuard<'_>, wire: &[u8], filter: impl Fn(&Session) -> bool) {
        for target in registry.logged_in().filter(|s| filter(s)) {
            if let Err(e) = target.send_encoded(wire) {
                log::warn!("failed to send to session {}: {e}", target.id());
                target.close();
            }
        }
    }
}

/// Accept connections until shutdown, one thread per connection.
fn accept_loop(listener: TcpListener, state: Arc<RelayState>) {
    while !state.is_shut_down() {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("dropping connection: {e}");
                    continue;
                }
                let state = Arc::clone(&state);
                thread::spawn(move || state.serve(stream));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("failed to listen: {e}");
                state.shutdown();
                break;
            }
        }
    }
    log::debug!("listener stopped");
}
