// One connected peer of the relay server.
//
// A `Session` wraps the TCP stream of a single connection: its relay-assigned
// ID, the profile it logged in with (name, role, time limit), its replay
// cursor into the frame log, and whether its handshake has completed.
//
// Sessions are shared between threads as `Arc<Session>`: the connection's own
// reader thread, and whichever reader thread is currently broadcasting to it.
// All mutation therefore goes through interior mutability:
// - The write half sits behind a `Mutex`, so concurrent broadcasts never
//   interleave bytes of two frames. This lock is always the innermost one
//   (Registry -> FrameLog -> session writer).
// - `position` is only advanced by `FrameLog::replay_to`, which runs under
//   the frame log lock, so deliveries to one session are strictly ordered.
//
// `close()` shuts down both directions of the socket. That also unblocks the
// session's reader thread, which then runs the disconnect procedure.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use flipped_protocol::codec;
use flipped_protocol::{CodecError, DEFAULT_NAME, Message, Role, SessionId};

/// Cursor value of a session that has been sent no frames yet.
pub const NOTHING_SENT: i64 = -1;

/// What a peer told us about itself in its `Login`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub role: Role,
    pub time_limit: Option<u32>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            role: Role::Spectator,
            time_limit: None,
        }
    }
}

impl Profile {
    /// Profile announced by a `Login` message.
    pub fn from_login(login: &Message) -> Self {
        Self {
            name: login.name().to_owned(),
            role: login.role(),
            time_limit: login.time_limit(),
        }
    }
}

/// A live connection to one peer.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    profile: RwLock<Profile>,
    position: AtomicI64,
    logged_in: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    /// Wrap an accepted connection. Fails only if the socket can't be cloned
    /// for its write half.
    pub fn new(id: SessionId, stream: TcpStream) -> io::Result<Self> {
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            id,
            peer: stream.peer_addr().ok(),
            stream,
            writer: Mutex::new(writer),
            profile: RwLock::new(Profile::default()),
            position: AtomicI64::new(NOTHING_SENT),
            logged_in: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A buffered read half for this session's reader thread.
    pub fn reader(&self) -> io::Result<BufReader<TcpStream>> {
        Ok(BufReader::new(self.stream.try_clone()?))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn profile(&self) -> Profile {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn name(&self) -> String {
        self.profile().name
    }

    pub fn role(&self) -> Role {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .role
    }

    pub fn time_limit(&self) -> Option<u32> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .time_limit
    }

    pub fn is_player(&self) -> bool {
        self.role() == Role::Player
    }

    pub fn is_controller(&self) -> bool {
        self.role() == Role::Controller
    }

    pub fn is_spectator(&self) -> bool {
        self.role() == Role::Spectator
    }

    /// Index of the last frame-log entry delivered, or `NOTHING_SENT`.
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    /// True once the handshake has completed and the session takes part in
    /// broadcasts.
    pub fn logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `Connected` notice describing this session to its peers.
    pub fn connected_notice(&self) -> Message {
        let profile = self.profile();
        Message::connected(self.id, &profile.name, profile.role, profile.time_limit)
    }

    /// Encode and send one message.
    pub fn send(&self, message: &Message) -> Result<(), CodecError> {
        log::debug!("sending {} to session {}", message.kind().name(), self.id);
        self.send_encoded(&codec::encode(message)?)
    }

    /// Send an already-encoded wire frame. Used for broadcasts, which encode
    /// once for every recipient.
    pub fn send_encoded(&self, frame: &[u8]) -> Result<(), CodecError> {
        if self.is_closed() {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("session {} is closed", self.id),
            )));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Shut the connection down. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing session {}", self.id);
        // Fails if the peer already hung up, which is fine.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        if let Err(e) = self.stream.set_read_timeout(timeout) {
            log::warn!("session {}: cannot set read timeout: {e}", self.id);
        }
    }

    pub(crate) fn set_profile(&self, profile: Profile) {
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    pub(crate) fn set_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    /// Record that frame-log entry `index` has been delivered. Must be called
    /// once per entry, in order, under the frame log lock.
    pub(crate) fn record_delivery(&self, index: usize) {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        let previous = self.position.swap(index, Ordering::SeqCst);
        debug_assert_eq!(previous + 1, index, "cursor must advance by one");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("profile", &self.profile())
            .field("position", &self.position())
            .field("logged_in", &self.logged_in())
            .field("closed", &self.is_closed())
            .finish()
    }
}
