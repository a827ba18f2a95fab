// Test-only spectate client for end-to-end relay tests.
//
// Wraps the real `RelayClient` (from `flipped_relay::client`) and gives it a
// synchronous, test-friendly API: blocking waits on events and on the
// client's view of the session (roster, story name), with a timeout so a
// broken relay fails the test instead of hanging it.
//
// The only test-specific code here is the waiting. All networking and
// protocol handling goes through the same code paths as a real client.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flipped_protocol::Role;
use flipped_relay::client::{ClientConfig, ClientEvent, RelayClient};

/// Default timeout for blocking waits.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between state checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test client with its received events buffered.
pub struct TestClient {
    client: RelayClient,
    frames: Vec<Vec<u8>>,
    story_starts: Vec<(String, DateTime<Utc>)>,
    closed: bool,
}

impl TestClient {
    /// Connect with default settings for the given name and role.
    pub fn connect(addr: SocketAddr, name: &str, role: Role) -> Self {
        Self::connect_with(
            addr,
            ClientConfig {
                name: name.into(),
                role,
                ..ClientConfig::default()
            },
        )
    }

    pub fn connect_with(addr: SocketAddr, config: ClientConfig) -> Self {
        let host = addr.ip().to_string();
        let client = RelayClient::connect(&host, addr.port(), config)
            .expect("TestClient::connect failed");
        Self {
            client,
            frames: Vec::new(),
            story_starts: Vec::new(),
            closed: false,
        }
    }

    /// The wrapped client, for sending and for inspecting session state.
    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    /// Move every queued event into the buffers.
    pub fn pump(&mut self) {
        for event in self.client.poll() {
            match event {
                ClientEvent::FrameReceived(data) => self.frames.push(data),
                ClientEvent::StoryStarted { name, started_at } => {
                    self.story_starts.push((name, started_at));
                }
                ClientEvent::Closed => self.closed = true,
            }
        }
    }

    /// Block until `condition` holds, pumping events meanwhile.
    pub fn wait_until(&mut self, what: &str, condition: impl Fn(&Self) -> bool) {
        let start = Instant::now();
        loop {
            self.pump();
            if condition(self) {
                return;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until the roster holds `count` sessions, this one included.
    pub fn wait_for_peers(&mut self, count: usize) {
        self.wait_until(&format!("{count} peers"), |c| {
            c.client.peers().len() == count
        });
    }

    /// Block until the story name is `name`.
    pub fn wait_for_story_name(&mut self, name: &str) {
        self.wait_until(&format!("story name '{name}'"), |c| {
            c.client.story_name() == name
        });
    }

    /// Block until at least `count` frames have arrived; returns them all.
    pub fn wait_for_frames(&mut self, count: usize) -> &[Vec<u8>] {
        self.wait_until(&format!("{count} frames"), |c| c.frames.len() >= count);
        &self.frames
    }

    /// Block until a story start arrives; returns the first one.
    pub fn wait_for_story_start(&mut self) -> (String, DateTime<Utc>) {
        self.wait_until("story start", |c| !c.story_starts.is_empty());
        self.story_starts[0].clone()
    }

    /// Block until the connection is reported closed.
    pub fn wait_for_close(&mut self) {
        self.wait_until("connection close", |c| c.closed);
    }

    /// Frames received so far.
    pub fn frames(&mut self) -> &[Vec<u8>] {
        self.pump();
        &self.frames
    }
}
