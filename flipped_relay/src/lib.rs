// flipped_relay — spectate relay for Flipped.
//
// One player streams game frames, one controller drives the story, and any
// number of spectators watch. The relay server fans the player's frames out
// to everyone else and replays the full history to late joiners before they
// see live frames.
//
// Module overview:
// - `session.rs`:   `Session`, one connected peer: identity, profile, replay
//                   cursor, synchronized send, idempotent close.
// - `registry.rs`:  `Registry` (connected sessions) and `FrameLog`
//                   (append-only frame history), each behind its own lock,
//                   Registry always taken first.
// - `server.rs`:    TCP listener, one thread per connection: handshake, join
//                   procedure, message dispatch, disconnect broadcast.
// - `client.rs`:    `RelayClient`, the peer side: handshake responses, roster
//                   and story tracking, frame/story events for its owner.
//
// Dependencies: `flipped_protocol` (message kinds, codec, framing). Plain
// `std::net` with blocking I/O and OS threads; no async runtime.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// game process via the library API (`start_relay`).

pub mod client;
pub mod registry;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientError, ClientEvent, PeerInfo, RelayClient};
pub use server::{RelayConfig, RelayHandle, SessionErrorPolicy, start_relay};
