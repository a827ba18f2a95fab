// flipped_protocol — wire protocol for Flipped spectate sessions.
//
// This crate defines the message kinds, their field schemas, and the framing
// used by the relay server (`flipped_relay::server`) and its clients
// (`flipped_relay::client`) to talk over TCP. It is shared by both sides and
// knows nothing about sockets, threads or sessions.
//
// Module overview:
// - `types.rs`:    `SessionId` and `Role`.
// - `schema.rs`:   The closed `MessageKind` set and the static table of each
//                  kind's ordered fields and their defaults.
// - `message.rs`:  `Message` (kind + non-default fields), typed constructors
//                  and accessors, base64 handling of frame data.
// - `framing.rs`:  4-byte big-endian length prefix + zlib block over any
//                  `Read`/`Write`.
// - `codec.rs`:    Message <-> JSON text <-> frame.
// - `error.rs`:    `CodecError`.
//
// Design decisions:
// - **Default suppression.** Only non-default fields go on the wire; decode
//   restores the rest from the schema. Most `Connected`/`Frame` traffic is a
//   handful of bytes before compression.
// - **Self-describing JSON, compressed.** Peers written against other
//   versions can still parse what they receive; zlib recovers the size.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`, for
//   blocking TCP streams and buffered wrappers alike.

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod schema;
pub mod types;

pub use codec::{decode, encode, read_message, write_message};
pub use error::CodecError;
pub use framing::{MAX_MESSAGE_SIZE, read_frame, write_frame};
pub use message::Message;
pub use schema::{DEFAULT_NAME, DEFAULT_STORY_NAME, MessageKind};
pub use types::{Role, SessionId};
