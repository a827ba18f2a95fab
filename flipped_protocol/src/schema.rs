// Static schema table for the closed set of message kinds.
//
// Every kind has an ordered list of named fields, each with a declared
// default. `message.rs` consults this table to fill omitted fields on read
// and to drop default-valued fields on write ("default suppression"), which
// keeps the common mostly-default messages (`Connected`, `Frame`) tiny before
// compression.
//
// Adding a kind means adding a `MessageKind` variant; every `match` over the
// enum (here, the relay server's dispatch and the client's dispatch) then
// fails to compile until it handles the new kind.

use serde_json::Value;

use crate::types::Role;

/// Default display name for users that did not pick one.
pub const DEFAULT_NAME: &str = "User";

/// Default story name, until the controller names it.
pub const DEFAULT_STORY_NAME: &str = "Story";

/// Discriminator key carrying the kind name in the serialized form.
pub const KIND_KEY: &str = "kind";

/// Closed set of message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Server → client on connect.
    Challenge,
    /// Client → server, answer to `Challenge`.
    Login,
    /// Server → client, login accepted.
    Accept,
    /// Server → client, login refused.
    Reject,
    /// One game frame (player → server → everyone else).
    Frame,
    /// Controller named the story.
    StoryNamed,
    /// Player started the story.
    StoryStarted,
    /// Controller started SiD; forwarded to the player only.
    SiDStarted,
    /// A peer has logged in.
    Connected,
    /// A peer has gone.
    Disconnected,
    /// A peer changed its name.
    Rename,
    /// Chat line, to everyone or to one peer.
    Chat,
    /// Player kicks a peer.
    Kick,
    /// Peer leaves.
    Quit,
}

/// Default value declared for a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldDefault {
    Null,
    Text(&'static str),
    Role(Role),
}

impl FieldDefault {
    /// The default as it would appear in the JSON field map.
    pub fn to_value(self) -> Value {
        match self {
            FieldDefault::Null => Value::Null,
            FieldDefault::Text(s) => Value::String(s.to_owned()),
            FieldDefault::Role(role) => Value::String(role.as_str().to_owned()),
        }
    }

    /// Whether `value` is this default (or null, which always means "unset").
    pub fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldDefault::Null, _) => false,
            (FieldDefault::Text(s), Value::String(v)) => s == v,
            (FieldDefault::Role(role), Value::String(v)) => role.as_str() == v,
            _ => false,
        }
    }
}

/// One named field of a kind's schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub default: FieldDefault,
}

const fn field(name: &'static str, default: FieldDefault) -> FieldSpec {
    FieldSpec { name, default }
}

const NULL: FieldDefault = FieldDefault::Null;
const USER: FieldDefault = FieldDefault::Text(DEFAULT_NAME);
const SPECTATOR: FieldDefault = FieldDefault::Role(Role::Spectator);

const CHALLENGE: &[FieldSpec] = &[field("version", NULL), field("password_seed", NULL)];
const LOGIN: &[FieldSpec] = &[
    field("name", USER),
    field("role", SPECTATOR),
    field("time_limit", NULL),
    field("version", NULL),
    field("password", NULL),
];
const ACCEPT: &[FieldSpec] = &[field("renamed_as", NULL)];
const FRAME: &[FieldSpec] = &[field("data", FieldDefault::Text(""))];
const STORY_NAMED: &[FieldSpec] = &[field("name", FieldDefault::Text(DEFAULT_STORY_NAME))];
const STORY_STARTED: &[FieldSpec] = &[field("started_at", NULL)];
const SID_STARTED: &[FieldSpec] = &[field("port", NULL)];
const CONNECTED: &[FieldSpec] = &[
    field("id", NULL),
    field("name", USER),
    field("role", SPECTATOR),
    field("time_limit", NULL),
];
const DISCONNECTED: &[FieldSpec] = &[field("id", NULL)];
const RENAME: &[FieldSpec] = &[field("id", NULL), field("name", USER)];
const CHAT: &[FieldSpec] = &[field("from", NULL), field("to", NULL), field("message", NULL)];
const KICK: &[FieldSpec] = &[field("id", NULL), field("message", NULL)];
const QUIT: &[FieldSpec] = &[field("message", NULL)];

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 14] = [
        MessageKind::Challenge,
        MessageKind::Login,
        MessageKind::Accept,
        MessageKind::Reject,
        MessageKind::Frame,
        MessageKind::StoryNamed,
        MessageKind::StoryStarted,
        MessageKind::SiDStarted,
        MessageKind::Connected,
        MessageKind::Disconnected,
        MessageKind::Rename,
        MessageKind::Chat,
        MessageKind::Kick,
        MessageKind::Quit,
    ];

    /// Discriminator value written under `KIND_KEY`.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Challenge => "Challenge",
            MessageKind::Login => "Login",
            MessageKind::Accept => "Accept",
            MessageKind::Reject => "Reject",
            MessageKind::Frame => "Frame",
            MessageKind::StoryNamed => "StoryNamed",
            MessageKind::StoryStarted => "StoryStarted",
            MessageKind::SiDStarted => "SiDStarted",
            MessageKind::Connected => "Connected",
            MessageKind::Disconnected => "Disconnected",
            MessageKind::Rename => "Rename",
            MessageKind::Chat => "Chat",
            MessageKind::Kick => "Kick",
            MessageKind::Quit => "Quit",
        }
    }

    /// Look up a discriminator value in the kind table.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Ordered field schema for this kind.
    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            MessageKind::Challenge => CHALLENGE,
            MessageKind::Login => LOGIN,
            MessageKind::Accept => ACCEPT,
            MessageKind::Reject => &[],
            MessageKind::Frame => FRAME,
            MessageKind::StoryNamed => STORY_NAMED,
            MessageKind::StoryStarted => STORY_STARTED,
            MessageKind::SiDStarted => SID_STARTED,
            MessageKind::Connected => CONNECTED,
            MessageKind::Disconnected => DISCONNECTED,
            MessageKind::Rename => RENAME,
            MessageKind::Chat => CHAT,
            MessageKind::Kick => KICK,
            MessageKind::Quit => QUIT,
        }
    }

    /// Schema entry for `field`, if this kind declares it.
    pub fn field(self, field: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|spec| spec.name == field)
    }
}
