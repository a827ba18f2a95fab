// Protocol messages for spectate sessions.
//
// A `Message` is a kind tag plus a map of the fields that differ from the
// kind's schema defaults (see `schema.rs`). Fields equal to their default, or
// null, are never stored, so the map *is* the default-suppressed wire form
// and two messages are equal exactly when their kinds and non-default fields
// are. Reading an absent field yields the schema default.
//
// Typed constructors (`Message::connected`, `Message::frame`, ...) and
// accessors (`id()`, `role()`, `frame_data()`, ...) cover everything the relay
// and client need; `set` / `get` give raw access by field name.
//
// Frame data is binary, so `Frame.data` holds base64 text. `Message::frame`
// and `Message::frame_data` encode and decode it transparently.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{CodecError, Result};
use crate::schema::{DEFAULT_NAME, FieldDefault, MessageKind};
use crate::types::{Role, SessionId};

/// One protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    kind: MessageKind,
    fields: Map<String, Value>,
}

impl Message {
    /// A message of `kind` with every field at its default.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    /// Build from a decoded field map. Fields outside the kind's schema are
    /// dropped and defaults suppressed, as if each was passed to `set`.
    pub fn from_fields(kind: MessageKind, fields: Map<String, Value>) -> Self {
        let mut message = Self::new(kind);
        for (field, value) in fields {
            message.set(&field, value);
        }
        message
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The non-default fields, i.e. exactly what goes on the wire.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Set a field. A null or default value clears it. Names the kind does
    /// not declare are ignored.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        let value = value.into();
        let Some(spec) = self.kind.field(field) else {
            log::debug!("ignoring field {field:?} not declared by {}", self.kind.name());
            return;
        };
        if spec.default.matches(&value) {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_owned(), value);
        }
    }

    /// Builder form of `set`.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Current value of a field, falling back to its schema default. Fields
    /// the kind does not declare read as null.
    pub fn get(&self, field: &str) -> Value {
        match self.fields.get(field) {
            Some(value) => value.clone(),
            None => self
                .kind
                .field(field)
                .map_or(Value::Null, |spec| spec.default.to_value()),
        }
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => None,
            None => match self.kind.field(field)?.default {
                FieldDefault::Text(s) => Some(s),
                FieldDefault::Role(role) => Some(role.as_str()),
                FieldDefault::Null => None,
            },
        }
    }

    fn u64_field(&self, field: &str) -> Option<u64> {
        self.fields.get(field).and_then(Value::as_u64)
    }

    fn id_field(&self, field: &str) -> Option<SessionId> {
        self.u64_field(field)
            .and_then(|id| u32::try_from(id).ok())
            .map(SessionId)
    }
}

// Constructors, one per kind.
impl Message {
    pub fn challenge(version: Option<&str>, password_seed: Option<&str>) -> Self {
        Self::new(MessageKind::Challenge)
            .with("version", version)
            .with("password_seed", password_seed)
    }

    pub fn login(
        name: &str,
        role: Role,
        time_limit: Option<u32>,
        version: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        Self::new(MessageKind::Login)
            .with("name", name)
            .with("role", role.as_str())
            .with("time_limit", time_limit)
            .with("version", version)
            .with("password", password)
    }

    pub fn accept(renamed_as: Option<&str>) -> Self {
        Self::new(MessageKind::Accept).with("renamed_as", renamed_as)
    }

    pub fn reject() -> Self {
        Self::new(MessageKind::Reject)
    }

    /// A frame carrying raw image bytes (stored base64-encoded).
    pub fn frame(data: &[u8]) -> Self {
        Self::new(MessageKind::Frame).with("data", BASE64.encode(data))
    }

    pub fn story_named(name: &str) -> Self {
        Self::new(MessageKind::StoryNamed).with("name", name)
    }

    pub fn story_started(started_at: DateTime<Utc>) -> Self {
        Self::new(MessageKind::StoryStarted).with(
            "started_at",
            started_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
    }

    pub fn sid_started(port: Option<u16>) -> Self {
        Self::new(MessageKind::SiDStarted).with("port", port)
    }

    pub fn connected(id: SessionId, name: &str, role: Role, time_limit: Option<u32>) -> Self {
        Self::new(MessageKind::Connected)
            .with("id", id.0)
            .with("name", name)
            .with("role", role.as_str())
            .with("time_limit", time_limit)
    }

    pub fn disconnected(id: SessionId) -> Self {
        Self::new(MessageKind::Disconnected).with("id", id.0)
    }

    pub fn rename(id: SessionId, name: &str) -> Self {
        Self::new(MessageKind::Rename).with("id", id.0).with("name", name)
    }

    pub fn chat(from: Option<SessionId>, to: Option<SessionId>, message: &str) -> Self {
        Self::new(MessageKind::Chat)
            .with("from", from.map(|id| id.0))
            .with("to", to.map(|id| id.0))
            .with("message", message)
    }

    pub fn kick(id: SessionId, message: Option<&str>) -> Self {
        Self::new(MessageKind::Kick)
            .with("id", id.0)
            .with("message", message)
    }

    pub fn quit(message: Option<&str>) -> Self {
        Self::new(MessageKind::Quit).with("message", message)
    }
}

// Typed accessors. Each reads the field of that name, so they are only
// meaningful on kinds that declare it; elsewhere they return the null case.
impl Message {
    /// `id` of Connected, Disconnected, Rename, Kick.
    pub fn id(&self) -> Option<SessionId> {
        self.id_field("id")
    }

    /// `name` of Login, Connected, Rename ("User" by default), StoryNamed
    /// ("Story" by default).
    pub fn name(&self) -> &str {
        self.str_field("name").unwrap_or(DEFAULT_NAME)
    }

    /// `role` of Login and Connected. Unknown role names read as spectator.
    pub fn role(&self) -> Role {
        self.str_field("role")
            .and_then(Role::parse)
            .unwrap_or_default()
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

    /// `time_limit` of Login and Connected, in seconds.
    pub fn time_limit(&self) -> Option<u32> {
        self.u64_field("time_limit")
            .and_then(|limit| u32::try_from(limit).ok())
    }

    /// `version` of Challenge and Login.
    pub fn version(&self) -> Option<&str> {
        self.str_field("version")
    }

    /// `password_seed` of Challenge.
    pub fn password_seed(&self) -> Option<&str> {
        self.str_field("password_seed")
    }

    /// A Challenge with a seed asks the client for a password.
    pub fn requires_password(&self) -> bool {
        self.password_seed().is_some()
    }

    /// `password` of Login.
    pub fn password(&self) -> Option<&str> {
        self.str_field("password")
    }

    /// `renamed_as` of Accept.
    pub fn renamed_as(&self) -> Option<&str> {
        self.str_field("renamed_as")
    }

    /// Raw frame bytes of a Frame (decoded from base64).
    pub fn frame_data(&self) -> Result<Vec<u8>> {
        let text = self.str_field("data").unwrap_or_default();
        BASE64
            .decode(text)
            .map_err(|e| CodecError::MalformedPayload(format!("frame data is not base64: {e}")))
    }

    /// `started_at` of StoryStarted. Unparseable timestamps read as `None`.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let text = self.str_field("started_at")?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// `port` of SiDStarted.
    pub fn port(&self) -> Option<u16> {
        self.u64_field("port").and_then(|port| u16::try_from(port).ok())
    }

    /// `from` of Chat.
    pub fn sender(&self) -> Option<SessionId> {
        self.id_field("from")
    }

    /// `to` of Chat, if it is a valid session id.
    pub fn recipient(&self) -> Option<SessionId> {
        self.id_field("to")
    }

    /// Whether Chat names a recipient at all. Only an unset `to` means
    /// "everyone else"; a `to` that is not a valid id still addresses nobody.
    pub fn is_addressed(&self) -> bool {
        self.fields.contains_key("to")
    }

    /// `message` of Chat, Kick, Quit.
    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn defaults_are_not_stored() {
        let msg = Message::connected(SessionId(3), DEFAULT_NAME, Role::Spectator, None);
        assert_eq!(msg.fields().len(), 1);
        assert_eq!(msg.get("name"), Value::from("User"));
        assert_eq!(msg.get("role"), Value::from("spectator"));
        assert_eq!(msg.get("time_limit"), Value::Null);
    }

    #[test]
    fn setting_default_clears_field() {
        let mut msg = Message::login("GM", Role::Controller, Some(60), None, None);
        assert_eq!(msg.name(), "GM");
        msg.set("name", "User");
        msg.set("time_limit", Value::Null);
        assert!(!msg.fields().contains_key("name"));
        assert!(!msg.fields().contains_key("time_limit"));
        assert_eq!(msg.role(), Role::Controller);
    }

    #[test]
    fn undeclared_fields_are_ignored() {
        let msg = Message::reject().with("reason", "nope");
        assert!(msg.fields().is_empty());
        assert_eq!(msg.get("reason"), Value::Null);
    }

    #[test]
    fn equality_ignores_explicit_defaults() {
        let a = Message::new(MessageKind::StoryNamed);
        let b = Message::story_named("Story");
        assert_eq!(a, b);
        assert_ne!(a, Message::story_named("The Heist"));
        assert_ne!(Message::new(MessageKind::Accept), Message::new(MessageKind::Reject));
    }

    #[test]
    fn frame_data_is_base64() {
        let bytes = vec![0u8, 159, 146, 150, 255];
        let msg = Message::frame(&bytes);
        assert_eq!(msg.get("data"), Value::from("AJ+Slv8="));
        assert_eq!(msg.frame_data().unwrap(), bytes);
    }

    #[test]
    fn empty_frame_is_all_default() {
        let msg = Message::frame(&[]);
        assert!(msg.fields().is_empty());
        assert_eq!(msg.frame_data().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn bad_frame_data_is_malformed() {
        let msg = Message::new(MessageKind::Frame).with("data", "%%%");
        assert!(matches!(
            msg.frame_data(),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn story_started_keeps_timestamp() {
        let at = Utc.with_ymd_and_hms(2009, 7, 14, 21, 30, 5).unwrap();
        let msg = Message::story_started(at);
        assert_eq!(msg.started_at(), Some(at));
        assert_eq!(Message::new(MessageKind::StoryStarted).started_at(), None);
    }

    #[test]
    fn chat_addressing() {
        let msg = Message::chat(Some(SessionId(1)), None, "hi all");
        assert_eq!(msg.sender(), Some(SessionId(1)));
        assert_eq!(msg.recipient(), None);
        assert_eq!(msg.message(), Some("hi all"));

        let direct = Message::chat(Some(SessionId(1)), Some(SessionId(4)), "psst");
        assert_eq!(direct.recipient(), Some(SessionId(4)));
        assert!(direct.is_addressed());
        assert!(!msg.is_addressed());
    }

    #[test]
    fn invalid_recipient_is_still_addressed() {
        for to in [Value::from(4_294_967_297u64), Value::from(-1), Value::from("3")] {
            let msg = Message::chat(None, None, "anyone?").with("to", to);
            assert_eq!(msg.recipient(), None);
            assert!(msg.is_addressed());
        }
        // An explicit null is the default: unaddressed.
        let msg = Message::chat(None, None, "all").with("to", Value::Null);
        assert!(!msg.is_addressed());
    }

    #[test]
    fn challenge_password_request() {
        assert!(!Message::challenge(Some("0.4.0"), None).requires_password());
        assert!(Message::challenge(None, Some("f00d")).requires_password());
    }

    #[test]
    fn unknown_role_reads_as_spectator() {
        let msg = Message::new(MessageKind::Connected).with("role", "referee");
        assert_eq!(msg.role(), Role::Spectator);
        assert!(msg.is_spectator());
    }

    #[test]
    fn story_named_default_name() {
        assert_eq!(Message::new(MessageKind::StoryNamed).name(), "Story");
        assert_eq!(Message::new(MessageKind::Rename).name(), "User");
    }
}
