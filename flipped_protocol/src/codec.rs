// Message encoding on top of `framing.rs`.
//
// A message is rendered as a JSON object holding its non-default fields plus
// the `"kind"` discriminator, then framed (compressed, length-prefixed). An
// all-default message is just `{"kind":"Accept"}` before compression.
//
// Decoding reverses that and validates against the closed kind table:
// unparseable text is `MalformedPayload`, an unrecognized discriminator is
// `UnknownKind`. Omitted fields read back as their schema defaults.

use std::io::{Read, Write};

use serde_json::Value;

use crate::error::{CodecError, Result};
use crate::framing::{encode_frame, read_frame, write_frame};
use crate::message::Message;
use crate::schema::{KIND_KEY, MessageKind};

/// JSON text form of `message`, before compression.
pub fn to_payload(message: &Message) -> Result<Vec<u8>> {
    let mut object = message.fields().clone();
    object.insert(KIND_KEY.to_owned(), Value::from(message.kind().name()));
    serde_json::to_vec(&Value::Object(object))
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))
}

/// Parse the JSON text form of a message.
pub fn from_payload(payload: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(CodecError::MalformedPayload(
            "message is not a JSON object".into(),
        ));
    };
    let kind_name = match object.remove(KIND_KEY) {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(CodecError::MalformedPayload(format!(
                "discriminator is not a string: {other}"
            )));
        }
        None => {
            return Err(CodecError::MalformedPayload(
                "missing kind discriminator".into(),
            ));
        }
    };
    let kind = MessageKind::from_name(&kind_name).ok_or(CodecError::UnknownKind(kind_name))?;
    Ok(Message::from_fields(kind, object))
}

/// Encode `message` into one complete wire frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    encode_frame(&to_payload(message)?)
}

/// Read and decode the next message from `reader`. Blocks until a whole
/// frame has arrived or the stream ends.
pub fn decode<R: Read>(reader: &mut R) -> Result<Message> {
    from_payload(&read_frame(reader)?)
}

/// Encode `message` and write it to `writer`, flushing afterwards.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    write_frame(writer, &to_payload(message)?)
}

/// Alias of `decode`, named to pair with `write_message`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    decode(reader)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::schema::FieldDefault;
    use crate::types::{Role, SessionId};

    fn roundtrip(message: &Message) -> Message {
        let wire = encode(message).unwrap();
        decode(&mut Cursor::new(wire)).unwrap()
    }

    /// A value guaranteed to differ from `default`.
    fn non_default(default: FieldDefault) -> Value {
        match default {
            FieldDefault::Null => Value::from(7),
            FieldDefault::Text(_) => Value::from("Ariadne"),
            FieldDefault::Role(_) => Value::from("player"),
        }
    }

    #[test]
    fn every_field_combination_roundtrips() {
        for kind in MessageKind::ALL {
            let fields = kind.fields();
            for mask in 0u32..(1 << fields.len()) {
                let mut message = Message::new(kind);
                for (i, spec) in fields.iter().enumerate() {
                    if mask & (1 << i) != 0 {
                        message.set(spec.name, non_default(spec.default));
                    }
                }
                assert_eq!(message.fields().len(), mask.count_ones() as usize);
                assert_eq!(roundtrip(&message), message, "{} mask {mask:b}", kind.name());
            }
        }
    }

    #[test]
    fn all_default_payload_is_only_discriminator() {
        for kind in MessageKind::ALL {
            let payload = to_payload(&Message::new(kind)).unwrap();
            let expected = format!(r#"{{"kind":"{}"}}"#, kind.name());
            assert_eq!(String::from_utf8(payload).unwrap(), expected);
        }
    }

    #[test]
    fn typed_messages_roundtrip() {
        let messages = [
            Message::challenge(Some("0.4.0"), Some("a1b2")),
            Message::login("GM", Role::Controller, Some(120), Some("0.4.0"), None),
            Message::accept(Some("GM (2)")),
            Message::frame(&[0, 1, 2, 250, 251, 252]),
            Message::story_named("Lost in the Labyrinth"),
            Message::sid_started(Some(7779)),
            Message::connected(SessionId(1), "GM", Role::Controller, None),
            Message::disconnected(SessionId(9)),
            Message::rename(SessionId(2), "Theseus"),
            Message::chat(Some(SessionId(2)), Some(SessionId(1)), "ready?"),
            Message::kick(SessionId(5), Some("spoilers")),
            Message::quit(None),
        ];
        for message in &messages {
            assert_eq!(&roundtrip(message), message);
        }
    }

    #[test]
    fn omitted_fields_decode_to_defaults() {
        let decoded = from_payload(br#"{"kind":"Connected","id":1}"#).unwrap();
        assert_eq!(decoded.id(), Some(SessionId(1)));
        assert_eq!(decoded.name(), "User");
        assert_eq!(decoded.role(), Role::Spectator);
        assert_eq!(decoded.time_limit(), None);
    }

    #[test]
    fn explicit_defaults_in_payload_are_suppressed() {
        let decoded =
            from_payload(br#"{"kind":"Login","name":"User","role":"spectator","password":null}"#)
                .unwrap();
        assert_eq!(decoded, Message::new(MessageKind::Login));
    }

    #[test]
    fn unknown_kind() {
        let err = from_payload(br#"{"kind":"Teleport"}"#).unwrap_err();
        assert!(
            matches!(err, CodecError::UnknownKind(ref name) if name == "Teleport"),
            "got {err:?}"
        );
    }

    #[test]
    fn malformed_payloads() {
        let payloads: [&[u8]; 4] = [
            b"not json",
            br#"[1, 2, 3]"#,
            br#"{"id":1}"#,
            br#"{"kind":5}"#,
        ];
        for payload in payloads {
            let err = from_payload(payload).unwrap_err();
            assert!(
                matches!(err, CodecError::MalformedPayload(_)),
                "{:?} gave {err:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn frame_bytes_survive_the_wire() {
        let data: Vec<u8> = (0..=255).cycle().take(3000).collect();
        let decoded = roundtrip(&Message::frame(&data));
        assert_eq!(decoded.frame_data().unwrap(), data);
    }

    #[test]
    fn write_then_read_sequence() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::reject()).unwrap();
        write_message(&mut wire, &Message::quit(Some("bye"))).unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_message(&mut cursor).unwrap(), Message::reject());
        assert_eq!(
            read_message(&mut cursor).unwrap().message(),
            Some("bye")
        );
        assert!(read_message(&mut cursor).unwrap_err().is_closed());
    }
}
