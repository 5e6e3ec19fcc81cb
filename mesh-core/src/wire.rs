//! Codec: bincode envelope on send; bincode, then JSON, then plain text on receive.

use bincode::Options;
use serde::Deserialize;
use serde_json::Value;

use crate::protocol::{Envelope, Payload, NO_COMMAND, UNKNOWN_SENDER};

/// Largest encoded envelope accepted by either direction.
pub const MAX_ENVELOPE_LEN: u64 = 16 * 1024 * 1024; // 16 MiB

fn binary_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENVELOPE_LEN)
        .reject_trailing_bytes()
}

/// Encode an envelope with the compact binary codec. Identifiers are truncated first.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let envelope = envelope.clone().truncated();
    binary_options()
        .serialize(&envelope)
        .map_err(EncodeError::Encode)
}

/// Error encoding an envelope (bincode failure or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Decode a raw transport payload. Never fails: malformed input degrades to a text envelope.
pub fn decode(raw: &[u8]) -> Envelope {
    if let Ok(env) = decode_binary(raw) {
        return env;
    }
    if let Ok(env) = decode_json(raw) {
        return env;
    }
    Envelope::text_fallback(raw)
}

/// Error decoding a payload in one of the structured formats.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("binary decode error: {0}")]
    Binary(#[from] bincode::Error),
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn decode_binary(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let env: Envelope = binary_options().deserialize(raw)?;
    Ok(env.truncated())
}

/// JSON envelope. Accepts current keys and the legacy long names.
#[derive(Deserialize)]
struct JsonEnvelope {
    #[serde(alias = "sender_id")]
    id: Option<String>,
    #[serde(alias = "command")]
    cmd: Option<String>,
    #[serde(alias = "message", default)]
    msg: Value,
    #[serde(default)]
    timestamp: Value,
}

pub fn decode_json(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let json: JsonEnvelope = serde_json::from_slice(raw)?;
    let env = Envelope {
        sender_id: json.id.unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
        command: json.cmd.unwrap_or_else(|| NO_COMMAND.to_string()),
        message: json_payload(json.msg),
        timestamp: json.timestamp.as_i64(),
    };
    Ok(env.truncated())
}

fn json_payload(value: Value) -> Payload {
    match value {
        Value::Null => Payload::default(),
        Value::String(s) => Payload::Text(s),
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect();
            match bytes {
                Some(b) => Payload::Bytes(b),
                None => Payload::Text(Value::Array(items).to_string()),
            }
        }
        other => Payload::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TEXT_MESSAGE;

    #[test]
    fn roundtrip_binary_message() {
        let bytes: Vec<u8> = (0..=255).collect();
        let env = Envelope::new("esp32_quarto", "ap_t", bytes.clone()).with_timestamp(42);
        let decoded = decode(&encode(&env).unwrap());
        assert_eq!(decoded, env);
        assert_eq!(decoded.message.as_bytes(), &bytes[..]);
    }

    #[test]
    fn encode_truncates_identifiers() {
        let env = Envelope {
            sender_id: "controller_main_unit".into(),
            command: "temperature_report".into(),
            message: Payload::from("23.5"),
            timestamp: None,
        };
        let decoded = decode(&encode(&env).unwrap());
        assert_eq!(decoded.sender_id, "controller_m");
        assert_eq!(decoded.command, "temperature_");
        assert_eq!(decoded.message, Payload::from("23.5"));
    }

    #[test]
    fn decode_json_current_keys() {
        let raw = br#"{"id":"esp32_quarto","cmd":"ligar_luz","msg":"true","timestamp":1700000000}"#;
        let env = decode(raw);
        assert_eq!(env.sender_id, "esp32_quarto");
        assert_eq!(env.command, "ligar_luz");
        assert_eq!(env.message, Payload::from("true"));
        assert_eq!(env.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn decode_json_legacy_keys() {
        let raw = br#"{"sender_id":"raspberry_pi","command":"ping","message":""}"#;
        let env = decode(raw);
        assert_eq!(env.sender_id, "raspberry_pi");
        assert_eq!(env.command, "ping");
        assert_eq!(env.timestamp, None);
    }

    #[test]
    fn decode_json_truncates_identifiers() {
        let raw = br#"{"id":"sensor_in_the_garden","cmd":"temperatura_report"}"#;
        let env = decode(raw);
        assert_eq!(env.sender_id, "sensor_in_th");
        assert_eq!(env.command, "temperatura_");
    }

    #[test]
    fn decode_json_defaults_missing_fields() {
        let env = decode(br#"{"msg":"x"}"#);
        assert_eq!(env.sender_id, UNKNOWN_SENDER);
        assert_eq!(env.command, NO_COMMAND);
    }

    #[test]
    fn decode_json_object_message_kept_as_text() {
        let env = decode(br#"{"id":"a","cmd":"b","msg":{"valor":23.5}}"#);
        assert_eq!(env.message, Payload::Text(r#"{"valor":23.5}"#.into()));
    }

    #[test]
    fn decode_json_byte_array_message() {
        let env = decode(br#"{"id":"a","cmd":"b","msg":[1,2,255]}"#);
        assert_eq!(env.message, Payload::Bytes(vec![1, 2, 255]));
    }

    #[test]
    fn decode_plain_text_falls_back() {
        let env = decode(b"just some text");
        assert_eq!(env.sender_id, UNKNOWN_SENDER);
        assert_eq!(env.command, TEXT_MESSAGE);
        assert_eq!(env.message, Payload::from("just some text"));
    }

    #[test]
    fn decode_rejects_trailing_bytes_in_binary() {
        let env = Envelope::new("a", "b", "c");
        let mut frame = encode(&env).unwrap();
        frame.push(0);
        assert!(decode_binary(&frame).is_err());
        // Still yields an envelope through the fallback chain.
        assert_eq!(decode(&frame).command, TEXT_MESSAGE);
    }

    #[test]
    fn decode_empty_payload() {
        let env = decode(b"");
        assert_eq!(env.command, TEXT_MESSAGE);
        assert!(env.message.is_empty());
    }
}
