//! Wire codec for the update channel
//!
//! Payloads are self-describing JSON documents written back-to-back, one per
//! line; each request/response turn is terminated by the one-byte ack. The
//! same payload shape travels the browser refresh channel with a `"type"` tag
//! so the overlay can dispatch on it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ModuleUpdate;

/// Tag carried by update payloads on the browser refresh channel only.
pub const DELTA_MESSAGE_TYPE: &str = "HotReloadDelta";

/// Tag carried by diagnostics messages on the browser refresh channel.
pub const DIAGNOSTICS_MESSAGE_TYPE: &str = "HotReloadDiagnosticsv1";

/// Errors raised while encoding or decoding wire documents.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty delta bytes for module {0}")]
    EmptyDelta(Uuid),
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// One module delta on the wire: RFC 4122 module ID plus base64-encoded
/// metadata and intermediate-code bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDelta {
    pub module_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub metadata_delta: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub il_delta: Vec<u8>,
}

impl From<ModuleUpdate> for UpdateDelta {
    fn from(update: ModuleUpdate) -> Self {
        Self {
            module_id: update.module_id,
            metadata_delta: update.metadata_delta,
            il_delta: update.il_delta,
        }
    }
}

impl From<UpdateDelta> for ModuleUpdate {
    fn from(delta: UpdateDelta) -> Self {
        Self {
            module_id: delta.module_id,
            metadata_delta: delta.metadata_delta,
            il_delta: delta.il_delta,
        }
    }
}

/// The update payload sent to the agent (pipe) or the browser overlay
/// (refresh channel, with the `"type"` tag present).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    pub deltas: Vec<UpdateDelta>,
}

impl UpdatePayload {
    /// Payload shape for the pipe channel (no type tag).
    pub fn for_pipe(updates: &[ModuleUpdate]) -> Self {
        Self {
            kind: None,
            deltas: updates.iter().cloned().map(UpdateDelta::from).collect(),
        }
    }

    /// Payload shape for the browser refresh channel.
    pub fn for_browser(updates: &[ModuleUpdate]) -> Self {
        Self {
            kind: Some(DELTA_MESSAGE_TYPE.to_string()),
            deltas: updates.iter().cloned().map(UpdateDelta::from).collect(),
        }
    }

    /// A delta whose decoded byte arrays are empty alongside a non-nil module
    /// ID is a fatal protocol error for the batch.
    pub fn validate(&self) -> Result<(), WireError> {
        for delta in &self.deltas {
            if !delta.module_id.is_nil()
                && (delta.metadata_delta.is_empty() || delta.il_delta.is_empty())
            {
                return Err(WireError::EmptyDelta(delta.module_id));
            }
        }
        Ok(())
    }

    pub fn into_updates(self) -> Vec<ModuleUpdate> {
        self.deltas.into_iter().map(ModuleUpdate::from).collect()
    }
}

/// Diagnostics forwarded to the browser overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub diagnostics: Vec<String>,
}

impl DiagnosticsMessage {
    pub fn new(diagnostics: Vec<String>) -> Self {
        Self {
            kind: DIAGNOSTICS_MESSAGE_TYPE.to_string(),
            diagnostics,
        }
    }
}

/// Serialize one wire document, newline-terminated for the byte stream.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, WireError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parse and validate one update payload document.
pub fn decode_payload(line: &str) -> Result<UpdatePayload, WireError> {
    let payload: UpdatePayload = serde_json::from_str(line)?;
    payload.validate()?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> ModuleUpdate {
        ModuleUpdate {
            module_id: Uuid::parse_str("6f2c1a30-9f7d-4e4e-8c1a-2b9d1e3f5a70").unwrap(),
            metadata_delta: vec![0x01, 0x02, 0x03],
            il_delta: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn payload_round_trips_bitwise() {
        let update = sample_update();
        let line = encode_line(&UpdatePayload::for_pipe(&[update.clone()])).unwrap();
        let decoded = decode_payload(line.trim_end()).unwrap().into_updates();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].module_id, update.module_id);
        assert_eq!(decoded[0].metadata_delta, update.metadata_delta);
        assert_eq!(decoded[0].il_delta, update.il_delta);
    }

    #[test]
    fn pipe_payload_omits_type_tag() {
        let line = encode_line(&UpdatePayload::for_pipe(&[sample_update()])).unwrap();
        assert!(!line.contains("\"type\""));

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let delta = &value["deltas"][0];
        assert!(delta.get("moduleId").is_some());
        assert!(delta.get("metadataDelta").is_some());
        assert!(delta.get("ilDelta").is_some());
    }

    #[test]
    fn browser_payload_carries_type_tag() {
        let line = encode_line(&UpdatePayload::for_browser(&[sample_update()])).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], DELTA_MESSAGE_TYPE);
    }

    #[test]
    fn delta_bytes_are_base64_strings() {
        let line = encode_line(&UpdatePayload::for_pipe(&[sample_update()])).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["deltas"][0]["ilDelta"], "3q2+7w==");
    }

    #[test]
    fn empty_delta_with_non_nil_module_is_rejected() {
        let module_id = Uuid::new_v4();
        let line = format!(
            r#"{{"deltas":[{{"moduleId":"{module_id}","metadataDelta":"","ilDelta":""}}]}}"#
        );
        match decode_payload(&line) {
            Err(WireError::EmptyDelta(id)) => assert_eq!(id, module_id),
            other => panic!("expected EmptyDelta, got {other:?}"),
        }
    }

    #[test]
    fn empty_delta_with_nil_module_passes_validation() {
        let line = format!(
            r#"{{"deltas":[{{"moduleId":"{}","metadataDelta":"","ilDelta":""}}]}}"#,
            Uuid::nil()
        );
        assert!(decode_payload(&line).is_ok());
    }

    #[test]
    fn garbage_is_a_malformed_payload() {
        assert!(matches!(
            decode_payload("not json"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn diagnostics_message_is_tagged() {
        let msg = DiagnosticsMessage::new(vec!["WebApp: error: CS0103".to_string()]);
        let line = encode_line(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], DIAGNOSTICS_MESSAGE_TYPE);
        assert_eq!(value["diagnostics"][0], "WebApp: error: CS0103");
    }
}
