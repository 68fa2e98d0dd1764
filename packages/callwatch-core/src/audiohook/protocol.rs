//! AudioHook control-message types and media negotiation.
//!
//! The protocol is JSON control messages plus binary audio frames over one
//! websocket. Dynamic dispatch on `type` becomes tagged variants with total
//! matching; unknown types surface as parse errors that the listener logs
//! and drops.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::AudioEncoding;

/// Inbound control messages from the provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngressMessage {
    Open {
        id: String,
        #[serde(default)]
        seq: u64,
        parameters: OpenParameters,
    },
    Ping {
        id: String,
        #[serde(default)]
        seq: u64,
    },
    Event {
        id: String,
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        parameters: Value,
    },
    Close {
        id: String,
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        parameters: Value,
    },
}

/// Parameters of the `open` message.
#[derive(Debug, Deserialize)]
pub struct OpenParameters {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(default)]
    pub participant: Value,
    #[serde(default)]
    pub media: Vec<MediaOffer>,
}

/// One media format offered during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaOffer {
    #[serde(rename = "type", default = "default_media_type")]
    pub kind: String,
    pub format: String,
    pub rate: u32,
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_media_type() -> String {
    "audio".to_string()
}

impl MediaOffer {
    /// Parses the offer's codec tag.
    pub fn encoding(&self) -> Option<AudioEncoding> {
        AudioEncoding::parse(&self.format).ok()
    }
}

/// Outbound control messages to the provider.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EgressMessage {
    Opened {
        id: String,
        seq: u64,
        parameters: OpenedParameters,
    },
    Pong {
        id: String,
        seq: u64,
    },
    Closed {
        id: String,
        seq: u64,
    },
}

/// Parameters of the `opened` acknowledgement.
#[derive(Debug, Serialize)]
pub struct OpenedParameters {
    /// The single media format we accepted.
    pub media: Vec<MediaOffer>,
    #[serde(rename = "startPaused")]
    pub start_paused: bool,
}

/// Picks the preferred media offer: L16 16 kHz, then PCMU 8 kHz, then
/// PCMA 8 kHz; any other decodable offer ranks behind those.
pub fn select_media(offers: &[MediaOffer]) -> Option<&MediaOffer> {
    offers
        .iter()
        .filter(|o| o.kind == "audio" && o.encoding().is_some())
        .min_by_key(|o| preference_rank(o))
}

fn preference_rank(offer: &MediaOffer) -> u32 {
    match (offer.encoding(), offer.rate) {
        (Some(AudioEncoding::L16), 16_000) => 0,
        (Some(AudioEncoding::Pcmu), 8_000) => 1,
        (Some(AudioEncoding::Pcma), 8_000) => 2,
        (Some(AudioEncoding::L16), _) => 3,
        (Some(AudioEncoding::Pcmu), _) => 4,
        (Some(AudioEncoding::Pcma), _) => 5,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(format: &str, rate: u32, channels: &[&str]) -> MediaOffer {
        MediaOffer {
            kind: "audio".into(),
            format: format.into(),
            rate,
            channels: channels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn open_message_parses_provider_shape() {
        let raw = r#"{
            "type": "open",
            "id": "msg-1",
            "seq": 1,
            "parameters": {
                "conversationId": "conv-42",
                "participant": {"ani": "+15550100"},
                "media": [
                    {"type": "audio", "format": "PCMU", "rate": 8000,
                     "channels": ["external", "internal"]}
                ]
            }
        }"#;
        match serde_json::from_str::<IngressMessage>(raw).unwrap() {
            IngressMessage::Open { id, parameters, .. } => {
                assert_eq!(id, "msg-1");
                assert_eq!(parameters.conversation_id, "conv-42");
                assert_eq!(parameters.media.len(), 1);
                assert_eq!(
                    parameters.media[0].encoding(),
                    Some(AudioEncoding::Pcmu)
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_type_is_a_parse_error() {
        let raw = r#"{"type": "reconnect", "id": "x"}"#;
        assert!(serde_json::from_str::<IngressMessage>(raw).is_err());
    }

    #[test]
    fn negotiation_prefers_l16_at_16k() {
        let offers = vec![
            offer("PCMU", 8000, &["external", "internal"]),
            offer("L16", 16_000, &["external", "internal"]),
            offer("PCMA", 8000, &["external", "internal"]),
        ];
        assert_eq!(select_media(&offers).unwrap().format, "L16");
    }

    #[test]
    fn negotiation_falls_back_to_pcmu_then_pcma() {
        let offers = vec![
            offer("PCMA", 8000, &["external"]),
            offer("PCMU", 8000, &["external"]),
        ];
        assert_eq!(select_media(&offers).unwrap().format, "PCMU");

        let offers = vec![offer("PCMA", 8000, &["external"])];
        assert_eq!(select_media(&offers).unwrap().format, "PCMA");
    }

    #[test]
    fn negotiation_skips_undecodable_offers() {
        let offers = vec![
            offer("opus", 48_000, &["external"]),
            offer("PCMA", 8000, &["external"]),
        ];
        assert_eq!(select_media(&offers).unwrap().format, "PCMA");

        let only_opus = vec![offer("opus", 48_000, &["external"])];
        assert!(select_media(&only_opus).is_none());
    }

    #[test]
    fn pong_serializes_with_matching_id() {
        let json = serde_json::to_value(EgressMessage::Pong {
            id: "msg-9".into(),
            seq: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["id"], "msg-9");
    }
}
