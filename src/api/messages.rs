// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! JSON frames exchanged over `/ws`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceDescriptor;
use crate::procscan::ProcessSnapshot;
use crate::sampler::MetricsSnapshot;

/// Every frame the server sends. The variant name becomes the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        interval_ms: u64,
        gpus: Vec<DeviceDescriptor>,
        features: BTreeMap<String, bool>,
    },
    Stats(MetricsSnapshot),
    Procs(ProcessSnapshot),
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Switch to `gpu_id`; `None` asks for the default device.
    Subscribe { gpu_id: Option<String> },
    Ping,
    Unknown(String),
}

/// Why an inbound frame was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not a JSON object carrying a string `type`. Ignored by sessions.
    #[error("invalid message")]
    Malformed,

    /// A `subscribe` frame whose fields do not decode. Reported to the client.
    #[error("invalid subscribe payload")]
    InvalidSubscribe,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct SubscribePayload {
    #[serde(default, alias = "device_id")]
    gpu_id: Option<String>,
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
    match envelope.kind.as_str() {
        "subscribe" => {
            let payload: SubscribePayload =
                serde_json::from_str(text).map_err(|_| ProtocolError::InvalidSubscribe)?;
            let gpu_id = payload
                .gpu_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
            Ok(ClientMessage::Subscribe { gpu_id })
        }
        "ping" => Ok(ClientMessage::Ping),
        _ => Ok(ClientMessage::Unknown(envelope.kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procscan::Capabilities;
    use crate::sampler::Metrics;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    #[test]
    fn test_hello_shape() {
        let hello = ServerMessage::Hello {
            interval_ms: 1000,
            gpus: vec![DeviceDescriptor {
                id: "card0".into(),
                pci: "0000:03:00.0".into(),
                pci_id: "1002:73bf".into(),
                name: "Navi 21".into(),
                render_node: "/dev/dri/renderD128".into(),
            }],
            features: BTreeMap::from([("procs".to_string(), true)]),
        };
        let value: Value = serde_json::from_str(&hello.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["interval_ms"], 1000);
        assert_eq!(value["gpus"][0]["id"], "card0");
        assert_eq!(value["features"]["procs"], true);
    }

    #[test]
    fn test_stats_and_procs_are_flattened() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let stats = ServerMessage::Stats(MetricsSnapshot::new("card0", ts, Metrics::default()));
        let value: Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "stats");
        assert_eq!(value["gpu_id"], "card0");
        assert!(value["metrics"]["gpu_busy_pct"].is_null());

        let procs = ServerMessage::Procs(ProcessSnapshot {
            device_id: "card1".into(),
            ts,
            capabilities: Capabilities::default(),
            processes: Vec::new(),
        });
        let value: Value = serde_json::from_str(&procs.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "procs");
        assert_eq!(value["gpu_id"], "card1");
        assert_eq!(value["processes"], json!([]));
    }

    #[test]
    fn test_error_and_pong() {
        assert_eq!(
            ServerMessage::error("unknown gpu").to_json().unwrap(),
            r#"{"type":"error","message":"unknown gpu"}"#
        );
        assert_eq!(ServerMessage::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_parse_subscribe() {
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe","gpu_id":"card1"}"#),
            Ok(ClientMessage::Subscribe {
                gpu_id: Some("card1".into())
            })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe","device_id":"card2"}"#),
            Ok(ClientMessage::Subscribe {
                gpu_id: Some("card2".into())
            })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe","gpu_id":""}"#),
            Ok(ClientMessage::Subscribe { gpu_id: None })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe"}"#),
            Ok(ClientMessage::Subscribe { gpu_id: None })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe","gpu_id":5}"#),
            Err(ProtocolError::InvalidSubscribe)
        );
    }

    #[test]
    fn test_parse_other_frames() {
        assert_eq!(parse_client_message(r#"{"type":"ping"}"#), Ok(ClientMessage::Ping));
        assert_eq!(
            parse_client_message(r#"{"type":"resize","w":3}"#),
            Ok(ClientMessage::Unknown("resize".into()))
        );
        assert_eq!(parse_client_message("not json"), Err(ProtocolError::Malformed));
        assert_eq!(parse_client_message(r#"{"kind":"ping"}"#), Err(ProtocolError::Malformed));
        assert_eq!(parse_client_message("[1,2]"), Err(ProtocolError::Malformed));
    }
}
