//! Frame codec for the command-server socket.
//!
//! The service speaks newline-free JSON objects back to back on a plain TCP
//! stream. Every frame has the shape `{"command": "...", "data": {...}}` and
//! therefore ends with the two-byte `}}` sequence, which is the only frame
//! boundary the protocol offers. [`FrameCodec`] splits the byte stream on
//! that delimiter; [`decode`] interprets one frame.
//!
//! Decoding is total: a frame that cannot be understood maps to
//! [`Event::Unrecognized`] and is dropped by the caller. A single corrupt
//! frame must never cost the connection.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::json;
use tokio_util::codec::Decoder;

/// Frame delimiter: the close of the `data` object plus the close of the
/// envelope. Observed service behavior; there is no length prefix.
const FRAME_DELIMITER: &[u8] = b"}}";

/// Hard cap on a single frame. If no delimiter shows up within this many
/// bytes the stream has lost its framing and the connection is declared bad.
const MAX_FRAME_LEN: usize = 64 * 1024;

// ── Event ────────────────────────────────────────────────────────────

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `connect_rsp` with an ok status: the socket handshake succeeded.
    AuthAccepted,
    /// `connect_rsp` with anything else: the token was rejected.
    AuthRejected { reason: String },
    /// `status`: one datapoint changed. Also the service's acknowledgement
    /// of a `set` — confirmed writes come back as an echoed datapoint.
    FeatureChanged {
        device_id: String,
        uid: u32,
        value: i64,
    },
    /// `rssi`: wireless signal strength report for a device.
    SignalStrength { device_id: String, rssi: i64 },
    /// Anything else: unknown command, missing fields, or unparseable JSON.
    Unrecognized,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    command: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Interpret one delimited frame.
pub fn decode(frame: &[u8]) -> Event {
    let raw: RawFrame = match serde_json::from_slice(frame) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, len = frame.len(), "undecodable frame");
            return Event::Unrecognized;
        }
    };

    match raw.command.as_str() {
        "connect_rsp" => {
            let status = raw.data["status"].as_str().unwrap_or("");
            if status == "ok" {
                Event::AuthAccepted
            } else {
                Event::AuthRejected {
                    reason: if status.is_empty() {
                        "no status in connect_rsp".to_owned()
                    } else {
                        status.to_owned()
                    },
                }
            }
        }
        "status" => match status_fields(&raw.data) {
            Some((device_id, uid, value)) => Event::FeatureChanged {
                device_id,
                uid,
                value,
            },
            None => Event::Unrecognized,
        },
        "rssi" => match rssi_fields(&raw.data) {
            Some((device_id, rssi)) => Event::SignalStrength { device_id, rssi },
            None => Event::Unrecognized,
        },
        other => {
            tracing::debug!(command = other, "unrecognized frame command");
            Event::Unrecognized
        }
    }
}

fn status_fields(data: &serde_json::Value) -> Option<(String, u32, i64)> {
    let device_id = opaque_id(&data["deviceId"])?;
    let uid = u32::try_from(data["uid"].as_i64()?).ok()?;
    let value = data["value"].as_i64()?;
    Some((device_id, uid, value))
}

fn rssi_fields(data: &serde_json::Value) -> Option<(String, i64)> {
    let device_id = opaque_id(&data["deviceId"])?;
    let rssi = data["value"].as_i64()?;
    Some((device_id, rssi))
}

fn opaque_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Encoders ─────────────────────────────────────────────────────────
//
// Outbound frames are ASCII JSON. Domain validation happens in the caller
// before these run; the codec deals in raw (device, uid, value) triples.

/// Socket handshake: present the one-shot session token.
pub fn connect_req(token: i64) -> String {
    json!({"command": "connect_req", "data": {"token": token}}).to_string()
}

/// Write one datapoint.
pub fn set_value(device_id: &str, uid: u32, value: i64) -> String {
    json!({
        "command": "set",
        "data": {"deviceId": wire_id(device_id), "uid": uid, "value": value, "seqNo": 0}
    })
    .to_string()
}

/// Read one datapoint. Doubles as the keepalive: the service answers with a
/// `status` frame, refreshing the idle clock on both ends.
pub fn status_query(device_id: &str, uid: u32) -> String {
    json!({"command": "get", "data": {"deviceId": wire_id(device_id), "uid": uid}}).to_string()
}

/// Device ids are numeric on the wire for current hardware; send them as
/// numbers when they parse, strings otherwise.
fn wire_id(device_id: &str) -> serde_json::Value {
    device_id
        .parse::<i64>()
        .map_or_else(|_| json!(device_id), |n| json!(n))
}

// ── FrameCodec ───────────────────────────────────────────────────────

/// [`Decoder`] that splits the inbound byte stream on the `}}` delimiter.
///
/// Partial frames stay buffered until the delimiter arrives. Losing the
/// delimiter for [`MAX_FRAME_LEN`] bytes is unrecoverable (frame boundaries
/// can no longer be trusted) and surfaces as an I/O error, which the read
/// loop treats as a connection failure.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        if let Some(pos) = src
            .windows(FRAME_DELIMITER.len())
            .position(|window| window == FRAME_DELIMITER)
        {
            let frame = src.split_to(pos + FRAME_DELIMITER.len()).freeze();
            return Ok(Some(frame));
        }

        if src.len() > MAX_FRAME_LEN {
            src.advance(src.len());
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame delimiter not found within frame size limit",
            ));
        }

        Ok(None)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_connect_rsp_ok() {
        let event = decode(br#"{"command":"connect_rsp","data":{"status":"ok"}}"#);
        assert_eq!(event, Event::AuthAccepted);
    }

    #[test]
    fn decode_connect_rsp_rejection() {
        let event = decode(br#"{"command":"connect_rsp","data":{"status":"err_token"}}"#);
        assert_eq!(
            event,
            Event::AuthRejected {
                reason: "err_token".to_owned()
            }
        );
    }

    #[test]
    fn decode_status_frame() {
        let event = decode(
            br#"{"command":"status","data":{"deviceId":12015601252591,"uid":1,"value":1,"seqNo":0}}"#,
        );
        assert_eq!(
            event,
            Event::FeatureChanged {
                device_id: "12015601252591".to_owned(),
                uid: 1,
                value: 1,
            }
        );
    }

    #[test]
    fn decode_rssi_frame() {
        let event = decode(br#"{"command":"rssi","data":{"deviceId":99,"value":204}}"#);
        assert_eq!(
            event,
            Event::SignalStrength {
                device_id: "99".to_owned(),
                rssi: 204,
            }
        );
    }

    #[test]
    fn decode_unknown_command_is_unrecognized() {
        let event = decode(br#"{"command":"reboot_everything","data":{}}"#);
        assert_eq!(event, Event::Unrecognized);
    }

    #[test]
    fn decode_garbage_is_unrecognized() {
        assert_eq!(decode(b"not json at all}}"), Event::Unrecognized);
        assert_eq!(decode(b""), Event::Unrecognized);
    }

    #[test]
    fn decode_status_missing_fields_is_unrecognized() {
        let event = decode(br#"{"command":"status","data":{"uid":1}}"#);
        assert_eq!(event, Event::Unrecognized);
    }

    #[test]
    fn encode_set_round_trips_through_status_echo() {
        // The service confirms a write by echoing the datapoint back as a
        // `status` frame with the same payload.
        let sent = set_value("12015601252591", 1, 1);
        let mut parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        parsed["command"] = "status".into();
        let echoed = parsed.to_string();

        assert_eq!(
            decode(echoed.as_bytes()),
            Event::FeatureChanged {
                device_id: "12015601252591".to_owned(),
                uid: 1,
                value: 1,
            }
        );
    }

    #[test]
    fn encode_set_carries_sequence_number() {
        let sent = set_value("7", 9, 210);
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed["command"], "set");
        assert_eq!(parsed["data"]["deviceId"], 7);
        assert_eq!(parsed["data"]["uid"], 9);
        assert_eq!(parsed["data"]["value"], 210);
        assert_eq!(parsed["data"]["seqNo"], 0);
    }

    #[test]
    fn encode_connect_req() {
        let sent = connect_req(1_234_567_890);
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed["command"], "connect_req");
        assert_eq!(parsed["data"]["token"], 1_234_567_890);
    }

    #[test]
    fn encode_non_numeric_device_id_as_string() {
        let sent = status_query("mock_dev_id", 10);
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed["data"]["deviceId"], "mock_dev_id");
    }

    #[test]
    fn frames_end_with_delimiter() {
        // Every encoder output must be splittable by FrameCodec.
        for frame in [
            connect_req(42),
            set_value("1", 1, 1),
            status_query("1", 10),
        ] {
            assert!(frame.ends_with("}}"), "frame {frame} lacks delimiter");
        }
    }

    #[test]
    fn codec_splits_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(
            &br#"{"command":"connect_rsp","data":{"status":"ok"}}{"command":"status","data":{"deviceId":1,"uid":1,"value":0}}"#[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&first), Event::AuthAccepted);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decode(&second), Event::FeatureChanged { .. }));

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_buffers_partial_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&br#"{"command":"status","data":{"deviceId":1,"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(br#""uid":1,"value":5}}"#);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decode(&frame),
            Event::FeatureChanged {
                device_id: "1".to_owned(),
                uid: 1,
                value: 5,
            }
        );
    }

    #[test]
    fn codec_splits_delimiter_arriving_byte_by_byte() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&br#"{"command":"connect_rsp","data":{"status":"ok"}"#[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"}");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&frame), Event::AuthAccepted);
    }

    #[test]
    fn codec_errors_when_framing_is_lost() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.resize(MAX_FRAME_LEN + 1, b'x');

        assert!(codec.decode(&mut buf).is_err());
    }
}
