//! Wire protocol for hdriver client <-> on-device UI test harness communication.
//!
//! Every message is a bare JSON object with string-valued fields. Requests
//! carry `action` and a correlation `uuid`; responses echo the `uuid` and add
//! `ret` / `description` on failure plus a free-form `data` payload.
//! Messages are not length-prefixed; [`FrameBuffer`] recovers message
//! boundaries from the byte stream since a JSON object delimits itself.

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Bytes sent by the client right after connecting. Any non-empty reply is
/// taken as the acknowledgment.
pub const HANDSHAKE: &[u8] = b"hello";

/// Port the harness listens on when nothing else holds it.
pub const DEFAULT_PORT: u16 = 29100;

/// Ports tried in order when the harness is (re)started.
pub const PORT_CANDIDATES: [u16; 5] = [29100, 29200, 29300, 29400, 29500];

/// Error descriptions starting with this prefix mean the element is gone.
pub const NOT_FOUND_PREFIX: &str = "no ele";

/// Value of `ret` on a failed request. Successful replies omit `ret`.
pub const STATUS_ERROR: &str = "error";

/// Request verbs (`action` field).
pub mod action {
    /// Locate one element. Params: `by`, `data`, `timeout_s`, `attributes`, `operates`, `extend`
    pub const FIND: &str = "find";
    /// Locate all matching elements. `data` of the reply is a JSON list
    pub const FINDS: &str = "finds";
    /// Read one element attribute. Params: `euid`, `property`
    pub const GET: &str = "get";
    /// Act on an element. Params: `euid`, `operate`, optional `text`
    pub const OPERATE: &str = "operate";
    /// Params: `x`, `y`
    pub const TAP: &str = "tap";
    /// Params: `startx`, `starty`, `endx`, `endy`, `speed`, `time_s`
    pub const SWIPE: &str = "swipe";
    pub const HOME: &str = "home";
    pub const BACK: &str = "back";
    /// Reply `data`: `{"x": width, "y": height}`
    pub const SCREEN_SIZE: &str = "screenSize";
    pub const CURRENT_BUNDLE: &str = "currentBundle";
    /// Params: `cmd` (`start` / `stop`), `bundle`, `ability`
    pub const APP: &str = "app";
}

/// Field names used on the wire.
pub mod field {
    pub const ACTION: &str = "action";
    pub const UUID: &str = "uuid";
    pub const RET: &str = "ret";
    pub const DESCRIPTION: &str = "description";
    pub const DATA: &str = "data";
    pub const EUID: &str = "euid";
    pub const BY: &str = "by";
    pub const TIMEOUT_S: &str = "timeout_s";
    pub const TIME_S: &str = "time_s";
    pub const ATTRIBUTES: &str = "attributes";
    pub const OPERATES: &str = "operates";
    pub const EXTEND: &str = "extend";
    pub const PROPERTY: &str = "property";
    pub const OPERATE: &str = "operate";
    pub const TEXT: &str = "text";
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const START_X: &str = "startx";
    pub const START_Y: &str = "starty";
    pub const END_X: &str = "endx";
    pub const END_Y: &str = "endy";
    pub const SPEED: &str = "speed";
    pub const CMD: &str = "cmd";
    pub const BUNDLE: &str = "bundle";
    pub const ABILITY: &str = "ability";
}

/// Element attribute names accepted by `get`, also used as reply fields of
/// `find` / `finds`.
pub mod property {
    pub const ID: &str = "id";
    pub const TEXT: &str = "text";
    pub const TYPE: &str = "type";
    pub const BOUNDS: &str = "bounds";
    pub const BOUNDS_CENTER: &str = "boundsCenter";
}

/// Element actions accepted by `operate`.
pub mod operate {
    pub const TAP: &str = "tap";
    pub const INPUT: &str = "input";
    pub const CLEAR: &str = "clear";
}

/// Sub-commands of the `app` action.
pub mod app_cmd {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
}

#[derive(Debug, Error)]
#[error("malformed harness message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// One outgoing command.
///
/// `action` and `uuid` are fixed fields; everything else is an ordered list of
/// string parameters. Keys keep their insertion order on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    action: String,
    params: Vec<(String, String)>,
    uuid: Option<String>,
}

impl Request {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Vec::new(),
            uuid: None,
        }
    }

    /// Add or replace a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = Some(uuid.into());
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 1 + self.params.len() + usize::from(self.uuid.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry(field::ACTION, &self.action)?;
        for (key, value) in &self.params {
            map.serialize_entry(key, value)?;
        }
        if let Some(uuid) = &self.uuid {
            map.serialize_entry(field::UUID, uuid)?;
        }
        map.end()
    }
}

/// One reply from the harness. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub ret: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Verb-specific fields such as `euid` or element attributes.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.ret.as_deref() == Some(STATUS_ERROR)
    }

    /// `data` as text. Strings are returned as-is, null as empty, anything
    /// else in its JSON form.
    pub fn data_string(&self) -> String {
        value_to_string(&self.data)
    }

    /// Parse `data`, which may be inline JSON or a JSON document inside a string.
    pub fn data_json<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        parse_embedded(&self.data)
    }

    /// A verb-specific field as text.
    pub fn field_str(&self, key: &str) -> Option<String> {
        match self.extra.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value_to_string(value)),
        }
    }

    /// Parse a verb-specific field the same way as [`Response::data_json`].
    pub fn field_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DecodeError> {
        match self.extra.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_embedded(value).map(Some),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The harness often nests JSON documents as string values (`"{\"x\":1}"`).
/// Accept both that and a plain JSON value.
pub fn parse_embedded<T: DeserializeOwned>(value: &Value) -> Result<T, DecodeError> {
    match value {
        Value::String(s) => Ok(serde_json::from_str(s)?),
        other => Ok(T::deserialize(other)?),
    }
}

/// Encode a request into one wire message.
pub fn encode(request: &Request) -> Result<Vec<u8>, DecodeError> {
    Ok(serde_json::to_vec(request)?)
}

/// Decode exactly one complete message.
pub fn decode(bytes: &[u8]) -> Result<Response, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Reassembles responses from an unframed byte stream.
///
/// A message split across reads stays buffered until its remainder arrives;
/// several messages delivered by one read are yielded one at a time.
///
/// Bytes that are not JSON (typically the leftover of a reply whose start was
/// dropped) are skipped up to the next `{`, so they never hide the message
/// behind them. Only well-formed JSON that is not a message is an error.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    skipped: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message. `Ok(None)` means more bytes are needed.
    /// On a JSON value that is not a message the buffer is emptied before the
    /// error returns.
    pub fn next_message(&mut self) -> Result<Option<Response>, DecodeError> {
        loop {
            let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buf.clear();
                return Ok(None);
            };

            let (item, consumed) = {
                let mut stream = serde_json::Deserializer::from_slice(&self.buf[start..])
                    .into_iter::<Response>();
                let item = stream.next();
                (item, start + stream.byte_offset())
            };

            match item {
                None => {
                    self.buf.clear();
                    return Ok(None);
                }
                Some(Ok(response)) => {
                    self.buf.drain(..consumed);
                    return Ok(Some(response));
                }
                Some(Err(e)) if e.is_eof() => return Ok(None), // incomplete, wait for more
                Some(Err(e)) if e.is_syntax() => {
                    let resync = self.buf[start + 1..]
                        .iter()
                        .position(|&b| b == b'{')
                        .map_or(self.buf.len(), |next| start + 1 + next);
                    self.skipped += resync;
                    self.buf.drain(..resync);
                }
                Some(Err(e)) => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return Err(e.into());
                }
            }
        }
    }

    /// Number of bytes thrown away since the last call.
    pub fn take_skipped(&mut self) -> usize {
        std::mem::take(&mut self.skipped)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_keeps_field_order() {
        let mut req = Request::new(action::TAP).param(field::X, 100).param(field::Y, 200);
        req.set_uuid("abc");
        let encoded = encode(&req).unwrap();
        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            r#"{"action":"tap","x":"100","y":"200","uuid":"abc"}"#
        );
    }

    #[test]
    fn param_replaces_existing_key() {
        let req = Request::new(action::FIND)
            .param(field::TIMEOUT_S, 0)
            .param(field::TIMEOUT_S, 5);
        assert_eq!(req.get(field::TIMEOUT_S), Some("5"));
        assert_eq!(req.params().count(), 1);
    }

    #[test]
    fn decode_error_reply() {
        let resp = decode(br#"{"uuid":"u1","ret":"error","description":"no element"}"#).unwrap();
        assert!(resp.is_error());
        assert_eq!(resp.uuid, "u1");
        assert_eq!(resp.description.as_deref(), Some("no element"));
        assert_eq!(resp.data_string(), "");
    }

    #[test]
    fn decode_tolerates_missing_fields() {
        let resp = decode(br#"{"data":"ok"}"#).unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.uuid, "");
        assert_eq!(resp.data_string(), "ok");
    }

    #[test]
    fn decode_rejects_partial_message() {
        assert!(decode(br#"{"uuid":"u1","da"#).is_err());
    }

    #[test]
    fn extra_fields_and_embedded_json() {
        let resp = decode(
            br#"{"uuid":"u","euid":"e7","text":"OK","boundsCenter":"{\"x\":5,\"y\":6}","data":"{\"x\":1080,\"y\":2340}"}"#,
        )
        .unwrap();
        assert_eq!(resp.field_str(field::EUID).as_deref(), Some("e7"));
        assert_eq!(resp.field_str(property::TEXT).as_deref(), Some("OK"));
        assert_eq!(resp.field_str(property::ID), None);

        let center: Value = resp.field_json(property::BOUNDS_CENTER).unwrap().unwrap();
        assert_eq!(center["x"], 5);
        let size: Value = resp.data_json().unwrap();
        assert_eq!(size["y"], 2340);
    }

    #[test]
    fn frame_buffer_joins_split_message() {
        let mut frames = FrameBuffer::new();
        frames.push(br#"{"uuid":"a","da"#);
        assert!(frames.next_message().unwrap().is_none());
        frames.push(br#"ta":"ok"}"#);
        let resp = frames.next_message().unwrap().unwrap();
        assert_eq!(resp.uuid, "a");
        assert_eq!(resp.data_string(), "ok");
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_buffer_splits_coalesced_messages() {
        let mut frames = FrameBuffer::new();
        frames.push(br#"{"uuid":"a","data":"1"}{"uuid":"b","data":"2"} {"uuid":"c"#);
        assert_eq!(frames.next_message().unwrap().unwrap().uuid, "a");
        assert_eq!(frames.next_message().unwrap().unwrap().uuid, "b");
        assert!(frames.next_message().unwrap().is_none());
        frames.push(br#""}"#);
        assert_eq!(frames.next_message().unwrap().unwrap().uuid, "c");
    }

    #[test]
    fn frame_buffer_skips_garbage() {
        let mut frames = FrameBuffer::new();
        frames.push(b"not json at all");
        assert!(frames.next_message().unwrap().is_none());
        assert!(frames.is_empty());
        assert_eq!(frames.take_skipped(), 15);
        assert_eq!(frames.take_skipped(), 0);
        frames.push(b"  \n");
        assert!(frames.next_message().unwrap().is_none());
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_buffer_recovers_after_abandoned_fragment() {
        let mut frames = FrameBuffer::new();
        frames.push(br#"{"uuid":"a","da"#);
        assert!(frames.next_message().unwrap().is_none());
        frames.push(br#"{"uuid":"b","data":"ok"}"#);
        let resp = frames.next_message().unwrap().unwrap();
        assert_eq!(resp.uuid, "b");
        assert_eq!(resp.data_string(), "ok");
        assert!(frames.is_empty());
        assert!(frames.take_skipped() > 0);
    }

    #[test]
    fn frame_buffer_skips_orphaned_tail() {
        let mut frames = FrameBuffer::new();
        frames.push(br#"ta":"late"}{"uuid":"c","data":"1"}"#);
        assert_eq!(frames.next_message().unwrap().unwrap().uuid, "c");
        assert_eq!(frames.take_skipped(), 11);
    }

    #[test]
    fn frame_buffer_rejects_json_that_is_not_a_reply() {
        let mut frames = FrameBuffer::new();
        frames.push(br#"{"uuid":5}{"uuid":"d"}"#);
        assert!(frames.next_message().is_err());
        assert!(frames.is_empty());
    }
}
