//! Handles to UI elements located by the harness.
//!
//! An [`Element`] only knows its opaque handle up front. Attributes the
//! harness did not include in the lookup reply are fetched on first access
//! and kept for the element's lifetime; remote changes after that are not
//! observed.

use crate::device::{Device, HdcShell};
use crate::driver::Session;
use crate::error::{Error, Result};
use crate::transport::Connector;
use hdriver_proto::{self as proto, action, field, operate, property, Request, Response};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Weak;

/// Element rectangle in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Attributes readable through `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Id,
    Text,
    Type,
    Bounds,
    BoundsCenter,
}

impl Attribute {
    pub fn wire_name(self) -> &'static str {
        match self {
            Attribute::Id => property::ID,
            Attribute::Text => property::TEXT,
            Attribute::Type => property::TYPE,
            Attribute::Bounds => property::BOUNDS,
            Attribute::BoundsCenter => property::BOUNDS_CENTER,
        }
    }
}

/// An attribute value that is either not fetched yet or known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cached<T> {
    #[default]
    Unknown,
    Known(T),
}

impl<T> Cached<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Cached::Known(value) => Some(value),
            Cached::Unknown => None,
        }
    }
}

impl<T> From<Option<T>> for Cached<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Cached::Unknown, Cached::Known)
    }
}

/// A located UI element.
///
/// Holds only a weak reference to its session; once the driver is dropped
/// every call fails with [`Error::SessionClosed`].
pub struct Element<C: Connector = Device<HdcShell>> {
    session: Weak<Mutex<Session<C>>>,
    euid: String,
    id: Cached<String>,
    text: Cached<String>,
    type_name: Cached<String>,
    bounds: Cached<Rect>,
    bounds_center: Cached<Point>,
}

impl<C: Connector> Element<C> {
    /// Build from the fields of a `find` reply or one entry of a `finds` list.
    pub(crate) fn from_fields(
        session: Weak<Mutex<Session<C>>>,
        fields: &Map<String, Value>,
    ) -> Result<Self> {
        let euid = match fields.get(field::EUID) {
            Some(Value::String(euid)) if !euid.is_empty() => euid.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::InvalidResponse(format!(
                    "reply has no element handle: {}",
                    Value::Object(fields.clone())
                )))
            }
        };
        Ok(Self {
            session,
            euid,
            id: text_field(fields, property::ID).into(),
            text: text_field(fields, property::TEXT).into(),
            type_name: text_field(fields, property::TYPE).into(),
            bounds: json_field::<Rect>(fields, property::BOUNDS)?.into(),
            bounds_center: json_field::<Point>(fields, property::BOUNDS_CENTER)?.into(),
        })
    }

    /// Opaque harness handle.
    pub fn euid(&self) -> &str {
        &self.euid
    }

    pub fn id(&mut self) -> Result<&str> {
        let Self { session, euid, id, .. } = self;
        cached(id, || fetch(session, euid, Attribute::Id)).map(String::as_str)
    }

    pub fn text(&mut self) -> Result<&str> {
        let Self {
            session, euid, text, ..
        } = self;
        cached(text, || fetch(session, euid, Attribute::Text)).map(String::as_str)
    }

    /// Component type, e.g. `Button` or `TextInput`.
    pub fn type_name(&mut self) -> Result<&str> {
        let Self {
            session,
            euid,
            type_name,
            ..
        } = self;
        cached(type_name, || fetch(session, euid, Attribute::Type)).map(String::as_str)
    }

    pub fn bounds(&mut self) -> Result<Rect> {
        let Self {
            session,
            euid,
            bounds,
            ..
        } = self;
        cached(bounds, || fetch_json(session, euid, Attribute::Bounds)).copied()
    }

    pub fn bounds_center(&mut self) -> Result<Point> {
        let Self {
            session,
            euid,
            bounds_center,
            ..
        } = self;
        cached(bounds_center, || {
            fetch_json(session, euid, Attribute::BoundsCenter)
        })
        .copied()
    }

    pub fn tap(&self) -> Result<String> {
        self.operate(operate::TAP, None)
    }

    /// Type `text` into the element. Cached `text` is not updated.
    pub fn input(&self, text: &str) -> Result<String> {
        self.operate(operate::INPUT, Some(text))
    }

    pub fn clear(&self) -> Result<String> {
        self.operate(operate::CLEAR, None)
    }

    fn operate(&self, op: &str, text: Option<&str>) -> Result<String> {
        let mut req = Request::new(action::OPERATE).param(field::OPERATE, op);
        if let Some(text) = text {
            req = req.param(field::TEXT, text);
        }
        let req = req.param(field::EUID, &self.euid);
        Ok(request(&self.session, req)?.data_string())
    }
}

impl<C: Connector> fmt::Debug for Element<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("euid", &self.euid)
            .field("id", &self.id.known())
            .field("text", &self.text.known())
            .field("type", &self.type_name.known())
            .field("bounds", &self.bounds.known())
            .field("bounds_center", &self.bounds_center.known())
            .finish()
    }
}

fn cached<T>(slot: &mut Cached<T>, fetch: impl FnOnce() -> Result<T>) -> Result<&T> {
    if let Cached::Unknown = slot {
        *slot = Cached::Known(fetch()?);
    }
    slot.known()
        .ok_or_else(|| Error::InvalidResponse("attribute unavailable".to_string()))
}

fn request<C: Connector>(session: &Weak<Mutex<Session<C>>>, req: Request) -> Result<Response> {
    let shared = session.upgrade().ok_or(Error::SessionClosed)?;
    let mut session = shared.lock();
    session.request(req)
}

fn fetch<C: Connector>(
    session: &Weak<Mutex<Session<C>>>,
    euid: &str,
    attribute: Attribute,
) -> Result<String> {
    let req = Request::new(action::GET)
        .param(field::PROPERTY, attribute.wire_name())
        .param(field::EUID, euid);
    Ok(request(session, req)?.data_string())
}

fn fetch_json<C: Connector, T: DeserializeOwned>(
    session: &Weak<Mutex<Session<C>>>,
    euid: &str,
    attribute: Attribute,
) -> Result<T> {
    let raw = fetch(session, euid, attribute)?;
    serde_json::from_str(&raw).map_err(|e| {
        Error::InvalidResponse(format!("{} '{}': {}", attribute.wire_name(), raw, e))
    })
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_field<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> Result<Option<T>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => proto::parse_embedded(value)
            .map(Some)
            .map_err(|e| Error::InvalidResponse(format!("{} {}: {}", key, value, e))),
    }
}
