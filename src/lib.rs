//! Remote-control client for an on-device UI test harness.
//!
//! A [`Driver`] keeps one stream connection to the harness and turns verbs
//! (find, tap, swipe, app start/stop, ...) into request/response exchanges.
//! Requests are strictly one at a time; a reply is matched to its request by
//! correlation id, and a dropped connection is re-established once per call.

pub mod config;
pub mod device;
pub mod driver;
pub mod element;
pub mod engine;
pub mod error;
pub mod transport;

pub use config::DriverConfig;
pub use device::{Device, DeviceShell, HdcShell};
pub use driver::{by, swipe_speed, Driver, FindOptions, ScreenSize, Session};
pub use element::{Attribute, Cached, Element, Point, Rect};
pub use engine::{Engine, RetryPolicy};
pub use error::{Error, Result};
pub use hdriver_proto as proto;
pub use transport::{Connection, Connector, TcpConnection};
