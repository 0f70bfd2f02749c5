//! Session facade: device-level verbs built on the request engine.

use crate::config::DriverConfig;
use crate::device::{Device, DeviceShell, HdcShell};
use crate::element::{Element, Point};
use crate::engine::{correlation_id, Engine, RetryPolicy};
use crate::error::{Error, Result};
use crate::transport::Connector;
use hdriver_proto::{action, app_cmd, field, Request, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const MIN_SWIPE_SPEED: u32 = 200;
pub const MAX_SWIPE_SPEED: u32 = 15000;

/// Pause after `stop_app`; an immediate restart of the same app sometimes fails.
const STOP_APP_SETTLE: Duration = Duration::from_secs(1);

/// Criteria for locating elements.
pub mod by {
    pub use hdriver_proto::property::{ID, TEXT, TYPE};
}

/// The connection-owning half of a driver: the connector used for
/// (re)connecting and the engine holding the live connection.
pub struct Session<C: Connector> {
    connector: C,
    engine: Engine<C::Conn>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            engine: Engine::new(policy),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.engine.connect(&mut self.connector)
    }

    pub fn request(&mut self, request: Request) -> Result<Response> {
        self.engine.call(&mut self.connector, request)
    }
}

/// Extra parameters of `find_element` / `find_elements`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Seconds the harness may keep looking, added to the reply window.
    pub timeout_s: f64,
    /// Attributes to include in the reply so they need no later round trip.
    pub attributes: Vec<String>,
    pub operates: Vec<String>,
    pub extend: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

/// A remote-control session with one device.
///
/// All calls go through one lock, so a driver can be cloned and shared across
/// threads; requests are still strictly one at a time.
pub struct Driver<C: Connector = Device<HdcShell>> {
    session: Arc<Mutex<Session<C>>>,
    app_bundle: String,
    app_ability: String,
}

impl<C: Connector> Clone for Driver<C> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            app_bundle: self.app_bundle.clone(),
            app_ability: self.app_ability.clone(),
        }
    }
}

impl Driver<Device<HdcShell>> {
    /// Restart the harness on the configured device through `hdc` and connect.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let shell = HdcShell::new(&config.hdc);
        Self::with_shell(shell, config)
    }
}

impl<S: DeviceShell> Driver<Device<S>> {
    pub fn with_shell(shell: S, config: DriverConfig) -> Result<Self> {
        let mut device = Device::new(shell, &config);
        device.bootstrap(true)?;
        let driver = Self::with_connector(device, &config);
        driver.session.lock().connect()?;
        Ok(driver)
    }

    /// Capture the screen and return the PNG bytes.
    pub fn screenshot_png(&self) -> Result<Vec<u8>> {
        let local = std::env::temp_dir().join(format!("hdriver-{}.png", correlation_id()));
        self.session.lock().connector.screenshot(&local)?;
        let png = std::fs::read(&local);
        if let Err(e) = std::fs::remove_file(&local) {
            log::warn!("Could not remove {}: {}", local.display(), e);
        }
        Ok(png?)
    }

    /// Drop the connection and stop the harness process.
    pub fn close(self) -> Result<()> {
        let mut session = self.session.lock();
        session.engine.disconnect();
        session.connector.stop_harness()
    }
}

impl<C: Connector> Driver<C> {
    /// Wrap an arbitrary connector. Nothing is sent until the first verb.
    pub fn with_connector(connector: C, config: &DriverConfig) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new(
                connector,
                RetryPolicy::new(config.find_timeout),
            ))),
            app_bundle: config.app_bundle.clone(),
            app_ability: config.app_ability.clone(),
        }
    }

    /// Send a raw request and return the full reply.
    pub fn request(&self, request: Request) -> Result<Response> {
        self.session.lock().request(request)
    }

    fn request_data(&self, request: Request) -> Result<String> {
        Ok(self.request(request)?.data_string())
    }

    pub fn find_element(&self, by: &str, data: &str, options: &FindOptions) -> Result<Element<C>> {
        let req = Request::new(action::FIND)
            .param(field::BY, by)
            .param(field::DATA, data)
            .param(field::TIMEOUT_S, options.timeout_s)
            .param(field::ATTRIBUTES, join_or_none(&options.attributes))
            .param(field::OPERATES, join_or_none(&options.operates))
            .param(field::EXTEND, &options.extend);
        let resp = self.request(req)?;
        Element::from_fields(Arc::downgrade(&self.session), &resp.extra)
    }

    pub fn find_elements(
        &self,
        by: &str,
        data: &str,
        options: &FindOptions,
    ) -> Result<Vec<Element<C>>> {
        let req = Request::new(action::FINDS)
            .param(field::BY, by)
            .param(field::DATA, data)
            .param(field::ATTRIBUTES, join_or_none(&options.attributes))
            .param(field::OPERATES, join_or_none(&options.operates))
            .param(field::EXTEND, &options.extend);
        let resp = self.request(req)?;
        let entries: Vec<Value> = resp
            .data_json()
            .map_err(|e| Error::InvalidResponse(format!("finds data: {}", e)))?;
        entries
            .iter()
            .map(|entry| match entry {
                Value::Object(fields) => {
                    Element::from_fields(Arc::downgrade(&self.session), fields)
                }
                other => Err(Error::InvalidResponse(format!(
                    "finds entry is not an object: {}",
                    other
                ))),
            })
            .collect()
    }

    pub fn tap(&self, x: i32, y: i32) -> Result<String> {
        self.request_data(
            Request::new(action::TAP)
                .param(field::X, x)
                .param(field::Y, y),
        )
    }

    /// Swipe from start to end within roughly `time_s` seconds.
    pub fn swipe(
        &self,
        startx: i32,
        starty: i32,
        endx: i32,
        endy: i32,
        time_s: f64,
    ) -> Result<String> {
        let speed = swipe_speed((startx, starty), (endx, endy), time_s);
        self.request_data(
            Request::new(action::SWIPE)
                .param(field::START_X, startx)
                .param(field::START_Y, starty)
                .param(field::END_X, endx)
                .param(field::END_Y, endy)
                .param(field::SPEED, speed)
                .param(field::TIME_S, time_s),
        )
    }

    pub fn home(&self) -> Result<String> {
        self.request_data(Request::new(action::HOME))
    }

    pub fn back(&self) -> Result<String> {
        self.request_data(Request::new(action::BACK))
    }

    pub fn screen_size(&self) -> Result<ScreenSize> {
        let resp = self.request(Request::new(action::SCREEN_SIZE))?;
        let size: Point = resp
            .data_json()
            .map_err(|e| Error::InvalidResponse(format!("screen size: {}", e)))?;
        Ok(ScreenSize {
            width: size.x,
            height: size.y,
        })
    }

    /// Bundle name of the foreground application.
    pub fn current_bundle(&self) -> Result<String> {
        self.request_data(Request::new(action::CURRENT_BUNDLE))
    }

    pub fn start_app(&self, bundle: &str, ability: &str) -> Result<String> {
        self.request_data(
            Request::new(action::APP)
                .param(field::CMD, app_cmd::START)
                .param(field::BUNDLE, bundle)
                .param(field::ABILITY, ability),
        )
    }

    pub fn stop_app(&self, bundle: &str) -> Result<String> {
        let ack = self.request_data(
            Request::new(action::APP)
                .param(field::CMD, app_cmd::STOP)
                .param(field::BUNDLE, bundle),
        )?;
        std::thread::sleep(STOP_APP_SETTLE);
        Ok(ack)
    }

    /// Start the application named in the driver's config.
    pub fn launch_app(&self) -> Result<String> {
        self.start_app(&self.app_bundle, &self.app_ability)
    }
}

/// Swipe speed in pixels per second for the harness: the larger axis
/// distance over the duration, clamped to what the harness accepts.
pub fn swipe_speed(start: (i32, i32), end: (i32, i32), time_s: f64) -> u32 {
    let distance = start.0.abs_diff(end.0).max(start.1.abs_diff(end.1));
    if time_s.is_nan() || time_s <= 0.0 {
        return MAX_SWIPE_SPEED;
    }
    let speed = (f64::from(distance) / time_s).round();
    speed.clamp(f64::from(MIN_SWIPE_SPEED), f64::from(MAX_SWIPE_SPEED)) as u32
}

/// Harness convention: an empty list is sent as the literal `None`.
fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "None".to_string()
    } else {
        items.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{Plan, ScriptedConnector};
    use serde_json::json;

    fn driver(
        plans: impl IntoIterator<Item = Plan>,
    ) -> (Driver<ScriptedConnector>, ScriptedConnector) {
        let connector = ScriptedConnector::with_plans(plans);
        let mut config = DriverConfig::new("dev", "com.example.app", "EntryAbility");
        config.find_timeout = Duration::from_secs(2);
        (Driver::with_connector(connector.clone(), &config), connector)
    }

    #[test]
    fn swipe_speed_in_range_is_rounded() {
        assert_eq!(swipe_speed((0, 0), (0, 1000), 2.0), 500);
        assert_eq!(swipe_speed((100, 100), (600, 300), 0.8), 625);
        assert_eq!(swipe_speed((0, 0), (1001, 0), 2.0), 501); // 500.5 rounds up
    }

    #[test]
    fn swipe_speed_is_clamped() {
        assert_eq!(swipe_speed((0, 0), (10, 10), 1.0), MIN_SWIPE_SPEED);
        assert_eq!(swipe_speed((0, 0), (0, 0), 1.0), MIN_SWIPE_SPEED);
        assert_eq!(swipe_speed((0, 0), (3000, 0), 0.1), MAX_SWIPE_SPEED);
        assert_eq!(swipe_speed((0, 0), (500, 0), 0.0), MAX_SWIPE_SPEED);
        assert_eq!(swipe_speed((i32::MIN, 0), (i32::MAX, 0), 0.001), MAX_SWIPE_SPEED);
    }

    #[test]
    fn tap_sends_coordinates() {
        let (driver, connector) = driver([Plan::Reply(json!({"data": "ok"}))]);
        assert_eq!(driver.tap(100, 200).unwrap(), "ok");
        let sent = connector.sent();
        assert_eq!(sent[0].as_object().unwrap().len(), 4);
        assert_eq!(sent[0]["action"], "tap");
        assert_eq!(sent[0]["x"], "100");
        assert_eq!(sent[0]["y"], "200");
    }

    #[test]
    fn swipe_request_fields() {
        let (driver, connector) = driver([Plan::Reply(json!({"data": "ok"}))]);
        driver.swipe(100, 1500, 100, 500, 0.5).unwrap();
        let sent = &connector.sent()[0];
        assert_eq!(sent["action"], "swipe");
        assert_eq!(sent["startx"], "100");
        assert_eq!(sent["starty"], "1500");
        assert_eq!(sent["endy"], "500");
        assert_eq!(sent["speed"], "2000");
        assert_eq!(sent["time_s"], "0.5");
    }

    #[test]
    fn find_element_takes_handle_from_reply() {
        let (driver, connector) =
            driver([Plan::Reply(json!({"data": "", "euid": "e42", "type": "Button"}))]);
        let mut el = driver.find_element(by::ID, "btn1", &FindOptions::default()).unwrap();
        assert_eq!(el.euid(), "e42");
        assert_eq!(el.type_name().unwrap(), "Button");

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], "find");
        assert_eq!(sent[0]["by"], "id");
        assert_eq!(sent[0]["data"], "btn1");
        assert_eq!(sent[0]["timeout_s"], "0");
        assert_eq!(sent[0]["attributes"], "None");
        assert_eq!(sent[0]["operates"], "None");
        assert_eq!(sent[0]["extend"], "");
    }

    #[test]
    fn find_element_options_are_encoded() {
        let (driver, connector) = driver([Plan::Reply(json!({"euid": "e1"}))]);
        let options = FindOptions {
            timeout_s: 3.0,
            attributes: vec!["text".into(), "bounds".into()],
            operates: vec!["tap".into()],
            extend: "x".into(),
        };
        driver.find_element(by::TEXT, "OK", &options).unwrap();
        let sent = &connector.sent()[0];
        assert_eq!(sent["timeout_s"], "3");
        assert_eq!(sent["attributes"], "text,bounds");
        assert_eq!(sent["operates"], "tap");
        assert_eq!(sent["extend"], "x");
    }

    #[test]
    fn huge_durations_are_sent_not_fatal() {
        let (driver, connector) = driver([
            Plan::Reply(json!({"euid": "e1"})),
            Plan::Reply(json!({"data": "ok"})),
        ]);
        let options = FindOptions {
            timeout_s: 1e19,
            ..FindOptions::default()
        };
        let el = driver.find_element(by::ID, "x", &options).unwrap();
        assert_eq!(el.euid(), "e1");
        assert_eq!(driver.swipe(0, 0, 0, 900, 1e19).unwrap(), "ok");

        let sent = connector.sent();
        assert_eq!(sent[0]["timeout_s"], "10000000000000000000");
        assert_eq!(sent[1]["speed"], MIN_SWIPE_SPEED.to_string());
    }

    #[test]
    fn find_element_not_found() {
        let (driver, _) = driver([Plan::Reply(
            json!({"ret": "error", "description": "no element found"}),
        )]);
        let err = driver
            .find_element(by::ID, "missing", &FindOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ElementNotFound(_)));
    }

    #[test]
    fn find_elements_reads_list_payload() {
        let (driver, connector) = driver([Plan::Reply(json!({
            "data": "[{\"euid\":\"a\",\"text\":\"One\"},{\"euid\":\"b\"}]"
        }))]);
        let mut els = driver
            .find_elements(by::TYPE, "Text", &FindOptions::default())
            .unwrap();
        assert_eq!(els.len(), 2);
        assert_eq!(els[0].euid(), "a");
        assert_eq!(els[0].text().unwrap(), "One");
        assert_eq!(els[1].euid(), "b");

        let sent = &connector.sent()[0];
        assert_eq!(sent["action"], "finds");
        assert!(sent.get("timeout_s").is_none());
    }

    #[test]
    fn screen_size_maps_axes() {
        let (driver, _) = driver([Plan::Reply(json!({"data": "{\"x\":1260,\"y\":2720}"}))]);
        assert_eq!(
            driver.screen_size().unwrap(),
            ScreenSize {
                width: 1260,
                height: 2720
            }
        );
    }

    #[test]
    fn app_lifecycle_requests() {
        let (driver, connector) = driver([
            Plan::Reply(json!({"data": "start ok"})),
            Plan::Reply(json!({"data": "stop ok"})),
            Plan::Reply(json!({"data": "com.example.app"})),
        ]);
        assert_eq!(driver.launch_app().unwrap(), "start ok");
        assert_eq!(driver.stop_app("com.example.app").unwrap(), "stop ok");
        assert_eq!(driver.current_bundle().unwrap(), "com.example.app");

        let sent = connector.sent();
        assert_eq!(sent[0]["cmd"], "start");
        assert_eq!(sent[0]["bundle"], "com.example.app");
        assert_eq!(sent[0]["ability"], "EntryAbility");
        assert_eq!(sent[1]["cmd"], "stop");
        assert!(sent[1].get("ability").is_none());
        assert_eq!(sent[2]["action"], "currentBundle");
    }

    #[test]
    fn navigation_verbs() {
        let (driver, connector) = driver([
            Plan::Reply(json!({"data": "ok"})),
            Plan::Reply(json!({"data": "ok"})),
        ]);
        driver.home().unwrap();
        driver.back().unwrap();
        let sent = connector.sent();
        assert_eq!(sent[0]["action"], "home");
        assert_eq!(sent[1]["action"], "back");
    }
}
