use crate::transport::MAX_WAIT;
use hdriver_proto::PORT_CANDIDATES;
use std::path::PathBuf;
use std::time::Duration;

/// Default base wait for every request: 10s
const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);
/// Read size for one poll of the harness socket.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Settings for one driver session.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Target passed to `hdc -t`.
    pub device_id: String,
    /// Application under test, used by [`crate::Driver::launch_app`].
    pub app_bundle: String,
    pub app_ability: String,
    /// Base reply window added to every request's own `timeout_s` / `time_s`.
    pub find_timeout: Duration,
    /// Overall bound on connecting and handshaking with the harness.
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    pub buffer_size: usize,
    /// Candidate harness ports, first free one wins.
    pub ports: Vec<u16>,
    /// Path of the `hdc` executable.
    pub hdc: PathBuf,
}

impl DriverConfig {
    pub fn new(
        device_id: impl Into<String>,
        app_bundle: impl Into<String>,
        app_ability: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            app_bundle: app_bundle.into(),
            app_ability: app_ability.into(),
            find_timeout: DEFAULT_FIND_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ports: PORT_CANDIDATES.to_vec(),
            hdc: PathBuf::from("hdc"),
        }
    }

    /// Like [`DriverConfig::new`], then applies overrides from the environment:
    ///
    /// - `HDRIVER_HDC`: path of the `hdc` executable
    /// - `HDRIVER_FIND_TIMEOUT`: base reply window in seconds
    /// - `HDRIVER_PORT`: use only this harness port
    pub fn from_env(
        device_id: impl Into<String>,
        app_bundle: impl Into<String>,
        app_ability: impl Into<String>,
    ) -> Self {
        let mut config = Self::new(device_id, app_bundle, app_ability);
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(hdc) = lookup("HDRIVER_HDC") {
            self.hdc = PathBuf::from(hdc);
        }
        if let Some(secs) = lookup("HDRIVER_FIND_TIMEOUT") {
            match secs
                .parse::<f64>()
                .ok()
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .filter(|timeout| *timeout <= MAX_WAIT)
            {
                Some(timeout) => self.find_timeout = timeout,
                None => log::warn!("Ignoring invalid HDRIVER_FIND_TIMEOUT '{}'", secs),
            }
        }
        if let Some(port) = lookup("HDRIVER_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.ports = vec![port],
                Err(_) => log::warn!("Ignoring invalid HDRIVER_PORT '{}'", port),
            }
        }
    }
}
