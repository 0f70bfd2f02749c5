//! Device-side bootstrap: everything done through the `hdc` tool rather than
//! the harness socket.
//!
//! Keeps the UI test harness process alive on the device, forwards its port to
//! the host and moves screenshot files. The engine only sees this through the
//! [`Connector`] implementation on [`Device`].

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::transport::{deadline_after, Connector, TcpConnection};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Bundle name of the on-device test harness application.
pub const HARNESS_BUNDLE: &str = "com.harmony.uitest";
const HARNESS_MODULE: &str = "entry_test";
const HARNESS_RUNNER: &str = "/ets/testrunner/OpenHarmonyTestRunner";
const HARNESS_CLASS_PREFIX: &str = "ActsAbilityTest#uiTestProcess";
/// Harness test timeout passed to `aa test`: one day in ms.
const HARNESS_RUN_TIMEOUT_MS: &str = "86400000";

const REMOTE_SCREENSHOT: &str = "/data/local/tmp/aa.png";
const SCREENSHOT_OK_PREFIX: &str = "ScreenCap saved to";
const SCREENSHOT_WAIT: Duration = Duration::from_secs(5);

const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Runs host commands against the device tool.
pub trait DeviceShell {
    /// Run to completion and return stdout.
    fn run(&self, args: &[&str]) -> io::Result<String>;

    /// Start without waiting; output is discarded.
    fn spawn(&self, args: &[&str]) -> io::Result<()>;
}

/// [`DeviceShell`] backed by the `hdc` executable.
#[derive(Debug, Clone)]
pub struct HdcShell {
    program: PathBuf,
}

impl HdcShell {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DeviceShell for HdcShell {
    fn run(&self, args: &[&str]) -> io::Result<String> {
        log::debug!("{} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, args: &[&str]) -> io::Result<()> {
        log::debug!("{} {} &", self.program.display(), args.join(" "));
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

/// One target device and the harness running on it.
pub struct Device<S: DeviceShell> {
    shell: S,
    device_id: String,
    ports: Vec<u16>,
    port: u16,
    handshake_timeout: Duration,
    send_timeout: Duration,
    buffer_size: usize,
}

impl<S: DeviceShell> Device<S> {
    pub fn new(shell: S, config: &DriverConfig) -> Self {
        let port = config
            .ports
            .first()
            .copied()
            .unwrap_or(hdriver_proto::DEFAULT_PORT);
        Self {
            shell,
            device_id: config.device_id.clone(),
            ports: config.ports.clone(),
            port,
            handshake_timeout: config.handshake_timeout,
            send_timeout: config.send_timeout,
            buffer_size: config.buffer_size,
        }
    }

    /// Port the harness currently listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn hdc(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-t", self.device_id.as_str()];
        full.extend_from_slice(args);
        Ok(self.shell.run(&full)?)
    }

    fn hdc_spawn(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["-t", self.device_id.as_str()];
        full.extend_from_slice(args);
        Ok(self.shell.spawn(&full)?)
    }

    /// Pids of device processes whose `ps -Af` line mentions `keyword`.
    pub fn processes(&self, keyword: &str) -> Result<Vec<String>> {
        let out = self.hdc(&["shell", "ps", "-Af"])?;
        Ok(out
            .lines()
            .filter(|line| line.contains(keyword))
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(str::to_string)
            .collect())
    }

    pub fn kill(&self, pids: &[String]) -> Result<()> {
        for pid in pids {
            self.hdc(&["shell", "kill", pid.as_str()])?;
        }
        Ok(())
    }

    pub fn forward(&self, port: u16) -> Result<()> {
        let spec = format!("tcp:{}", port);
        self.hdc(&["fport", spec.as_str(), spec.as_str()])?;
        Ok(())
    }

    pub fn unforward(&self, port: u16) -> Result<()> {
        let spec = format!("tcp:{}", port);
        self.hdc(&["fport", "rm", spec.as_str(), spec.as_str()])?;
        Ok(())
    }

    /// Whether anything on the device (other than unix sockets) uses `port`.
    pub fn port_in_use(&self, port: u16) -> Result<bool> {
        let out = self.hdc(&["shell", "netstat", "-anpl"])?;
        let port = port.to_string();
        Ok(out
            .lines()
            .filter(|line| !line.contains("unix"))
            .any(|line| line.contains(&port)))
    }

    fn harness_class(&self) -> String {
        format!("{}{}", HARNESS_CLASS_PREFIX, self.port)
    }

    /// Make sure a harness is running. With `force_stop`, any running harness
    /// is killed and a fresh one started on the first free candidate port.
    pub fn ensure_harness(&mut self, force_stop: bool) -> Result<()> {
        log::info!("Ensuring harness on '{}', force_stop: {}", self.device_id, force_stop);
        if !force_stop && !self.processes(&self.harness_class())?.is_empty() {
            return Ok(());
        }

        self.stop_harness()?;

        let mut chosen = None;
        for &port in &self.ports {
            self.unforward(port)?;
            log::debug!("{}", self.hdc(&["fport", "ls"])?.trim());
            if !self.port_in_use(port)? {
                chosen = Some(port);
                break;
            }
            log::info!("Port {} busy on device", port);
        }
        self.port = chosen.ok_or_else(|| {
            Error::Device(format!("harness ports {:?} are all busy", self.ports))
        })?;

        let class = self.harness_class();
        log::info!("Starting harness {} on port {}", class, self.port);
        self.hdc_spawn(&[
            "shell",
            "aa",
            "test",
            "-b",
            HARNESS_BUNDLE,
            "-m",
            HARNESS_MODULE,
            "-s",
            "unittest",
            HARNESS_RUNNER,
            "-s",
            "class",
            class.as_str(),
            "-s",
            "timeout",
            HARNESS_RUN_TIMEOUT_MS,
        ])
    }

    /// [`Device::ensure_harness`] as a step of session setup: any failure is
    /// reported as [`Error::Connect`].
    pub fn bootstrap(&mut self, force_stop: bool) -> Result<()> {
        self.ensure_harness(force_stop).map_err(|e| match e {
            Error::Connect(_) => e,
            other => Error::Connect(format!(
                "harness bootstrap on '{}' failed: {}",
                self.device_id, other
            )),
        })
    }

    /// Kill every harness process.
    pub fn stop_harness(&self) -> Result<()> {
        let pids = self.processes(HARNESS_BUNDLE)?;
        if !pids.is_empty() {
            log::info!("Killing harness processes {:?}", pids);
        }
        self.kill(&pids)
    }

    /// Capture the screen on the device and copy the PNG to `local`.
    pub fn screenshot(&self, local: &Path) -> Result<()> {
        let capture = format!(
            "rm -rf {r};sync;uitest screenCap -p {r};sync",
            r = REMOTE_SCREENSHOT
        );
        let out = self.hdc(&["shell", capture.as_str()])?;
        let out = out.trim();
        if !out.starts_with(SCREENSHOT_OK_PREFIX) {
            return Err(Error::Device(format!("screenshot failed: {}", out)));
        }

        let local_str = local.to_string_lossy();
        self.hdc(&["file", "recv", REMOTE_SCREENSHOT, local_str.as_ref()])?;
        let deadline = Instant::now() + SCREENSHOT_WAIT;
        while !local.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        self.hdc(&["shell", "rm", "-rf", REMOTE_SCREENSHOT])?;

        if !local.exists() {
            return Err(Error::Device(format!(
                "screenshot not received at {}",
                local.display()
            )));
        }
        Ok(())
    }
}

impl<S: DeviceShell> Connector for Device<S> {
    type Conn = TcpConnection;

    /// Restart the harness if it died, re-forward its port and handshake,
    /// retrying until the handshake timeout.
    fn connect(&mut self) -> Result<TcpConnection> {
        log::info!("Connecting to harness on '{}'", self.device_id);
        self.bootstrap(false)?;

        let deadline = deadline_after(self.handshake_timeout);
        loop {
            let attempt = self
                .unforward(self.port)
                .and_then(|()| self.forward(self.port))
                .and_then(|()| {
                    log::debug!("{}", self.hdc(&["fport", "ls"])?.trim());
                    TcpConnection::open(self.port, deadline, self.buffer_size, self.send_timeout)
                        .map_err(Error::Transport)
                });
            match attempt {
                Ok(conn) => return Ok(conn),
                Err(e) => log::warn!("Harness connect attempt failed: {}", e),
            }
            if Instant::now() + CONNECT_BACKOFF >= deadline {
                break;
            }
            std::thread::sleep(CONNECT_BACKOFF);
        }
        Err(Error::Connect(format!(
            "harness handshake on port {} timed out after {:?}",
            self.port, self.handshake_timeout
        )))
    }
}
