//! Device Gateway: owns the serial link, decodes telemetry and rewrites the
//! latched command state on every write-back tick.
//!
//! The gateway is polled from the control loop. A closed or failed link is
//! reopened on a fixed interval forever; the device is local and recovers.
use crate::error::ProtocolError;
use crate::protocol::{self, Command, DeviceLine, LightForce, TelemetryFrame};
use aqua_traits::DeviceLink;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bytes buffered without a newline before the buffer is discarded as noise.
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct GatewayTiming {
    /// Delay between open attempts while the link is down.
    pub reopen_interval: Duration,
    /// Longest wait for the first byte in one poll.
    pub read_timeout: Duration,
}

impl Default for GatewayTiming {
    fn default() -> Self {
        Self {
            reopen_interval: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(10),
        }
    }
}

/// Lock-free counters, readable from any thread while the loop runs.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    serial_port_errors: AtomicU64,
    open_attempts: AtomicU64,
    is_open: AtomicBool,
    frames_received: AtomicU64,
    crc_errors: AtomicU64,
    version_mismatches: AtomicU64,
    debug_messages: AtomicU64,
    commands_written: AtomicU64,
}

impl GatewayCounters {
    pub fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            serial_port_errors: self.serial_port_errors.load(Ordering::Relaxed),
            open_attempts: self.open_attempts.load(Ordering::Relaxed),
            is_open: self.is_open.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            version_mismatches: self.version_mismatches.load(Ordering::Relaxed),
            debug_messages: self.debug_messages.load(Ordering::Relaxed),
            commands_written: self.commands_written.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`GatewayCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub serial_port_errors: u64,
    pub open_attempts: u64,
    pub is_open: bool,
    pub frames_received: u64,
    pub crc_errors: u64,
    pub version_mismatches: u64,
    pub debug_messages: u64,
    pub commands_written: u64,
}

/// Command state rewritten to the device on every flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandLatch {
    pub required_co2_open: Option<bool>,
    pub light: LightForce,
    pub force_co2_off: bool,
}

impl CommandLatch {
    fn commands(&self) -> Vec<Command> {
        let mut out = Vec::with_capacity(3);
        if self.force_co2_off {
            out.push(Command::ForceCo2Off);
        }
        if let Some(open) = self.required_co2_open {
            out.push(Command::RequiredCo2Valve(open));
        }
        out.push(Command::Light(self.light));
        out
    }
}

pub struct DeviceGateway<L: DeviceLink> {
    link: L,
    timing: GatewayTiming,
    rx: Vec<u8>,
    next_open_at: Option<Instant>,
    latch: CommandLatch,
    counters: Arc<GatewayCounters>,
    version_warned: bool,
}

impl<L: DeviceLink> core::fmt::Debug for DeviceGateway<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceGateway")
            .field("link", &self.link.describe())
            .field("latch", &self.latch)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl<L: DeviceLink> DeviceGateway<L> {
    pub fn new(link: L, timing: GatewayTiming) -> Self {
        Self {
            link,
            timing,
            rx: Vec::with_capacity(256),
            next_open_at: None,
            latch: CommandLatch::default(),
            counters: Arc::new(GatewayCounters::default()),
            version_warned: false,
        }
    }

    pub fn counters(&self) -> Arc<GatewayCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> GatewayStats {
        self.counters.snapshot()
    }

    pub fn latch(&self) -> CommandLatch {
        self.latch
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn set_required_co2_valve_state(&mut self, open: bool) {
        self.latch.required_co2_open = Some(open);
    }

    pub fn force_co2_off(&mut self, forced: bool) {
        self.latch.force_co2_off = forced;
    }

    pub fn force_light(&mut self, force: LightForce) {
        self.latch.light = force;
    }

    /// Open or reopen the link when due, then drain and decode available lines.
    pub fn poll(&mut self, now: Instant) -> Vec<TelemetryFrame> {
        if !self.link.is_open() {
            self.try_open(now);
            if !self.link.is_open() {
                return Vec::new();
            }
        }

        let timeout = self.timing.read_timeout;
        if let Err(e) = self.link.read_into(&mut self.rx, timeout) {
            self.fail(now, "read", e.as_ref());
            return Vec::new();
        }

        let mut frames = Vec::new();
        while let Some(nl) = self.rx.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.rx.drain(..=nl).collect();
            let text = String::from_utf8_lossy(&line);
            self.handle_line(&text, &mut frames);
        }
        if self.rx.len() > MAX_LINE_BYTES {
            tracing::warn!(bytes = self.rx.len(), "discarding unterminated device input");
            self.rx.clear();
            GatewayCounters::bump(&self.counters.crc_errors);
        }
        frames
    }

    /// Rewrite the latched command state. Returns true when bytes went out.
    pub fn flush_commands(&mut self, now: Instant) -> bool {
        let cmds = self.latch.commands();
        self.write_commands(now, &cmds)
    }

    /// Send the local clock as deciseconds since midnight.
    pub fn sync_clock(&mut self, now: Instant, ds_since_midnight: u32) -> bool {
        let cmds = protocol::clock_commands(ds_since_midnight);
        self.write_commands(now, &cmds)
    }

    pub fn close(&mut self) {
        if self.link.is_open() {
            self.link.close();
            tracing::info!(link = %self.link.describe(), "serial link closed");
        }
        self.counters.is_open.store(false, Ordering::Relaxed);
        self.rx.clear();
    }

    fn write_commands(&mut self, now: Instant, cmds: &[Command]) -> bool {
        if !self.link.is_open() {
            return false;
        }
        let payload: String = cmds.iter().map(Command::encode).collect();
        match self.link.write_all(payload.as_bytes()) {
            Ok(()) => {
                self.counters
                    .commands_written
                    .fetch_add(cmds.len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.fail(now, "write", e.as_ref());
                false
            }
        }
    }

    fn try_open(&mut self, now: Instant) {
        if self.next_open_at.is_some_and(|t| now < t) {
            return;
        }
        self.next_open_at = Some(now + self.timing.reopen_interval);
        GatewayCounters::bump(&self.counters.open_attempts);
        match self.link.open() {
            Ok(()) => {
                tracing::info!(link = %self.link.describe(), "serial link opened");
                self.counters.is_open.store(true, Ordering::Relaxed);
                self.rx.clear();
                self.version_warned = false;
            }
            Err(e) => {
                GatewayCounters::bump(&self.counters.serial_port_errors);
                tracing::warn!(link = %self.link.describe(), error = %e, "serial link open failed");
            }
        }
    }

    fn fail(&mut self, now: Instant, op: &str, e: &(dyn std::error::Error + Send + Sync)) {
        GatewayCounters::bump(&self.counters.serial_port_errors);
        tracing::error!(link = %self.link.describe(), op, error = %e, "serial link error");
        self.link.close();
        self.counters.is_open.store(false, Ordering::Relaxed);
        self.rx.clear();
        self.next_open_at = Some(now + self.timing.reopen_interval);
    }

    fn handle_line(&mut self, text: &str, frames: &mut Vec<TelemetryFrame>) {
        match protocol::decode_line(text) {
            Ok(DeviceLine::Status(frame)) => {
                GatewayCounters::bump(&self.counters.frames_received);
                if !frame.version_matches() {
                    GatewayCounters::bump(&self.counters.version_mismatches);
                    if !self.version_warned {
                        self.version_warned = true;
                        tracing::warn!(
                            device = frame.version,
                            host = protocol::PROTOCOL_VERSION,
                            "protocol version mismatch; decoding best effort"
                        );
                    }
                }
                frames.push(frame);
            }
            Ok(DeviceLine::Debug(bytes)) => {
                GatewayCounters::bump(&self.counters.debug_messages);
                tracing::debug!(?bytes, "device debug");
            }
            Err(ProtocolError::Empty) => {}
            Err(e) => {
                GatewayCounters::bump(&self.counters.crc_errors);
                tracing::debug!(error = %e, "dropping device line");
            }
        }
    }
}
