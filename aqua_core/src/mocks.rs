//! Test doubles for driving the gateway and runtime without hardware.
use aqua_traits::{DeviceLink, LinkError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ScriptState {
    /// Chunks handed out one per read.
    pub incoming: VecDeque<Vec<u8>>,
    /// Everything written by the host.
    pub written: Vec<u8>,
    /// Remaining open attempts that fail before one succeeds.
    pub failing_opens: usize,
    /// Fail the next read once, as an unplugged cable would.
    pub fail_next_read: bool,
    pub open: bool,
    pub opens: usize,
}

/// [`DeviceLink`] backed by a shared script. Clones share the same state, so
/// a test keeps one handle while the gateway owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLink {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn push_line(&self, line: impl AsRef<[u8]>) {
        self.state().incoming.push_back(line.as_ref().to_vec());
    }

    /// Drain and return what the host wrote so far.
    pub fn take_written(&self) -> String {
        let bytes = std::mem::take(&mut self.state().written);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl DeviceLink for ScriptedLink {
    fn open(&mut self) -> Result<(), LinkError> {
        let mut s = self.state();
        if s.failing_opens > 0 {
            s.failing_opens -= 1;
            return Err("port unavailable".into());
        }
        s.open = true;
        s.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn read_into(&mut self, buf: &mut Vec<u8>, _timeout: Duration) -> Result<usize, LinkError> {
        let mut s = self.state();
        if s.fail_next_read {
            s.fail_next_read = false;
            return Err("device disconnected".into());
        }
        match s.incoming.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.state().written.extend_from_slice(bytes);
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}
