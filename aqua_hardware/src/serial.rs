use std::time::Duration;

use aqua_traits::{DeviceLink, LinkError};
use rppal::uart::{Parity, Uart};

use crate::error::{HwError, Result};

/// 8N1 UART link to the tank microcontroller.
pub struct SerialLink {
    port: String,
    baud: u32,
    uart: Option<Uart>,
    read_timeout: Option<Duration>,
    chunk: [u8; 256],
}

impl SerialLink {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            uart: None,
            read_timeout: None,
            chunk: [0; 256],
        }
    }

    fn serial_err(&self, e: impl std::fmt::Display) -> HwError {
        HwError::Serial {
            port: self.port.clone(),
            reason: e.to_string(),
        }
    }

    fn try_open(&mut self) -> Result<()> {
        let uart = Uart::with_path(&self.port, self.baud, Parity::None, 8, 1)
            .map_err(|e| self.serial_err(e))?;
        self.uart = Some(uart);
        self.read_timeout = None;
        Ok(())
    }

    fn try_read(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<usize> {
        let Some(uart) = self.uart.as_mut() else {
            return Err(HwError::NotOpen);
        };
        if self.read_timeout != Some(timeout) {
            // Block for at most `timeout` waiting for the first byte.
            uart.set_read_mode(0, timeout).map_err(|e| HwError::Serial {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;
            self.read_timeout = Some(timeout);
        }
        let mut total = 0;
        loop {
            let n = uart.read(&mut self.chunk).map_err(|e| HwError::Serial {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;
            buf.extend_from_slice(&self.chunk[..n]);
            total += n;
            if n < self.chunk.len() {
                break;
            }
        }
        Ok(total)
    }

    fn try_write(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(uart) = self.uart.as_mut() else {
            return Err(HwError::NotOpen);
        };
        let written = uart.write(bytes).map_err(|e| HwError::Serial {
            port: self.port.clone(),
            reason: e.to_string(),
        })?;
        if written != bytes.len() {
            return Err(HwError::ShortWrite {
                written,
                len: bytes.len(),
            });
        }
        Ok(())
    }
}

impl DeviceLink for SerialLink {
    fn open(&mut self) -> std::result::Result<(), LinkError> {
        self.try_open()?;
        tracing::debug!(port = %self.port, baud = self.baud, "uart configured");
        Ok(())
    }

    fn close(&mut self) {
        self.uart = None;
    }

    fn is_open(&self) -> bool {
        self.uart.is_some()
    }

    fn read_into(
        &mut self,
        buf: &mut Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<usize, LinkError> {
        Ok(self.try_read(buf, timeout)?)
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        Ok(self.try_write(bytes)?)
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud)
    }
}
