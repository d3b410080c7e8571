use std::time::Duration;

pub type LinkError = Box<dyn std::error::Error + Send + Sync>;

/// Byte-level serial channel to the tank microcontroller.
///
/// Reads never block longer than `timeout`; a closed or failed channel is
/// reopened by the caller on its own schedule.
pub trait DeviceLink {
    fn open(&mut self) -> Result<(), LinkError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    /// Append whatever bytes are available into `buf`, waiting at most
    /// `timeout` for the first one. Returns the number of bytes appended.
    fn read_into(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<usize, LinkError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Human-readable endpoint name for logs.
    fn describe(&self) -> String {
        "device".to_string()
    }
}

impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    fn open(&mut self) -> Result<(), LinkError> {
        (**self).open()
    }
    fn close(&mut self) {
        (**self).close()
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn read_into(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> Result<usize, LinkError> {
        (**self).read_into(buf, timeout)
    }
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write_all(bytes)
    }
    fn describe(&self) -> String {
        (**self).describe()
    }
}
