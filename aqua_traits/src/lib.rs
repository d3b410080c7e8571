pub mod clock;
pub mod link;
pub mod random;

pub use clock::{Clock, MonotonicClock};
#[cfg(any(test, feature = "test-util"))]
pub use clock::test_clock::TestClock;
pub use link::{DeviceLink, LinkError};
pub use random::{RandomSource, SequenceRandom, SmallRandom};
