// Exchange clock estimation
pub mod clock_sync;

pub use clock_sync::{ClockError, ClockOffset, ClockStatus, ClockSync};
