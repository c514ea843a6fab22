pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{IpvaultError, IpvaultResult};
pub use types::{ContentAddress, Credential};
