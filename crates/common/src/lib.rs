//! Common types shared by the credential pool crates

mod clock;
mod error;
pub mod fs;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
