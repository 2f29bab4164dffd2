pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WidgetConfig;
pub use error::{PalaverError, Result};
pub use types::*;
