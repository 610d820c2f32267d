pub mod logger;
pub mod time;

pub use logger::init_logging;
pub use time::{format_duration, unix_ms, unix_secs_f64};
