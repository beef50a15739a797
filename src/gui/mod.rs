//! Terminal front end for the `monitor` binary.

mod error;
mod session_monitor;

pub use error::MonitorError;
pub use session_monitor::session_monitor;
