mod buffer;
mod calibration;
mod config;
mod controller;
mod device;
mod error;
mod session;
mod simulated;
mod tui;
mod utils;
mod writer;

pub use buffer::*;
pub use calibration::*;
pub use config::*;
pub use controller::*;
pub use device::*;
pub use error::*;
pub use session::*;
pub use simulated::*;
pub use tui::*;
pub use utils::*;
pub use writer::*;
