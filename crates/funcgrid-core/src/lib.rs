pub mod config;
pub mod promise;
pub mod signal;
pub mod status;
pub mod types;

pub use config::ControlConfig;
pub use promise::{CancelSignal, Promise};
pub use signal::Signal;
pub use status::{Status, StatusCode};
pub use types::*;
