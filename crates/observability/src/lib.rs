//! Logging setup shared by the simulator's binaries.

mod logging;

pub use logging::{init, init_with, LogFormat};
