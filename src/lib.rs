pub mod calibration;
pub mod config;
pub mod error;
pub mod pose;
pub mod session;
pub mod sync;
pub mod tracker;
pub mod triangulation;

pub use error::{MocapError, Result};
