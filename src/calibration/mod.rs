pub mod calibrator;
#[cfg(feature = "opencv")]
pub mod charuco;
pub mod store;

pub use calibrator::{BoardDetector, Calibrator, CornerSet, DeviceCalibration, IntrinsicSolution};
#[cfg(feature = "opencv")]
pub use charuco::CharucoBoardDetector;
pub use store::{CalibrationRecord, CalibrationStore, Extrinsics};
