pub mod estimator;
pub mod keypoint;

pub use estimator::{KeypointEstimator, OpenPoseEstimator};
pub use keypoint::{
    count_keypoint_frames, keypoint_file_name, read_keypoint_file, Keypoint,
};
