pub mod export;
pub mod pipeline;
pub mod view;

pub use export::{verify_export, TrackTable};
pub use pipeline::{Degradation, SessionPipeline, SessionReport, SessionStage};
pub use view::{CalibrationIdResolver, ConventionResolver, RemoteRecording, View, ViewKind};
