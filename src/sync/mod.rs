//! 音声による録画どうしの同期
//!
//! テイク冒頭の拍手を全ストリームの共通時刻とし、基準音声とのずれを
//! ストリームごとのオフセットとして求める。

pub mod aligner;
pub mod detector;

pub use aligner::{Aligner, StreamOffset};
pub use detector::{AudioTrack, SyncDetector};
