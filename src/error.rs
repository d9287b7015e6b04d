use std::path::PathBuf;

use thiserror::Error;

/// パイプライン全体で使うエラー型
///
/// 同期イベント未検出・キャリブレーション欠落・有効ビュー不足などの
/// 劣化ケースはエラーではなくログとレポートで扱う。
#[derive(Debug, Error)]
pub enum MocapError {
    #[error("required input is missing: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("no usable calibration corners detected for device {device}")]
    NoCornersDetected { device: String },

    #[error("keypoint estimator failed: {0}")]
    Estimator(String),

    #[error("exported track table failed verification: {}", path.display())]
    ExportVerification { path: PathBuf },

    #[error("fiducial primitive failed: {0}")]
    Board(String),

    #[error("invalid calibration archive entry {key}: {reason}")]
    Archive { key: String, reason: String },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, MocapError>;
