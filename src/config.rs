use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{MocapError, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub triangulation: TriangulationConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// ビュー名 → キャリブレーションID の明示的な対応表（命名規則より優先）
    #[serde(default)]
    pub calibration_ids: BTreeMap<String, String>,
}

/// 同期イベントが見つからないストリームの扱い
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingSyncPolicy {
    /// オフセット0として扱う
    #[default]
    Zero,
    /// セッションから除外する
    Exclude,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// 動画のフレームレート
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// 関節数（BODY_25）
    #[serde(default = "default_joint_count")]
    pub joint_count: usize,
    /// ローカルカメラの録画と基準音声の場所
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,
    /// リモート端末からのアップロード先
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// キーポイントJSONの一時ディレクトリを作る場所
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// CSV出力先
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_local_video_ext")]
    pub local_video_ext: String,
    #[serde(default)]
    pub missing_sync_policy: MissingSyncPolicy,
    /// リモートストリームのオフセットをフレーム参照に反映するか
    #[serde(default = "default_true")]
    pub apply_stream_offsets: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// 正規化後の振幅に対するピーク閾値
    #[serde(default = "default_height_threshold")]
    pub height_threshold: f32,
    /// ピーク間の最小間隔（秒）。これより近いピークは残響とみなす
    #[serde(default = "default_min_event_spacing")]
    pub min_event_spacing: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriangulationConfig {
    /// これ未満の信頼度の観測は欠損扱い
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// 三角測量前に歪み補正を行う
    #[serde(default)]
    pub undistort: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// 小さくするとジッターが減る
    #[serde(default = "default_min_cutoff")]
    pub min_cutoff: f64,
    /// 大きくすると遅延が減る
    #[serde(default)]
    pub beta: f64,
    #[serde(default = "default_d_cutoff")]
    pub d_cutoff: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EstimatorConfig {
    #[serde(default = "default_estimator_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_net_resolution")]
    pub net_resolution: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// ChArUco辞書タイプ (e.g. "DICT_6X6_250")
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    /// 横マス数
    #[serde(default = "default_squares_x")]
    pub squares_x: i32,
    /// 縦マス数
    #[serde(default = "default_squares_y")]
    pub squares_y: i32,
    /// マス辺長（メートル）
    #[serde(default = "default_square_length")]
    pub square_length: f32,
    /// マーカー辺長（メートル）
    #[serde(default = "default_marker_length")]
    pub marker_length: f32,
    /// 端末ごとのキャリブレーション画像ディレクトリの親
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// 保存先パス
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// この数を超えるコーナーが検出された画像だけを使う
    #[serde(default = "default_min_corners")]
    pub min_corners: usize,
    /// 世界原点を決める画像（全端末で同じ瞬間に撮影したもの）
    #[serde(default = "default_anchor_image")]
    pub anchor_image: String,
}

fn default_fps() -> f64 { 30.0 }
fn default_joint_count() -> usize { 25 }
fn default_video_dir() -> PathBuf { PathBuf::from(".") }
fn default_upload_dir() -> PathBuf { PathBuf::from("uploads") }
fn default_work_dir() -> PathBuf { PathBuf::from(".") }
fn default_output_dir() -> PathBuf { PathBuf::from("MocapExports") }
fn default_local_video_ext() -> String { "mp4".to_string() }
fn default_true() -> bool { true }
fn default_height_threshold() -> f32 { 0.5 }
fn default_min_event_spacing() -> f64 { 0.1 }
fn default_confidence_threshold() -> f64 { 0.1 }
fn default_min_cutoff() -> f64 { 1.0 }
fn default_d_cutoff() -> f64 { 1.0 }
fn default_estimator_binary() -> PathBuf { PathBuf::from("bin/OpenPoseDemo.exe") }
fn default_net_resolution() -> String { "-1x320".to_string() }
fn default_dictionary() -> String { "DICT_6X6_250".to_string() }
fn default_squares_x() -> i32 { 5 }
fn default_squares_y() -> i32 { 7 }
fn default_square_length() -> f32 { 0.04 }
fn default_marker_length() -> f32 { 0.02 }
fn default_image_dir() -> PathBuf { PathBuf::from("calibration_images") }
fn default_store_path() -> PathBuf { PathBuf::from("calibration.json") }
fn default_min_corners() -> usize { 6 }
fn default_anchor_image() -> String { "img_0000.jpg".to_string() }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            joint_count: default_joint_count(),
            video_dir: default_video_dir(),
            upload_dir: default_upload_dir(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            local_video_ext: default_local_video_ext(),
            missing_sync_policy: MissingSyncPolicy::default(),
            apply_stream_offsets: default_true(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            height_threshold: default_height_threshold(),
            min_event_spacing: default_min_event_spacing(),
        }
    }
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            undistort: false,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_cutoff: default_min_cutoff(),
            beta: 0.0,
            d_cutoff: default_d_cutoff(),
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            binary: default_estimator_binary(),
            net_resolution: default_net_resolution(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dictionary: default_dictionary(),
            squares_x: default_squares_x(),
            squares_y: default_squares_y(),
            square_length: default_square_length(),
            marker_length: default_marker_length(),
            image_dir: default_image_dir(),
            store_path: default_store_path(),
            min_corners: default_min_corners(),
            anchor_image: default_anchor_image(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// ファイルが無いときだけ警告してデフォルト設定を使う
    ///
    /// 書式や値の誤りはエラー。誤った設定のまま既定のディレクトリで
    /// 処理・削除を進めないため。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Err(MocapError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} not found; using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fps = self.session.fps;
        if !(fps.is_finite() && fps > 0.0) {
            return Err(MocapError::InvalidConfig(format!("session.fps must be positive, got {}", fps)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.session.fps, 30.0);
        assert_eq!(config.session.joint_count, 25);
        assert_eq!(config.sync.height_threshold, 0.5);
        assert_eq!(config.triangulation.confidence_threshold, 0.1);
        assert_eq!(config.calibration.min_corners, 6);
        assert_eq!(config.session.missing_sync_policy, MissingSyncPolicy::Zero);
        assert!(config.calibration_ids.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [session]
            fps = 60.0
            missing_sync_policy = "exclude"

            [filter]
            min_cutoff = 0.5
            beta = 0.02

            [calibration_ids]
            "Scene_001_phoneA_1700000000" = "mobile_abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.fps, 60.0);
        assert_eq!(config.session.joint_count, 25);
        assert_eq!(config.session.missing_sync_policy, MissingSyncPolicy::Exclude);
        assert_eq!(config.filter.min_cutoff, 0.5);
        assert_eq!(config.filter.d_cutoff, 1.0);
        assert_eq!(
            config.calibration_ids.get("Scene_001_phoneA_1700000000").map(String::as_str),
            Some("mobile_abc")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.toml").unwrap();
        assert_eq!(config.session.fps, 30.0);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session]\nvideo_dir = \"recordings\"\nwork_dir = \n").unwrap();

        assert!(matches!(Config::load_or_default(&path), Err(MocapError::Config(_))));

        // 型違いも既定値に置き換えない
        fs::write(&path, "[session]\nfps = \"thirty\"\n").unwrap();
        assert!(matches!(Config::load_or_default(&path), Err(MocapError::Config(_))));
    }

    #[test]
    fn test_non_positive_fps_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        for fps in ["0.0", "-30.0", "nan"] {
            fs::write(&path, format!("[session]\nfps = {}\n", fps)).unwrap();
            let err = Config::load(&path).unwrap_err();
            assert!(matches!(err, MocapError::InvalidConfig(_)), "fps = {}: {:?}", fps, err);
        }

        fs::write(&path, "[session]\nfps = 60.0\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().session.fps, 60.0);
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.session.output_dir, PathBuf::from("MocapExports"));
        assert_eq!(config.estimator.net_resolution, "-1x320");
        assert_eq!(config.calibration.dictionary, "DICT_6X6_250");
    }
}
