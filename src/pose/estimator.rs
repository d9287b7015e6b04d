use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use crate::config::EstimatorConfig;
use crate::error::{MocapError, Result};

/// 動画から1フレーム1JSONの2Dキーポイントを書き出す外部推定器
pub trait KeypointEstimator {
    /// `video` を処理し、`output_dir` にフレームごとのJSONを書き出すまでブロックする
    fn estimate(&self, video: &Path, output_dir: &Path) -> Result<()>;
}

/// OpenPoseのデモバイナリを呼び出す推定器
pub struct OpenPoseEstimator {
    binary: PathBuf,
    net_resolution: String,
    extra_args: Vec<String>,
}

impl OpenPoseEstimator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            net_resolution: "-1x320".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            net_resolution: config.net_resolution.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn command(&self, video: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--video")
            .arg(video)
            .arg("--write_json")
            .arg(output_dir)
            .args(["--display", "0", "--render_pose", "0"])
            .arg("--net_resolution")
            .arg(&self.net_resolution)
            .args(&self.extra_args);
        cmd
    }
}

impl KeypointEstimator for OpenPoseEstimator {
    fn estimate(&self, video: &Path, output_dir: &Path) -> Result<()> {
        fs::create_dir_all(output_dir)?;
        info!("running {} on {}", self.binary.display(), video.display());

        let status = match self.command(video, output_dir).status() {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MocapError::Estimator(format!(
                    "binary not found: {}",
                    self.binary.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !status.success() {
            return Err(MocapError::Estimator(format!(
                "{} exited with {}",
                self.binary.display(),
                status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_arguments() {
        let est = OpenPoseEstimator::from_config(&EstimatorConfig {
            binary: PathBuf::from("openpose"),
            net_resolution: "-1x368".to_string(),
            extra_args: vec!["--number_people_max".to_string(), "1".to_string()],
        });
        let cmd = est.command(Path::new("a.mp4"), Path::new("out"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "--video", "a.mp4", "--write_json", "out", "--display", "0", "--render_pose",
                "0", "--net_resolution", "-1x368", "--number_people_max", "1"
            ]
        );
    }

    #[test]
    fn test_missing_binary_is_estimator_error() {
        let dir = tempfile::tempdir().unwrap();
        let est = OpenPoseEstimator::new(dir.path().join("no-such-openpose"));
        let err = est
            .estimate(Path::new("video.mp4"), &dir.path().join("json"))
            .unwrap_err();
        assert!(matches!(err, MocapError::Estimator(_)));
    }
}
