use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

const REMOTE_VIDEO_EXTS: [&str; 4] = ["webm", "mp4", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// PCに接続したカメラ
    Local,
    /// ネットワーク越しに参加した端末
    Remote,
}

/// セッション中の1視点
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    /// 動画ファイルのステム。キーポイントJSONの名前にも使われる
    pub name: String,
    pub kind: ViewKind,
    /// ローカルはカメラ番号、リモートは端末ID
    pub device: String,
    pub video: PathBuf,
    /// 基準クロックに対するオフセット（秒）
    pub offset: f64,
    pub calibration_id: Option<String>,
}

impl View {
    /// `{scene}_{take}_cam{index}.{ext}`
    pub fn local(video_dir: &Path, scene: &str, take: &str, index: u32, ext: &str) -> Self {
        let name = format!("{}_{}_cam{}", scene, take, index);
        Self {
            video: video_dir.join(format!("{}.{}", name, ext)),
            name,
            kind: ViewKind::Local,
            device: index.to_string(),
            offset: 0.0,
            calibration_id: None,
        }
    }

    pub fn remote(recording: &RemoteRecording, offset: f64) -> Self {
        Self {
            name: recording.stem.clone(),
            kind: ViewKind::Remote,
            device: recording.device_id.clone(),
            video: recording.path.clone(),
            offset,
            calibration_id: None,
        }
    }

    /// キーポイントJSONの一時ディレクトリ
    pub fn keypoint_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("temp_{}", self.name))
    }

    /// 基準フレーム番号 → この視点のフレーム番号
    pub fn frame_shift(&self, fps: f64) -> i64 {
        (self.offset * fps).round() as i64
    }
}

/// リモート端末からアップロードされた録画
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecording {
    pub device_id: String,
    pub timestamp: String,
    pub stem: String,
    pub path: PathBuf,
}

impl RemoteRecording {
    /// 同じステムの音声（`<stem>.wav`）
    pub fn audio_sidecar(&self) -> PathBuf {
        self.path.with_extension("wav")
    }
}

/// `{scene}_{take}_{device_id}_{timestamp}` を分解する
///
/// ローカルカメラ (`cam{N}`) や基準音声 (`audio`) の名前は対象外。
pub fn parse_remote_stem(stem: &str, scene: &str, take: &str) -> Option<(String, String)> {
    let rest = stem.strip_prefix(&format!("{}_{}_", scene, take))?;
    let (device, timestamp) = rest.rsplit_once('_')?;
    if device.is_empty() || timestamp.is_empty() || !timestamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((device.to_string(), timestamp.to_string()))
}

/// アップロード先からこのセッションのリモート録画を探す
pub fn discover_remote(upload_dir: &Path, scene: &str, take: &str) -> Result<Vec<RemoteRecording>> {
    if !upload_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut recordings = Vec::new();
    for entry in fs::read_dir(upload_dir)? {
        let path = entry?.path();
        let is_video = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| REMOTE_VIDEO_EXTS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_video {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if let Some((device_id, timestamp)) = parse_remote_stem(&stem, scene, take) {
            recordings.push(RemoteRecording {
                device_id,
                timestamp,
                stem,
                path,
            });
        }
    }
    recordings.sort_by(|a, b| a.stem.cmp(&b.stem));
    Ok(recordings)
}

/// 視点 → キャリブレーションID の対応
pub trait CalibrationIdResolver {
    fn calibration_id(&self, view: &View) -> Option<String>;
}

/// 命名規則による対応（明示的な表があれば優先）
///
/// ローカルはカメラ番号、リモートは `mobile_{device_id}`。
#[derive(Debug, Clone, Default)]
pub struct ConventionResolver {
    overrides: BTreeMap<String, String>,
}

impl ConventionResolver {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }
}

impl CalibrationIdResolver for ConventionResolver {
    fn calibration_id(&self, view: &View) -> Option<String> {
        if let Some(id) = self.overrides.get(&view.name) {
            return Some(id.clone());
        }
        Some(match view.kind {
            ViewKind::Local => view.device.clone(),
            ViewKind::Remote => format!("mobile_{}", view.device),
        })
    }
}

impl CalibrationIdResolver for BTreeMap<String, String> {
    fn calibration_id(&self, view: &View) -> Option<String> {
        self.get(&view.name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_view_naming() {
        let view = View::local(Path::new("rec"), "Scene", "001", 2, "mp4");
        assert_eq!(view.name, "Scene_001_cam2");
        assert_eq!(view.video, Path::new("rec/Scene_001_cam2.mp4"));
        assert_eq!(view.keypoint_dir(Path::new("work")), Path::new("work/temp_Scene_001_cam2"));
        assert_eq!(view.device, "2");
    }

    #[test]
    fn test_parse_remote_stem() {
        assert_eq!(
            parse_remote_stem("Scene_001_phoneA_1700000000123", "Scene", "001"),
            Some(("phoneA".to_string(), "1700000000123".to_string()))
        );
        // 端末IDにアンダースコアを含む場合
        assert_eq!(
            parse_remote_stem("Scene_001_my_phone_42", "Scene", "001"),
            Some(("my_phone".to_string(), "42".to_string()))
        );
        assert_eq!(parse_remote_stem("Scene_002_phoneA_1", "Scene", "001"), None);
        assert_eq!(parse_remote_stem("Scene_001_cam0", "Scene", "001"), None);
        assert_eq!(parse_remote_stem("Scene_001_audio", "Scene", "001"), None);
    }

    #[test]
    fn test_discover_remote_filters_session_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "Scene_001_phoneB_200.webm",
            "Scene_001_phoneA_100.webm",
            "Scene_001_phoneA_100.wav",
            "Scene_002_phoneA_100.webm",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let found = discover_remote(dir.path(), "Scene", "001").unwrap();
        let stems: Vec<_> = found.iter().map(|r| r.stem.as_str()).collect();
        assert_eq!(stems, ["Scene_001_phoneA_100", "Scene_001_phoneB_200"]);
        assert_eq!(found[0].audio_sidecar(), dir.path().join("Scene_001_phoneA_100.wav"));

        assert!(discover_remote(&dir.path().join("missing"), "Scene", "001").unwrap().is_empty());
    }

    #[test]
    fn test_convention_resolver() {
        let local = View::local(Path::new("."), "S", "1", 0, "mp4");
        let recording = RemoteRecording {
            device_id: "phoneA".to_string(),
            timestamp: "5".to_string(),
            stem: "S_1_phoneA_5".to_string(),
            path: PathBuf::from("uploads/S_1_phoneA_5.webm"),
        };
        let remote = View::remote(&recording, 0.5);

        let resolver = ConventionResolver::default();
        assert_eq!(resolver.calibration_id(&local), Some("0".to_string()));
        assert_eq!(resolver.calibration_id(&remote), Some("mobile_phoneA".to_string()));

        let mut overrides = BTreeMap::new();
        overrides.insert("S_1_phoneA_5".to_string(), "mobile_sid123".to_string());
        let resolver = ConventionResolver::new(overrides.clone());
        assert_eq!(resolver.calibration_id(&remote), Some("mobile_sid123".to_string()));

        // 表だけの対応では、載っていない視点は未較正
        assert_eq!(overrides.calibration_id(&local), None);
    }

    #[test]
    fn test_frame_shift() {
        let mut view = View::local(Path::new("."), "S", "1", 0, "mp4");
        view.offset = 1.0;
        assert_eq!(view.frame_shift(30.0), 30);
        view.offset = -0.51;
        assert_eq!(view.frame_shift(30.0), -15);
    }
}
