use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// キーポイントJSONのファイル名サフィックス
pub const KEYPOINT_FILE_SUFFIX: &str = "_keypoints.json";

/// 単一キーポイント（ピクセル座標）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    /// 信頼度スコア (0.0〜1.0)
    pub confidence: f64,
}

impl Keypoint {
    pub fn new(x: f64, y: f64, confidence: f64) -> Self {
        Self { x, y, confidence }
    }

    /// 信頼度が閾値以上か
    pub fn is_valid(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

#[derive(Debug, Deserialize)]
struct OpenPoseFrame {
    #[serde(default)]
    people: Vec<OpenPosePerson>,
}

#[derive(Debug, Deserialize)]
struct OpenPosePerson {
    #[serde(default)]
    pose_keypoints_2d: Vec<f64>,
}

/// `{stem}_{frame:012}_keypoints.json`
pub fn keypoint_file_name(video_stem: &str, frame: usize) -> String {
    format!("{}_{:012}{}", video_stem, frame, KEYPOINT_FILE_SUFFIX)
}

/// 1フレーム分のキーポイントJSONを読む
///
/// 複数人検出されていても先頭の1人だけを使う（人物の対応付けはしない）。
/// ファイルが無い・人物がいない場合は空リスト（全関節が遮蔽扱い）。
pub fn read_keypoint_file(path: &Path) -> Result<Vec<Keypoint>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let frame: OpenPoseFrame = serde_json::from_str(&content)?;

    let Some(person) = frame.people.into_iter().next() else {
        return Ok(Vec::new());
    };

    Ok(person
        .pose_keypoints_2d
        .chunks_exact(3)
        .map(|c| Keypoint::new(c[0], c[1], c[2]))
        .collect())
}

/// ディレクトリ内のキーポイントJSONの数
///
/// ディレクトリが無ければ0。
pub fn count_keypoint_frames(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(KEYPOINT_FILE_SUFFIX))
        {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypoint_file_name_padding() {
        assert_eq!(
            keypoint_file_name("Scene_001_cam0", 42),
            "Scene_001_cam0_000000000042_keypoints.json"
        );
    }

    #[test]
    fn test_read_first_person_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        fs::write(
            &path,
            r#"{"version":1.3,"people":[
                {"pose_keypoints_2d":[10.0,20.0,0.9, 30.0,40.0,0.05]},
                {"pose_keypoints_2d":[1.0,2.0,1.0]}
            ]}"#,
        )
        .unwrap();

        let kps = read_keypoint_file(&path).unwrap();
        assert_eq!(kps.len(), 2);
        assert_eq!(kps[0], Keypoint::new(10.0, 20.0, 0.9));
        assert!(!kps[1].is_valid(0.1));
    }

    #[test]
    fn test_read_missing_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_keypoint_file(&dir.path().join("none.json")).unwrap().is_empty());

        let path = dir.path().join("empty.json");
        fs::write(&path, r#"{"people":[]}"#).unwrap();
        assert!(read_keypoint_file(&path).unwrap().is_empty());
    }

    #[test]
    fn test_count_keypoint_frames() {
        let dir = tempfile::tempdir().unwrap();
        for f in 0..4 {
            fs::write(dir.path().join(keypoint_file_name("v", f)), "{}").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(count_keypoint_frames(dir.path()).unwrap(), 4);
        assert_eq!(count_keypoint_frames(&dir.path().join("missing")).unwrap(), 0);
    }
}
