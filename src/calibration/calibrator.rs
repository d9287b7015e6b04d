use nalgebra::Matrix3;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::store::{CalibrationRecord, CalibrationStore, Extrinsics};
use crate::config::CalibrationConfig;
use crate::error::{MocapError, Result};

/// 1枚の画像から検出されたボードのコーナー
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CornerSet {
    /// (width, height)
    pub image_size: (u32, u32),
    /// コーナーのピクセル座標
    pub corners: Vec<[f32; 2]>,
    /// ボード上のコーナーID
    pub ids: Vec<i32>,
}

impl CornerSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// 内部パラメータの推定結果
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicSolution {
    pub intrinsic: Matrix3<f64>,
    pub dist_coeffs: Vec<f64>,
    pub reprojection_error: f64,
}

/// ボード検出とキャリブレーション計算のプリミティブ
///
/// 実装は `CharucoBoardDetector`（feature `opencv`）。
pub trait BoardDetector {
    /// 画像からコーナーを検出。ボードが見えなければ None
    fn detect(&self, image: &Path) -> Result<Option<CornerSet>>;

    /// 全画像のコーナーをまとめて1回で解く
    fn solve_intrinsics(&self, sets: &[CornerSet]) -> Result<IntrinsicSolution>;

    /// 1枚のコーナーからボードに対するカメラ姿勢を解く
    fn solve_pose(&self, set: &CornerSet, intrinsics: &IntrinsicSolution) -> Result<Option<Extrinsics>>;
}

/// 1台分のバッチキャリブレーション結果
#[derive(Debug, Clone)]
pub struct DeviceCalibration {
    pub device_id: String,
    pub images_used: usize,
    pub record: CalibrationRecord,
}

pub struct Calibrator<D> {
    detector: D,
    min_corners: usize,
    anchor_image: String,
}

/// `cam{N}` → `N`、`mobile_{sid}` はそのまま
pub fn device_id_from_dir(name: &str) -> Option<String> {
    if let Some(index) = name.strip_prefix("cam") {
        if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
            return Some(index.to_string());
        }
        return None;
    }
    if name.starts_with("mobile_") && name.len() > "mobile_".len() {
        return Some(name.to_string());
    }
    None
}

/// 端末IDから画像ディレクトリ名
pub fn device_dir_name(device_id: &str) -> String {
    if device_id.chars().all(|c| c.is_ascii_digit()) {
        format!("cam{}", device_id)
    } else {
        device_id.to_string()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
}

/// ディレクトリ内の画像（名前順）
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

impl<D: BoardDetector> Calibrator<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            min_corners: 6,
            anchor_image: "img_0000.jpg".to_string(),
        }
    }

    pub fn from_config(detector: D, config: &CalibrationConfig) -> Self {
        Self {
            detector,
            min_corners: config.min_corners,
            anchor_image: config.anchor_image.clone(),
        }
    }

    /// 内部パラメータキャリブレーション
    ///
    /// `min_corners` を超えるコーナーが取れた画像だけを集め、まとめて1回で解く。
    pub fn calibrate_intrinsics(&self, device_id: &str, images: &[PathBuf]) -> Result<(IntrinsicSolution, usize)> {
        let mut sets = Vec::new();
        for image in images {
            match self.detector.detect(image) {
                Ok(Some(set)) if set.len() > self.min_corners => sets.push(set),
                Ok(_) => {}
                Err(e) => warn!("{}: detection failed: {}", image.display(), e),
            }
        }

        if sets.is_empty() {
            return Err(MocapError::NoCornersDetected { device: device_id.to_string() });
        }

        info!("{}: solving intrinsics over {}/{} images", device_id, sets.len(), images.len());
        let solution = self.detector.solve_intrinsics(&sets)?;
        Ok((solution, sets.len()))
    }

    /// 原点フレーム1枚から外部パラメータを推定。ボードが見えなければ None
    pub fn estimate_pose(&self, image: &Path, intrinsics: &IntrinsicSolution) -> Result<Option<Extrinsics>> {
        if !image.exists() {
            return Ok(None);
        }
        match self.detector.detect(image)? {
            Some(set) if !set.is_empty() => self.detector.solve_pose(&set, intrinsics),
            _ => Ok(None),
        }
    }

    /// 1台分: 内部パラメータ → 原点フレームで外部パラメータ
    pub fn calibrate_device(&self, device_id: &str, dir: &Path) -> Result<DeviceCalibration> {
        let images = list_images(dir)?;
        let (intrinsics, images_used) = self.calibrate_intrinsics(device_id, &images)?;
        info!("{}: reprojection error {:.4}", device_id, intrinsics.reprojection_error);

        let anchor = dir.join(&self.anchor_image);
        // 原点フレームが使えなくても内部パラメータは残す
        let extrinsics = match self.estimate_pose(&anchor, &intrinsics) {
            Ok(Some(ext)) => {
                info!("{}: pose found", device_id);
                Some(ext)
            }
            Ok(None) => {
                warn!("{}: board not found in {}; keeping intrinsics only", device_id, anchor.display());
                None
            }
            Err(e) => {
                warn!("{}: pose estimation failed on {} ({}); keeping intrinsics only", device_id, anchor.display(), e);
                None
            }
        };

        Ok(DeviceCalibration {
            device_id: device_id.to_string(),
            images_used,
            record: CalibrationRecord {
                intrinsic: intrinsics.intrinsic,
                dist_coeffs: intrinsics.dist_coeffs,
                reprojection_error: Some(intrinsics.reprojection_error),
                extrinsics,
            },
        })
    }

    /// 全端末のバッチキャリブレーション
    ///
    /// `devices` が空なら `image_dir` 以下の `cam{N}` / `mobile_{sid}` をすべて対象にする。
    /// 失敗した端末はスキップし、成功した端末のフィールドを `store` に書き込む。
    pub fn calibrate_all(
        &self,
        image_dir: &Path,
        devices: &[String],
        store: &mut CalibrationStore,
    ) -> Result<Vec<DeviceCalibration>> {
        let devices = if devices.is_empty() {
            discover_devices(image_dir)?
        } else {
            devices.to_vec()
        };

        let mut results = Vec::new();
        for device_id in devices {
            let dir = image_dir.join(device_dir_name(&device_id));
            if !dir.is_dir() {
                warn!("{}: no image directory at {}", device_id, dir.display());
                continue;
            }
            match self.calibrate_device(&device_id, &dir) {
                Ok(result) => {
                    store.insert(&result.device_id, &result.record);
                    results.push(result);
                }
                Err(e) => warn!("{}: calibration failed: {}", device_id, e),
            }
        }
        Ok(results)
    }
}

/// 画像ディレクトリ以下の端末ID（ソート済み）
pub fn discover_devices(image_dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(image_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(device_id_from_dir) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// ファイル名 → コーナー数 の表で振る舞う検出器
    struct FakeDetector {
        corners: HashMap<String, usize>,
        solved_with: RefCell<Vec<usize>>,
    }

    impl FakeDetector {
        fn new(entries: &[(&str, usize)]) -> Self {
            Self {
                corners: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                solved_with: RefCell::new(Vec::new()),
            }
        }
    }

    impl BoardDetector for FakeDetector {
        fn detect(&self, image: &Path) -> Result<Option<CornerSet>> {
            let name = image.file_name().unwrap().to_str().unwrap();
            let n = self.corners.get(name).copied().unwrap_or(0);
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(CornerSet {
                image_size: (640, 480),
                corners: vec![[0.0, 0.0]; n],
                ids: (0..n as i32).collect(),
            }))
        }

        fn solve_intrinsics(&self, sets: &[CornerSet]) -> Result<IntrinsicSolution> {
            self.solved_with.borrow_mut().push(sets.len());
            Ok(IntrinsicSolution {
                intrinsic: Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0),
                dist_coeffs: vec![0.0; 5],
                reprojection_error: 0.25,
            })
        }

        fn solve_pose(&self, _set: &CornerSet, _intrinsics: &IntrinsicSolution) -> Result<Option<Extrinsics>> {
            Ok(Some(Extrinsics {
                rvec: Vector3::new(0.0, 0.1, 0.0),
                tvec: Vector3::new(0.0, 0.0, 2.0),
            }))
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_device_id_from_dir() {
        assert_eq!(device_id_from_dir("cam0"), Some("0".to_string()));
        assert_eq!(device_id_from_dir("cam12"), Some("12".to_string()));
        assert_eq!(device_id_from_dir("mobile_xyz"), Some("mobile_xyz".to_string()));
        assert_eq!(device_id_from_dir("camera"), None);
        assert_eq!(device_id_from_dir("mobile_"), None);
        assert_eq!(device_dir_name("3"), "cam3");
        assert_eq!(device_dir_name("mobile_xyz"), "mobile_xyz");
    }

    #[test]
    fn test_intrinsics_use_only_images_above_min_corners() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
        let detector = FakeDetector::new(&[("a.jpg", 12), ("b.jpg", 6), ("c.jpg", 7)]);
        let calibrator = Calibrator::new(detector);

        let images = list_images(dir.path()).unwrap();
        let (_, used) = calibrator.calibrate_intrinsics("0", &images).unwrap();

        assert_eq!(used, 2);
        // 1回の計算にまとめて渡される
        assert_eq!(*calibrator.detector.solved_with.borrow(), vec![2]);
    }

    #[test]
    fn test_no_corners_detected() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.jpg"]);
        let calibrator = Calibrator::new(FakeDetector::new(&[("a.jpg", 3)]));
        let images = list_images(dir.path()).unwrap();
        let err = calibrator.calibrate_intrinsics("0", &images).unwrap_err();
        assert!(matches!(err, MocapError::NoCornersDetected { device } if device == "0"));
    }

    #[test]
    fn test_batch_partial_calibration_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        // cam0: 原点フレームでボードが見える
        touch(&dir.path().join("cam0"), &["img_0000.jpg", "img_0001.jpg"]);
        // mobile_a: 原点フレームでは見えない
        touch(&dir.path().join("mobile_a"), &["img_0000.jpg", "img_0001.jpg"]);
        // cam1: どの画像でも足りない
        touch(&dir.path().join("cam1"), &["img_0001.jpg"]);
        touch(&dir.path().join("unrelated"), &["x.jpg"]);

        struct PerDir(FakeDetector);
        impl BoardDetector for PerDir {
            fn detect(&self, image: &Path) -> Result<Option<CornerSet>> {
                let parent = image.parent().unwrap().file_name().unwrap().to_str().unwrap();
                let name = image.file_name().unwrap().to_str().unwrap();
                match (parent, name) {
                    ("mobile_a", "img_0000.jpg") => Ok(None),
                    ("cam1", _) => Ok(None),
                    _ => self.0.detect(image),
                }
            }
            fn solve_intrinsics(&self, sets: &[CornerSet]) -> Result<IntrinsicSolution> {
                self.0.solve_intrinsics(sets)
            }
            fn solve_pose(&self, set: &CornerSet, i: &IntrinsicSolution) -> Result<Option<Extrinsics>> {
                self.0.solve_pose(set, i)
            }
        }

        let detector = PerDir(FakeDetector::new(&[("img_0000.jpg", 20), ("img_0001.jpg", 20)]));
        let calibrator = Calibrator::new(detector);
        let mut store = CalibrationStore::new();

        let results = calibrator.calibrate_all(dir.path(), &[], &mut store).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(store.calibrated_ids(), vec!["0".to_string(), "mobile_a".to_string()]);
        assert!(store.has_extrinsics("0"));
        assert!(!store.has_extrinsics("mobile_a"));
        assert!(store.record("1").unwrap().is_none());
    }

    #[test]
    fn test_anchor_error_keeps_intrinsics() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("cam0"), &["img_0000.jpg", "img_0001.jpg", "img_0002.jpg"]);

        /// 原点フレームだけ読めない検出器
        struct BrokenAnchor(FakeDetector);
        impl BoardDetector for BrokenAnchor {
            fn detect(&self, image: &Path) -> Result<Option<CornerSet>> {
                if image.file_name().and_then(|n| n.to_str()) == Some("img_0000.jpg") {
                    return Err(MocapError::Board("could not read image".to_string()));
                }
                self.0.detect(image)
            }
            fn solve_intrinsics(&self, sets: &[CornerSet]) -> Result<IntrinsicSolution> {
                self.0.solve_intrinsics(sets)
            }
            fn solve_pose(&self, set: &CornerSet, i: &IntrinsicSolution) -> Result<Option<Extrinsics>> {
                self.0.solve_pose(set, i)
            }
        }

        let detector = BrokenAnchor(FakeDetector::new(&[("img_0001.jpg", 20), ("img_0002.jpg", 20)]));
        let calibrator = Calibrator::new(detector);
        let mut store = CalibrationStore::new();

        let results = calibrator.calibrate_all(dir.path(), &[], &mut store).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].images_used, 2);
        assert!(results[0].record.extrinsics.is_none());
        assert_eq!(store.calibrated_ids(), vec!["0".to_string()]);
        assert!(!store.has_extrinsics("0"));
    }

    #[test]
    fn test_missing_anchor_image() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["img_0005.jpg"]);
        let calibrator = Calibrator::new(FakeDetector::new(&[("img_0005.jpg", 20)]));
        let result = calibrator.calibrate_device("0", dir.path()).unwrap();
        assert!(result.record.extrinsics.is_none());
        assert_eq!(result.record.reprojection_error, Some(0.25));
    }
}
