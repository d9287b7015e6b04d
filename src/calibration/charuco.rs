use anyhow::{bail, Context};
use nalgebra::{Matrix3, Vector3};
use std::path::Path;

use opencv::{
    calib3d,
    core::{Mat, Point2f, Size, TermCriteria, TermCriteria_Type, Vector},
    imgcodecs,
    objdetect::{self, CharucoBoard, CharucoDetector, Dictionary, PredefinedDictionaryType},
    prelude::*,
};

use super::calibrator::{BoardDetector, CornerSet, IntrinsicSolution};
use super::store::Extrinsics;
use crate::config::CalibrationConfig;
use crate::error::{MocapError, Result};

// --- 辞書ヘルパー ---

pub fn parse_dictionary(name: &str) -> anyhow::Result<Dictionary> {
    let dict_type = match name {
        "DICT_4X4_50" => PredefinedDictionaryType::DICT_4X4_50,
        "DICT_4X4_100" => PredefinedDictionaryType::DICT_4X4_100,
        "DICT_4X4_250" => PredefinedDictionaryType::DICT_4X4_250,
        "DICT_5X5_50" => PredefinedDictionaryType::DICT_5X5_50,
        "DICT_5X5_100" => PredefinedDictionaryType::DICT_5X5_100,
        "DICT_5X5_250" => PredefinedDictionaryType::DICT_5X5_250,
        "DICT_6X6_50" => PredefinedDictionaryType::DICT_6X6_50,
        "DICT_6X6_100" => PredefinedDictionaryType::DICT_6X6_100,
        "DICT_6X6_250" => PredefinedDictionaryType::DICT_6X6_250,
        "DICT_6X6_1000" => PredefinedDictionaryType::DICT_6X6_1000,
        _ => bail!("Unknown dictionary: {}", name),
    };
    objdetect::get_predefined_dictionary(dict_type).context("Failed to get predefined dictionary")
}

fn board_error(e: anyhow::Error) -> MocapError {
    MocapError::Board(format!("{:#}", e))
}

/// OpenCVのChArUcoボードによる検出・キャリブレーション
pub struct CharucoBoardDetector {
    board: CharucoBoard,
    detector: CharucoDetector,
}

impl CharucoBoardDetector {
    pub fn from_config(config: &CalibrationConfig) -> anyhow::Result<Self> {
        let dict = parse_dictionary(&config.dictionary)?;
        let size = Size::new(config.squares_x, config.squares_y);
        let mut board = CharucoBoard::new_def(size, config.square_length, config.marker_length, &dict)
            .context("Failed to create CharucoBoard")?;
        // 旧OpenCVで印刷したボードとの互換
        board.set_legacy_pattern(true)?;

        let detector = create_detector(&board)?;
        Ok(Self { board, detector })
    }

    fn detect_impl(&self, image: &Path) -> anyhow::Result<Option<CornerSet>> {
        let path = image.to_str().context("non UTF-8 image path")?;
        let gray = imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE)
            .with_context(|| format!("imread failed: {}", path))?;
        if gray.empty() {
            bail!("could not read image {}", path);
        }

        let mut corners = Mat::default();
        let mut ids = Mat::default();
        self.detector
            .detect_board_def(&gray, &mut corners, &mut ids)
            .context("detect_board failed")?;

        let n = ids.rows();
        if n <= 0 {
            return Ok(None);
        }

        let mut set = CornerSet {
            image_size: (gray.cols() as u32, gray.rows() as u32),
            corners: Vec::with_capacity(n as usize),
            ids: Vec::with_capacity(n as usize),
        };
        for i in 0..n {
            let p = corners.at::<Point2f>(i)?;
            set.corners.push([p.x, p.y]);
            set.ids.push(*ids.at::<i32>(i)?);
        }
        Ok(Some(set))
    }

    /// 3D-2D 対応を構築
    fn match_points(&self, set: &CornerSet) -> anyhow::Result<(Mat, Mat)> {
        let corners: Vector<Point2f> = set.corners.iter().map(|c| Point2f::new(c[0], c[1])).collect();
        let ids: Vector<i32> = set.ids.iter().copied().collect();

        let mut obj_pts = Mat::default();
        let mut img_pts = Mat::default();
        self.board
            .match_image_points(&corners, &ids, &mut obj_pts, &mut img_pts)
            .context("match_image_points failed")?;
        Ok((obj_pts, img_pts))
    }

    fn solve_intrinsics_impl(&self, sets: &[CornerSet]) -> anyhow::Result<IntrinsicSolution> {
        let Some(first) = sets.first() else {
            bail!("No calibration frames provided");
        };

        let mut all_obj_points = Vector::<Mat>::new();
        let mut all_img_points = Vector::<Mat>::new();
        for set in sets {
            let (obj_pts, img_pts) = self.match_points(set)?;
            if obj_pts.rows() >= 4 {
                all_obj_points.push(obj_pts);
                all_img_points.push(img_pts);
            }
        }
        if all_obj_points.is_empty() {
            bail!("No frames with matched board points");
        }

        let mut camera_matrix = Mat::default();
        let mut dist_coeffs = Mat::default();
        let mut rvecs = Mat::default();
        let mut tvecs = Mat::default();

        let criteria = TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            100,
            1e-6,
        )?;

        let image_size = Size::new(first.image_size.0 as i32, first.image_size.1 as i32);
        let error = calib3d::calibrate_camera(
            &all_obj_points,
            &all_img_points,
            image_size,
            &mut camera_matrix,
            &mut dist_coeffs,
            &mut rvecs,
            &mut tvecs,
            0,
            criteria,
        )
        .context("calibrate_camera failed")?;

        Ok(IntrinsicSolution {
            intrinsic: Matrix3::from_row_slice(&mat3x3_to_array(&camera_matrix)?),
            dist_coeffs: mat_to_vec(&dist_coeffs)?,
            reprojection_error: error,
        })
    }

    fn solve_pose_impl(&self, set: &CornerSet, intrinsics: &IntrinsicSolution) -> anyhow::Result<Option<Extrinsics>> {
        let (obj_pts, img_pts) = self.match_points(set)?;
        if obj_pts.rows() < 6 {
            return Ok(None);
        }

        let k = intrinsics.intrinsic;
        let rows = [
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ];
        let camera_matrix = Mat::from_slice_2d(&rows)?;
        let dist_coeffs = Vector::<f64>::from_slice(&intrinsics.dist_coeffs);

        let mut rvec = Mat::default();
        let mut tvec = Mat::default();
        let ok = calib3d::solve_pnp(
            &obj_pts,
            &img_pts,
            &camera_matrix,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            false,
            calib3d::SOLVEPNP_ITERATIVE,
        )
        .context("solvePnP failed")?;

        if !ok {
            return Ok(None);
        }

        let r = mat_to_vec(&rvec)?;
        let t = mat_to_vec(&tvec)?;
        if r.len() != 3 || t.len() != 3 {
            bail!("unexpected pose shape: rvec {}, tvec {}", r.len(), t.len());
        }
        Ok(Some(Extrinsics {
            rvec: Vector3::new(r[0], r[1], r[2]),
            tvec: Vector3::new(t[0], t[1], t[2]),
        }))
    }
}

impl BoardDetector for CharucoBoardDetector {
    fn detect(&self, image: &Path) -> Result<Option<CornerSet>> {
        self.detect_impl(image).map_err(board_error)
    }

    fn solve_intrinsics(&self, sets: &[CornerSet]) -> Result<IntrinsicSolution> {
        self.solve_intrinsics_impl(sets).map_err(board_error)
    }

    fn solve_pose(&self, set: &CornerSet, intrinsics: &IntrinsicSolution) -> Result<Option<Extrinsics>> {
        self.solve_pose_impl(set, intrinsics).map_err(board_error)
    }
}

/// ChArUcoDetectorを作成（広角・斜め検出対応）
fn create_detector(board: &CharucoBoard) -> anyhow::Result<CharucoDetector> {
    use objdetect::{CharucoParameters, DetectorParameters, DetectorParametersTrait, RefineParameters};

    let mut det_params = DetectorParameters::default()?;
    // 歪んだ四角形をより寛容に受け入れる（デフォルト0.03）
    det_params.set_polygonal_approx_accuracy_rate(0.08);
    // 適応的閾値の探索範囲を広げる（デフォルト max=23）
    det_params.set_adaptive_thresh_win_size_max(53);

    let charuco_params = CharucoParameters::default()?;
    let refine_params = RefineParameters::new(10.0, 3.0, true)?;

    CharucoDetector::new(board, &charuco_params, &det_params, refine_params)
        .context("Failed to create CharucoDetector")
}

/// 3x3 Mat (f64) → [f64; 9] row-major
fn mat3x3_to_array(mat: &Mat) -> anyhow::Result<[f64; 9]> {
    if mat.rows() != 3 || mat.cols() != 3 {
        bail!("Expected 3x3 matrix, got {}x{}", mat.rows(), mat.cols());
    }
    let mut arr = [0.0f64; 9];
    for r in 0..3 {
        for c in 0..3 {
            arr[r * 3 + c] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(arr)
}

/// Vec<f64> from Mat (Nx1 or 1xN)
fn mat_to_vec(mat: &Mat) -> anyhow::Result<Vec<f64>> {
    let n = mat.rows().max(mat.cols()) as usize;
    let is_row = mat.rows() == 1;
    (0..n)
        .map(|i| {
            let val = if is_row {
                *mat.at_2d::<f64>(0, i as i32)?
            } else {
                *mat.at_2d::<f64>(i as i32, 0)?
            };
            Ok(val)
        })
        .collect()
}
