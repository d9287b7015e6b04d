use nalgebra::{DMatrix, Matrix3, Matrix3x4, Rotation3, Vector3, Vector4};

use crate::config::TriangulationConfig;
use crate::pose::Keypoint;

/// 三角測量された3D点
pub type Point3 = Vector3<f64>;

/// 較正済みカメラ（射影行列 P = K[R|t]）
///
/// 再構成の間だけ存在する派生データ。内部・外部パラメータが揃ったビューにのみ作る。
#[derive(Debug, Clone)]
pub struct CameraParams {
    pub projection: Matrix3x4<f64>,
    intrinsic: Matrix3<f64>,
    /// 歪み係数 [k1, k2, p1, p2, k3]
    dist_coeffs: [f64; 5],
}

impl CameraParams {
    /// キャリブレーション結果から射影行列を構築
    ///
    /// - rvec: 回転ベクトル (Rodrigues)
    /// - dist_coeffs: 足りない係数は0とみなす
    pub fn from_calibration(
        intrinsic: &Matrix3<f64>,
        dist_coeffs: &[f64],
        rvec: &Vector3<f64>,
        tvec: &Vector3<f64>,
    ) -> Self {
        let r = Rotation3::new(*rvec);

        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
        rt.set_column(3, tvec);

        let mut dc = [0.0; 5];
        for (dst, src) in dc.iter_mut().zip(dist_coeffs) {
            *dst = *src;
        }

        Self {
            projection: intrinsic * rt,
            intrinsic: *intrinsic,
            dist_coeffs: dc,
        }
    }

    /// 3D点をピクセル座標へ投影。カメラ平面上の点は None
    pub fn project(&self, point: &Point3) -> Option<(f64, f64)> {
        let p = self.projection * Vector4::new(point.x, point.y, point.z, 1.0);
        if p.z.abs() < 1e-12 {
            return None;
        }
        Some((p.x / p.z, p.y / p.z))
    }

    /// 歪んだピクセル座標を歪み補正して理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        let fx = self.intrinsic[(0, 0)];
        let fy = self.intrinsic[(1, 1)];
        let cx = self.intrinsic[(0, 2)];
        let cy = self.intrinsic[(1, 2)];
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;

        if self.dist_coeffs.iter().all(|&k| k == 0.0) || fx == 0.0 || fy == 0.0 {
            return (u_dist, v_dist);
        }

        // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
        let xd = (u_dist - cx) / fx;
        let yd = (v_dist - cy) / fy;

        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
            let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            if residual < 1e-20 {
                break;
            }

            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = j01;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j10;
            if det.abs() < 1e-15 {
                break;
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j10 * fx_val + j00 * fy_val) / det;
        }

        (best.0 * fx + cx, best.1 * fy + cy)
    }
}

/// 単一関節のDLT三角測量
///
/// ビューごとに観測 (u, v) か None を1つ受け取る。各観測について
/// `u·P2 − P0` と `v·P2 − P1` を連立方程式に積み、最小特異値に対応する
/// 右特異ベクトルを同次座標の解とする。
///
/// 有効な観測が2未満、または第4成分が0（無限遠点）なら None。
pub fn reconstruct(
    projections: &[&Matrix3x4<f64>],
    observations: &[Option<(f64, f64)>],
) -> Option<Point3> {
    let rows: Vec<_> = projections
        .iter()
        .zip(observations)
        .filter_map(|(p, obs)| obs.map(|(u, v)| (*p, u, v)))
        .filter(|(_, u, v)| u.is_finite() && v.is_finite())
        .collect();

    if rows.len() < 2 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * rows.len(), 4);
    for (i, (p, u, v)) in rows.iter().enumerate() {
        a.row_mut(2 * i).copy_from(&(*u * p.row(2) - p.row(0)));
        a.row_mut(2 * i + 1).copy_from(&(*v * p.row(2) - p.row(1)));
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(min_idx);

    // 解は単位ベクトルなので絶対値で判定できる
    let w = x[3];
    if w.abs() < 1e-12 {
        return None;
    }

    let point = Point3::new(x[0] / w, x[1] / w, x[2] / w);
    point.iter().all(|c| c.is_finite()).then_some(point)
}

/// 再投影誤差の最大値（ピクセル）。診断用
pub fn max_reprojection_error(
    cameras: &[&CameraParams],
    observations: &[Option<(f64, f64)>],
    point: &Point3,
) -> Option<f64> {
    let mut max_err: Option<f64> = None;
    for (cam, obs) in cameras.iter().zip(observations) {
        let Some((u_obs, v_obs)) = obs else { continue };
        let (u, v) = cam.project(point)?;
        let err = ((u - u_obs).powi(2) + (v - v_obs).powi(2)).sqrt();
        max_err = Some(max_err.map_or(err, |m| m.max(err)));
    }
    max_err
}

/// フレーム単位の三角測量
pub struct Triangulator {
    confidence_threshold: f64,
    undistort: bool,
}

impl Triangulator {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            undistort: false,
        }
    }

    pub fn from_config(config: &TriangulationConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            undistort: config.undistort,
        }
    }

    /// 閾値未満の信頼度は欠損扱い（重み付けはしない）
    fn observation(&self, camera: &CameraParams, kp: Option<&Keypoint>) -> Option<(f64, f64)> {
        let kp = kp.filter(|kp| kp.is_valid(self.confidence_threshold))?;
        if self.undistort {
            Some(camera.undistort_point(kp.x, kp.y))
        } else {
            Some((kp.x, kp.y))
        }
    }

    /// 全関節を独立に三角測量
    ///
    /// ビューごとの関節リストは同じ並び（先頭の1人分）を前提とする。
    /// 空リストのビューはそのフレームの全関節が欠損として扱われる。
    pub fn reconstruct_frame(
        &self,
        cameras: &[&CameraParams],
        keypoints: &[&[Keypoint]],
        joint_count: usize,
    ) -> Vec<Option<Point3>> {
        debug_assert_eq!(cameras.len(), keypoints.len());
        let projections: Vec<_> = cameras.iter().map(|c| &c.projection).collect();

        (0..joint_count)
            .map(|joint| {
                let observations: Vec<_> = cameras
                    .iter()
                    .zip(keypoints)
                    .map(|(cam, kps)| self.observation(cam, kps.get(joint)))
                    .collect();
                reconstruct(&projections, &observations)
            })
            .collect()
    }

    /// 復元済みの全関節についての最大再投影誤差（ピクセル）
    ///
    /// 三角測量に使ったのと同じ観測（閾値・歪み補正込み）と比べる。
    /// 比べられる関節が無ければ None。
    pub fn frame_reprojection_error(
        &self,
        cameras: &[&CameraParams],
        keypoints: &[&[Keypoint]],
        points: &[Option<Point3>],
    ) -> Option<f64> {
        points
            .iter()
            .enumerate()
            .filter_map(|(joint, point)| {
                let point = point.as_ref()?;
                let observations: Vec<_> = cameras
                    .iter()
                    .zip(keypoints)
                    .map(|(cam, kps)| self.observation(cam, kps.get(joint)))
                    .collect();
                max_reprojection_error(cameras, &observations, point)
            })
            .reduce(f64::max)
    }
}
