use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{MocapError, Result};
use crate::triangulation::CameraParams;

const MTX: &str = "mtx";
const DIST: &str = "dist";
const RET: &str = "ret";
const RVEC: &str = "rvec";
const TVEC: &str = "tvec";

/// 外部パラメータ（ボード座標系 → カメラ座標系）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    /// 回転ベクトル (Rodrigues)
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

/// 1台分のキャリブレーション結果
///
/// 内部パラメータがあれば較正済み、外部パラメータがあれば世界原点に固定済み。
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub intrinsic: Matrix3<f64>,
    pub dist_coeffs: Vec<f64>,
    pub reprojection_error: Option<f64>,
    pub extrinsics: Option<Extrinsics>,
}

impl CalibrationRecord {
    /// 内部・外部パラメータが揃っていれば射影行列を作る
    pub fn camera_params(&self) -> Option<CameraParams> {
        let ext = self.extrinsics.as_ref()?;
        Some(CameraParams::from_calibration(
            &self.intrinsic,
            &self.dist_coeffs,
            &ext.rvec,
            &ext.tvec,
        ))
    }
}

/// 端末ごとのキャリブレーションを `{field}_{id}` → 数値配列 の平坦なアーカイブとして持つ
///
/// キーが無いことだけが「未較正」を表す。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationStore {
    entries: BTreeMap<String, Vec<f64>>,
}

fn key(field: &str, id: &str) -> String {
    format!("{}_{}", field, id)
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MocapError::MissingInput { path: path.to_path_buf() });
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 生のエントリ
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// 内部パラメータを持つ端末ID（ソート済み）
    pub fn calibrated_ids(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter_map(|k| k.strip_prefix("mtx_"))
            .map(str::to_string)
            .collect()
    }

    pub fn has_extrinsics(&self, id: &str) -> bool {
        self.entries.contains_key(&key(RVEC, id)) && self.entries.contains_key(&key(TVEC, id))
    }

    fn vec3(&self, field: &str, id: &str) -> Result<Option<Vector3<f64>>> {
        let k = key(field, id);
        match self.entries.get(&k) {
            None => Ok(None),
            Some(v) if v.len() == 3 => Ok(Some(Vector3::new(v[0], v[1], v[2]))),
            Some(v) => Err(MocapError::Archive {
                key: k,
                reason: format!("expected 3 values, got {}", v.len()),
            }),
        }
    }

    /// 端末のキャリブレーションを取得。内部パラメータが無ければ None
    pub fn record(&self, id: &str) -> Result<Option<CalibrationRecord>> {
        let mtx_key = key(MTX, id);
        let Some(mtx) = self.entries.get(&mtx_key) else {
            return Ok(None);
        };
        if mtx.len() != 9 {
            return Err(MocapError::Archive {
                key: mtx_key,
                reason: format!("expected 9 values, got {}", mtx.len()),
            });
        }

        let extrinsics = match (self.vec3(RVEC, id)?, self.vec3(TVEC, id)?) {
            (Some(rvec), Some(tvec)) => Some(Extrinsics { rvec, tvec }),
            _ => None,
        };

        Ok(Some(CalibrationRecord {
            intrinsic: Matrix3::from_row_slice(mtx),
            dist_coeffs: self.entries.get(&key(DIST, id)).cloned().unwrap_or_default(),
            reprojection_error: self.entries.get(&key(RET, id)).and_then(|v| v.first().copied()),
            extrinsics,
        }))
    }

    /// 内部・外部パラメータが揃っていれば射影行列を作る
    pub fn camera_params(&self, id: &str) -> Result<Option<CameraParams>> {
        Ok(self.record(id)?.and_then(|r| r.camera_params()))
    }

    /// レコードのフィールドをすべて書き込む（外部パラメータが無ければ既存のものを消す）
    pub fn insert(&mut self, id: &str, record: &CalibrationRecord) {
        let row_major: Vec<f64> = record.intrinsic.transpose().iter().copied().collect();
        self.entries.insert(key(MTX, id), row_major);
        self.entries.insert(key(DIST, id), record.dist_coeffs.clone());
        match record.reprojection_error {
            Some(err) => self.entries.insert(key(RET, id), vec![err]),
            None => self.entries.remove(&key(RET, id)),
        };
        match &record.extrinsics {
            Some(ext) => {
                self.entries.insert(key(RVEC, id), ext.rvec.iter().copied().collect());
                self.entries.insert(key(TVEC, id), ext.tvec.iter().copied().collect());
            }
            None => {
                self.entries.remove(&key(RVEC, id));
                self.entries.remove(&key(TVEC, id));
            }
        }
    }

    /// 全端末の外部パラメータを基準端末の座標系に付け替える
    ///
    /// R_rel = R_i · R_0ᵀ, t_rel = t_i − R_rel · t_0。基準端末に外部パラメータが
    /// 無ければ何もせず false。
    pub fn reanchor(&mut self, reference_id: &str) -> Result<bool> {
        let (Some(r0), Some(t0)) = (self.vec3(RVEC, reference_id)?, self.vec3(TVEC, reference_id)?) else {
            return Ok(false);
        };
        let r0_t = Rotation3::new(r0).inverse();

        for id in self.calibrated_ids() {
            let (Some(ri), Some(ti)) = (self.vec3(RVEC, &id)?, self.vec3(TVEC, &id)?) else {
                continue;
            };
            let r_rel = Rotation3::new(ri) * r0_t;
            let t_rel = ti - r_rel * t0;
            self.entries.insert(key(RVEC, &id), r_rel.scaled_axis().iter().copied().collect());
            self.entries.insert(key(TVEC, &id), t_rel.iter().copied().collect());
        }
        Ok(true)
    }
}
