use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::triangulation::Point3;

const AXES: [&str; 3] = ["X", "Y", "Z"];

/// 平滑化済みの3Dトラック（1行1フレーム）
#[derive(Debug, Clone, PartialEq)]
pub struct TrackTable {
    joint_count: usize,
    rows: Vec<Vec<f64>>,
}

impl TrackTable {
    pub fn new(joint_count: usize) -> Self {
        Self {
            joint_count,
            rows: Vec::new(),
        }
    }

    /// `Time, Bone_0_X, Bone_0_Y, Bone_0_Z, Bone_1_X, ...`
    pub fn header(&self) -> Vec<String> {
        std::iter::once("Time".to_string())
            .chain((0..self.joint_count).flat_map(|i| AXES.iter().map(move |axis| format!("Bone_{}_{}", i, axis))))
            .collect()
    }

    /// 足りない関節は0で埋め、余分な関節は捨てる
    pub fn push_frame(&mut self, timestamp: f64, joints: &[Point3]) {
        let mut row = Vec::with_capacity(1 + self.joint_count * 3);
        row.push(timestamp);
        for i in 0..self.joint_count {
            let p = joints.get(i).copied().unwrap_or_else(Point3::zeros);
            row.extend([p.x, p.y, p.z]);
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// CSVとして書き出す（行が無くてもヘッダは書く）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.header())?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// 出力ファイルが存在し、空でないこと
pub fn verify_export(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}
