use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use multiview_mocap::calibration::{CalibrationStore, Calibrator, CharucoBoardDetector};
use multiview_mocap::config::Config;
use multiview_mocap::MocapError;

const CONFIG_PATH: &str = "config.toml";

/// 保存済みの画像からChArUcoキャリブレーションを行い、ストアを更新する
#[derive(Parser, Debug)]
#[command(version = env!("GIT_VERSION"), about, long_about = None)]
struct Cli {
    /// 対象の端末ID（省略時は画像ディレクトリ以下をすべて）
    /// e.g. calibrate 0 1 mobile_abc
    devices: Vec<String>,

    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// 外部パラメータをこの端末の座標系に付け替える
    #[arg(long)]
    reanchor: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multiview_mocap=info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let cal_config = &config.calibration;

    println!("=== ChArUco キャリブレーションツール ({}) ===", env!("GIT_VERSION"));
    println!();
    println!("ボード設定:");
    println!("  辞書: {}", cal_config.dictionary);
    println!("  マス数: {}x{}", cal_config.squares_x, cal_config.squares_y);
    println!("  マス辺長: {}m", cal_config.square_length);
    println!("  マーカー辺長: {}m", cal_config.marker_length);
    println!("  画像: {}", cal_config.image_dir.display());
    println!("  出力先: {}", cal_config.store_path.display());
    println!();

    // [1/3] 既存のストア
    println!("[1/3] ストア読み込み...");
    let mut store = match CalibrationStore::load(&cal_config.store_path) {
        Ok(store) => store,
        Err(MocapError::MissingInput { .. }) => {
            println!("  新規作成");
            CalibrationStore::new()
        }
        Err(e) => return Err(e).context("failed to load calibration store"),
    };

    // [2/3] 端末ごとのキャリブレーション
    println!("[2/3] キャリブレーション中...");
    let detector = CharucoBoardDetector::from_config(cal_config)?;
    let calibrator = Calibrator::from_config(detector, cal_config);
    let results = calibrator.calibrate_all(&cal_config.image_dir, &cli.devices, &mut store)?;
    if results.is_empty() {
        bail!("キャリブレーションできた端末がありません");
    }
    for r in &results {
        println!(
            "  {}: {}枚 再投影誤差 {:.4} {}",
            r.device_id,
            r.images_used,
            r.record.reprojection_error.unwrap_or(f64::NAN),
            if r.record.extrinsics.is_some() { "外部パラメータあり" } else { "内部パラメータのみ" }
        );
    }

    if let Some(reference) = &cli.reanchor {
        if !store.reanchor(reference)? {
            bail!("{} に外部パラメータがありません", reference);
        }
        println!("  {} を原点に付け替えました", reference);
    }

    // [3/3] 保存
    println!("[3/3] 保存中...");
    store.save(&cal_config.store_path)?;
    println!("  {} 台: {:?}", store.calibrated_ids().len(), store.calibrated_ids());
    println!("完了");
    Ok(())
}
