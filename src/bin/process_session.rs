use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use multiview_mocap::config::Config;
use multiview_mocap::pose::OpenPoseEstimator;
use multiview_mocap::session::{SessionPipeline, SessionStage};

const CONFIG_PATH: &str = "config.toml";

/// 録画済みセッションを同期・三角測量・平滑化してCSVに書き出す
#[derive(Parser, Debug)]
#[command(version = env!("GIT_VERSION"), about, long_about = None)]
struct Cli {
    /// シーン名
    #[arg(long)]
    scene: String,

    /// テイク名
    #[arg(long)]
    take: String,

    /// ローカルカメラ番号
    #[arg(long, num_args = 1.., default_values_t = [0u32, 1])]
    cams: Vec<u32>,

    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// 設定のフレームレートを上書き
    #[arg(long)]
    fps: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multiview_mocap=info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(fps) = cli.fps {
        if fps <= 0.0 {
            bail!("fps must be positive: {}", fps);
        }
        config.session.fps = fps;
    }

    println!("=== セッション処理 ({}) ===", env!("GIT_VERSION"));
    println!("  シーン: {} / テイク: {}", cli.scene, cli.take);
    println!("  カメラ: {:?}", cli.cams);
    println!("  fps: {}", config.session.fps);
    println!("  推定器: {}", config.estimator.binary.display());
    println!("  キャリブレーション: {}", config.calibration.store_path.display());
    println!();

    let estimator = OpenPoseEstimator::from_config(&config.estimator);
    let pipeline = SessionPipeline::with_store_from_config(config, estimator)?;
    let report = pipeline.process_session(&cli.scene, &cli.take, &cli.cams)?;

    println!();
    match report.sync_time {
        Some(t) => println!("同期: {:.3}秒 (開始フレーム {})", t, report.start_frame),
        None => println!("同期: 検出できず (開始フレーム 0)"),
    }
    for view in &report.views {
        println!(
            "  {} オフセット {:+.3}秒 キャリブレーション {}",
            view.name,
            view.offset,
            view.calibration_id.as_deref().unwrap_or("-")
        );
    }
    println!("有効ビュー: {}/{}", report.eligible_views.len(), report.views.len());
    println!("フレーム数: {} → 出力 {} 行", report.frame_range, report.rows);
    if let Some(err) = report.max_reprojection_error {
        println!("最大再投影誤差: {:.3}px", err);
    }
    for d in &report.degradations {
        println!("  警告: {:?}", d);
    }
    if report.stage == SessionStage::CleanedUp {
        println!("完了: {}", report.output.display());
    }
    Ok(())
}
