use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::export::{verify_export, TrackTable};
use super::view::{discover_remote, CalibrationIdResolver, ConventionResolver, View};
use crate::calibration::CalibrationStore;
use crate::config::{Config, MissingSyncPolicy};
use crate::error::{MocapError, Result};
use crate::pose::{count_keypoint_frames, keypoint_file_name, read_keypoint_file, Keypoint, KeypointEstimator};
use crate::sync::{Aligner, AudioTrack, SyncDetector};
use crate::tracker::TemporalFilter;
use crate::triangulation::{CameraParams, Triangulator};

/// セッション処理の到達段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStage {
    Started,
    ViewsDiscovered,
    KeypointsReady,
    CalibrationLoaded,
    FrameRangeResolved,
    Reconstructed,
    Exported,
    CleanedUp,
}

/// 処理は続けたが結果の質が落ちた箇所
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    /// 基準音声が無い、またはイベントが見つからない（開始フレーム0）
    NoSyncEvent,
    /// リモートストリームのオフセットが求まらなかった
    StreamWithoutSync { view: String, excluded: bool },
    EstimatorFailure { view: String, message: String },
    /// 内部・外部パラメータが揃っていないビュー
    NoCalibration { view: String },
    /// 三角測量に使えるビューが2未満
    InsufficientViews { eligible: usize },
}

/// 1セッション分の処理結果
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub scene: String,
    pub take: String,
    pub stage: SessionStage,
    pub sync_time: Option<f64>,
    pub start_frame: usize,
    pub views: Vec<View>,
    /// 三角測量に使ったビュー名
    pub eligible_views: Vec<String>,
    /// 全有効ビューで共通のフレーム数
    pub frame_range: usize,
    pub rows: usize,
    /// 未平滑の復元点の最大再投影誤差（ピクセル）。診断用
    pub max_reprojection_error: Option<f64>,
    pub output: PathBuf,
    pub degradations: Vec<Degradation>,
}

impl SessionReport {
    fn advance(&mut self, stage: SessionStage) {
        debug!("{}_{}: {:?} -> {:?}", self.scene, self.take, self.stage, stage);
        self.stage = stage;
    }

    /// 一時ファイルと元動画の削除まで進んだか
    pub fn cleaned_up(&self) -> bool {
        self.stage == SessionStage::CleanedUp
    }
}

/// 有効ビューのうち最も短いフレーム数
pub fn resolve_frame_range(counts: &[usize]) -> usize {
    counts.iter().copied().min().unwrap_or(0)
}

/// 同期時刻 → 開始フレーム
pub fn start_frame_for(sync_time: f64, fps: f64) -> usize {
    (sync_time * fps).round().max(0.0) as usize
}

/// 録画済みセッション → 平滑化済み3DトラックのCSV
pub struct SessionPipeline<E: KeypointEstimator> {
    config: Config,
    estimator: E,
    resolver: Box<dyn CalibrationIdResolver>,
    store: CalibrationStore,
}

impl<E: KeypointEstimator> SessionPipeline<E> {
    pub fn new(config: Config, estimator: E, store: CalibrationStore) -> Self {
        let resolver = Box::new(ConventionResolver::new(config.calibration_ids.clone()));
        Self {
            config,
            estimator,
            resolver,
            store,
        }
    }

    /// ストアを設定のパスから読む。無ければ警告して空のストアで続ける
    pub fn with_store_from_config(config: Config, estimator: E) -> Result<Self> {
        let store = match CalibrationStore::load(&config.calibration.store_path) {
            Ok(store) => store,
            Err(MocapError::MissingInput { path }) => {
                warn!("calibration store {} not found; no view will be eligible", path.display());
                CalibrationStore::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new(config, estimator, store))
    }

    pub fn with_resolver(mut self, resolver: impl CalibrationIdResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn output_path(&self, scene: &str, take: &str) -> PathBuf {
        self.config.session.output_dir.join(format!("{}_{}.csv", scene, take))
    }

    /// 1セッションを最後まで処理する
    ///
    /// 動画の欠落と出力の検証失敗だけが致命的。同期・推定・キャリブレーションの
    /// 欠落は `SessionReport::degradations` に記録して続行する。一時ファイルと
    /// 元動画は出力を検証できた後にだけ削除する。
    pub fn process_session(&self, scene: &str, take: &str, cams: &[u32]) -> Result<SessionReport> {
        self.config.validate()?;
        let session = &self.config.session;
        let fps = session.fps;
        let mut report = SessionReport {
            scene: scene.to_string(),
            take: take.to_string(),
            stage: SessionStage::Started,
            sync_time: None,
            start_frame: 0,
            views: Vec::new(),
            eligible_views: Vec::new(),
            frame_range: 0,
            rows: 0,
            max_reprojection_error: None,
            output: self.output_path(scene, take),
            degradations: Vec::new(),
        };
        info!("processing session {}_{}", scene, take);

        // 同期
        let aligner = Aligner::new(SyncDetector::from_config(&self.config.sync));
        report.sync_time = self.reference_event(&aligner, scene, take);
        match report.sync_time {
            Some(t) => {
                report.start_frame = start_frame_for(t, fps);
                info!("sync at {:.3}s, starting at frame {}", t, report.start_frame);
            }
            None => {
                warn!("no sync event; starting at frame 0");
                report.degradations.push(Degradation::NoSyncEvent);
            }
        }

        // ビュー
        let mut views: Vec<View> = cams
            .iter()
            .map(|&i| View::local(&session.video_dir, scene, take, i, &session.local_video_ext))
            .collect();
        views.extend(self.remote_views(&aligner, report.sync_time, scene, take, &mut report.degradations)?);
        for view in &mut views {
            view.calibration_id = self.resolver.calibration_id(view);
        }
        report.advance(SessionStage::ViewsDiscovered);

        // 2Dキーポイント
        if let Some(view) = views.iter().find(|v| !v.video.exists()) {
            error!("video not found: {}", view.video.display());
            return Err(MocapError::MissingInput { path: view.video.clone() });
        }
        for view in &views {
            let out_dir = view.keypoint_dir(&session.work_dir);
            if let Err(e) = self.estimator.estimate(&view.video, &out_dir) {
                warn!("keypoint estimation failed for {}: {}", view.name, e);
                report.degradations.push(Degradation::EstimatorFailure {
                    view: view.name.clone(),
                    message: e.to_string(),
                });
            }
        }
        report.advance(SessionStage::KeypointsReady);

        // 射影行列
        let mut eligible: Vec<(&View, CameraParams)> = Vec::new();
        for view in &views {
            match self.camera_for(view) {
                Some(camera) => eligible.push((view, camera)),
                None => {
                    warn!("{} has no complete calibration; skipped", view.name);
                    report.degradations.push(Degradation::NoCalibration { view: view.name.clone() });
                }
            }
        }
        report.eligible_views = eligible.iter().map(|(v, _)| v.name.clone()).collect();
        report.advance(SessionStage::CalibrationLoaded);

        // 三角測量と平滑化
        let mut table = TrackTable::new(session.joint_count);
        if eligible.len() < 2 {
            warn!("{} calibrated view(s); at least 2 are needed, writing an empty table", eligible.len());
            report.degradations.push(Degradation::InsufficientViews { eligible: eligible.len() });
        } else {
            let mut counts = Vec::with_capacity(eligible.len());
            for (view, _) in &eligible {
                counts.push(count_keypoint_frames(&view.keypoint_dir(&session.work_dir))?);
            }
            report.frame_range = resolve_frame_range(&counts);
            report.advance(SessionStage::FrameRangeResolved);
            info!("frame range {} (per view: {:?})", report.frame_range, counts);

            report.max_reprojection_error =
                self.reconstruct(&eligible, report.start_frame, report.frame_range, &mut table);
            if let Some(err) = report.max_reprojection_error {
                info!("max reprojection error {:.3}px", err);
            }
            report.advance(SessionStage::Reconstructed);
        }
        report.rows = table.len();

        // 出力と検証
        if let Err(e) = table.write_csv(&report.output) {
            error!("failed to write {}: {}", report.output.display(), e);
            return Err(MocapError::ExportVerification { path: report.output });
        }
        if !verify_export(&report.output) {
            error!("export verification failed: {}", report.output.display());
            return Err(MocapError::ExportVerification { path: report.output });
        }
        report.advance(SessionStage::Exported);
        info!("exported {} rows to {}", report.rows, report.output.display());

        self.cleanup(&views);
        report.views = views;
        report.advance(SessionStage::CleanedUp);

        Ok(report)
    }

    fn reference_event(&self, aligner: &Aligner, scene: &str, take: &str) -> Option<f64> {
        let path = self.config.session.video_dir.join(format!("{}_{}_audio.wav", scene, take));
        match aligner.detector().find_event_in_file(&path) {
            Ok(event) => event,
            Err(e) => {
                warn!("reference audio unavailable: {}", e);
                None
            }
        }
    }

    fn remote_views(
        &self,
        aligner: &Aligner,
        reference_time: Option<f64>,
        scene: &str,
        take: &str,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Vec<View>> {
        let session = &self.config.session;
        let mut views = Vec::new();

        for recording in discover_remote(&session.upload_dir, scene, take)? {
            let offset = reference_time.and_then(|reference| {
                let track = match AudioTrack::load(&recording.audio_sidecar()) {
                    Ok(track) => track,
                    Err(e) => {
                        warn!("no audio for {}: {}", recording.stem, e);
                        return None;
                    }
                };
                aligner
                    .offsets_against(reference, [(recording.stem.as_str(), &track)])
                    .remove(&recording.stem)
            });

            let time_offset = match offset {
                Some(offset) => offset.time_offset,
                None => {
                    let excluded = session.missing_sync_policy == MissingSyncPolicy::Exclude;
                    degradations.push(Degradation::StreamWithoutSync {
                        view: recording.stem.clone(),
                        excluded,
                    });
                    if excluded {
                        warn!("{} has no sync offset; excluded", recording.stem);
                        continue;
                    }
                    warn!("{} has no sync offset; assuming 0", recording.stem);
                    0.0
                }
            };
            info!("remote view {} from {}", recording.stem, recording.device_id);
            views.push(View::remote(&recording, time_offset));
        }
        Ok(views)
    }

    fn camera_for(&self, view: &View) -> Option<CameraParams> {
        let id = view.calibration_id.as_deref()?;
        match self.store.camera_params(id) {
            Ok(camera) => camera,
            Err(e) => {
                warn!("calibration for {} is unusable: {}", id, e);
                None
            }
        }
    }

    /// 全フレームを三角測量・平滑化して表に追加し、最大再投影誤差を返す
    fn reconstruct(
        &self,
        eligible: &[(&View, CameraParams)],
        start: usize,
        range: usize,
        table: &mut TrackTable,
    ) -> Option<f64> {
        let session = &self.config.session;
        let fps = session.fps;
        let triangulator = Triangulator::from_config(&self.config.triangulation);
        let mut filter = TemporalFilter::from_config(&self.config.filter, session.joint_count, fps);

        let cameras: Vec<&CameraParams> = eligible.iter().map(|(_, c)| c).collect();
        let dirs: Vec<PathBuf> = eligible.iter().map(|(v, _)| v.keypoint_dir(&session.work_dir)).collect();
        let shifts: Vec<i64> = eligible
            .iter()
            .map(|(v, _)| if session.apply_stream_offsets { v.frame_shift(fps) } else { 0 })
            .collect();

        let mut max_error: Option<f64> = None;
        for frame in start..range {
            let keypoints: Vec<Vec<Keypoint>> = eligible
                .iter()
                .zip(&dirs)
                .zip(&shifts)
                .map(|(((view, _), dir), &shift)| {
                    let view_frame = frame as i64 - shift;
                    if view_frame < 0 {
                        return Vec::new();
                    }
                    let path = dir.join(keypoint_file_name(&view.name, view_frame as usize));
                    if !path.exists() {
                        debug!("no keypoints for {} frame {}", view.name, view_frame);
                        return Vec::new();
                    }
                    read_keypoint_file(&path).unwrap_or_else(|e| {
                        warn!("unreadable keypoints {}: {}", path.display(), e);
                        Vec::new()
                    })
                })
                .collect();
            let slices: Vec<&[Keypoint]> = keypoints.iter().map(Vec::as_slice).collect();

            let points = triangulator.reconstruct_frame(&cameras, &slices, session.joint_count);
            if let Some(err) = triangulator.frame_reprojection_error(&cameras, &slices, &points) {
                max_error = Some(max_error.map_or(err, |m| m.max(err)));
            }
            let timestamp = (frame - start) as f64 / fps;
            let smoothed = filter.filter_frame(timestamp, &points);
            table.push_frame(timestamp, &smoothed);
        }
        max_error
    }

    /// 一時ディレクトリと元動画を削除（失敗は無視）
    fn cleanup(&self, views: &[View]) {
        for view in views {
            let dir = view.keypoint_dir(&self.config.session.work_dir);
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("removed {}", dir.display()),
                Err(e) => warn!("could not remove {}: {}", dir.display(), e),
            }
            match fs::remove_file(&view.video) {
                Ok(()) => info!("removed {}", view.video.display()),
                Err(e) => warn!("could not remove {}: {}", view.video.display(), e),
            }
        }
    }
}
