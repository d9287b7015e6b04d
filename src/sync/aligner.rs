use std::collections::BTreeMap;
use tracing::{info, warn};

use super::detector::{AudioTrack, SyncDetector};

/// 基準タイムラインに対するストリームの時間オフセット
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOffset {
    /// 基準イベント時刻 − ストリームイベント時刻（秒）
    pub time_offset: f64,
    /// クロックドリフト補正係数。現状は常に 1.0
    pub drift_factor: f64,
}

impl StreamOffset {
    pub fn new(time_offset: f64) -> Self {
        Self {
            time_offset,
            drift_factor: 1.0,
        }
    }
}

/// 同期イベントを使って各ストリームのオフセットを求める
pub struct Aligner {
    detector: SyncDetector,
}

impl Aligner {
    pub fn new(detector: SyncDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &SyncDetector {
        &self.detector
    }

    /// 基準音声と各ストリームのオフセットを計算
    ///
    /// 基準にイベントが無ければ空。イベントが見つからないストリームは結果に含めない
    /// （フォールバックは呼び出し側が決める）。
    pub fn calculate_offsets<'a, I>(&self, reference: &AudioTrack, streams: I) -> BTreeMap<String, StreamOffset>
    where
        I: IntoIterator<Item = (&'a str, &'a AudioTrack)>,
    {
        match self.detector.find_event(reference) {
            Some(reference_time) => self.offsets_against(reference_time, streams),
            None => {
                warn!("no sync event in reference audio");
                BTreeMap::new()
            }
        }
    }

    /// 既知の基準イベント時刻に対するオフセット
    pub fn offsets_against<'a, I>(&self, reference_time: f64, streams: I) -> BTreeMap<String, StreamOffset>
    where
        I: IntoIterator<Item = (&'a str, &'a AudioTrack)>,
    {
        let mut offsets = BTreeMap::new();
        for (id, track) in streams {
            match self.detector.find_event(track) {
                Some(stream_time) => {
                    let offset = StreamOffset::new(reference_time - stream_time);
                    info!("{} offset: {:.4}s", id, offset.time_offset);
                    offsets.insert(id.to_string(), offset);
                }
                None => warn!("no sync event for {}", id),
            }
        }
        offsets
    }
}
