use hound::{SampleFormat, WavReader};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{MocapError, Result};

/// モノラル音声トラック
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioTrack {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self { sample_rate, samples }
    }

    /// WAVファイルを読み込む。複数チャンネルは平均してモノラルにする
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MocapError::MissingInput { path: path.to_path_buf() });
        }

        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = usize::from(spec.channels.max(1));
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        Ok(Self::new(spec.sample_rate, samples))
    }
}

/// 音声トラック中の同期イベント（拍手など）を探す
#[derive(Debug, Clone)]
pub struct SyncDetector {
    /// ピーク振幅に対する相対閾値
    height_threshold: f32,
    /// ピーク間の最小間隔（秒）
    min_spacing: f64,
}

impl SyncDetector {
    pub fn new(height_threshold: f32, min_spacing: f64) -> Self {
        Self {
            height_threshold,
            min_spacing,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.height_threshold, config.min_event_spacing)
    }

    /// 最初の同期イベントの時刻（秒）
    ///
    /// 振幅を最大値で正規化し、閾値を超える局所ピークのうち、最小間隔内で
    /// より高いピークに負けなかったものの中から最も早いものを返す。
    /// 最小間隔内では最も高いピークの時刻になるので、拍手より大きな残響が
    /// 間隔内にあれば立ち上がりより後ろの時刻が返る。
    /// 無音や閾値を超えるピークが無ければ None。
    pub fn find_event(&self, track: &AudioTrack) -> Option<f64> {
        if track.sample_rate == 0 {
            return None;
        }

        let peak = track
            .samples
            .iter()
            .map(|s| s.abs())
            .filter(|s| s.is_finite())
            .fold(0.0f32, f32::max);
        if peak <= 0.0 {
            return None;
        }

        let envelope: Vec<f32> = track.samples.iter().map(|s| s.abs() / peak).collect();
        let mut candidates = local_peaks(&envelope, self.height_threshold);
        if candidates.is_empty() {
            return None;
        }

        // 高いピークを優先し、近すぎるピーク（残響）を落とす
        let distance = ((self.min_spacing * track.sample_rate as f64).ceil() as usize).max(1);
        candidates.sort_by(|&a, &b| envelope[b].total_cmp(&envelope[a]).then(a.cmp(&b)));

        let mut kept = BTreeSet::new();
        for idx in candidates {
            let lo = idx.saturating_sub(distance - 1);
            let hi = idx.saturating_add(distance - 1);
            if kept.range(lo..=hi).next().is_none() {
                kept.insert(idx);
            }
        }

        let first = *kept.iter().next()?;
        let time = first as f64 / track.sample_rate as f64;
        debug!("sync event at sample {} ({:.4}s), {} peak(s) kept", first, time, kept.len());
        Some(time)
    }

    pub fn find_event_in_file(&self, path: &Path) -> Result<Option<f64>> {
        let track = AudioTrack::load(path)?;
        Ok(self.find_event(&track))
    }
}

/// 閾値以上の局所最大のインデックス。平坦な頂上は最初のサンプルを採る
fn local_peaks(envelope: &[f32], height: f32) -> Vec<usize> {
    let n = envelope.len();
    let mut peaks = Vec::new();
    let mut i = 1;
    while i + 1 < n {
        if envelope[i] > envelope[i - 1] {
            let mut end = i;
            while end + 1 < n && envelope[end + 1] == envelope[i] {
                end += 1;
            }
            if end + 1 < n && envelope[end + 1] < envelope[i] && envelope[i] >= height {
                peaks.push(i);
            }
            i = end + 1;
        } else {
            i += 1;
        }
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8000;

    fn silence(secs: f64) -> Vec<f32> {
        vec![0.0; (secs * RATE as f64) as usize]
    }

    fn clap_at(samples: &mut [f32], secs: f64, amplitude: f32) {
        let idx = (secs * RATE as f64) as usize;
        samples[idx] = amplitude;
        samples[idx + 1] = amplitude * 0.6;
        samples[idx + 2] = amplitude * 0.3;
    }

    #[test]
    fn test_silent_track_has_no_event() {
        let det = SyncDetector::new(0.5, 0.1);
        assert_eq!(det.find_event(&AudioTrack::new(RATE, silence(1.0))), None);
        assert_eq!(det.find_event(&AudioTrack::new(RATE, Vec::new())), None);
    }

    #[test]
    fn test_single_clap() {
        let mut samples = silence(3.0);
        clap_at(&mut samples, 2.0, 0.8);
        let det = SyncDetector::new(0.5, 0.1);
        let t = det.find_event(&AudioTrack::new(RATE, samples)).unwrap();
        assert!((t - 2.0).abs() < 1.0 / RATE as f64);
    }

    #[test]
    fn test_below_threshold_rejected() {
        // 最大値は先頭サンプル（局所ピークにならない）、内部のピークは閾値未満
        let mut samples = silence(1.0);
        samples[0] = 1.0;
        let len = samples.len();
        samples[len / 2] = 0.4;
        let det = SyncDetector::new(0.5, 0.1);
        assert_eq!(det.find_event(&AudioTrack::new(RATE, samples)), None);
    }

    #[test]
    fn test_first_of_two_claps() {
        let mut samples = silence(4.0);
        clap_at(&mut samples, 1.0, 0.7);
        clap_at(&mut samples, 3.0, 1.0);
        let det = SyncDetector::new(0.5, 0.1);
        let t = det.find_event(&AudioTrack::new(RATE, samples)).unwrap();
        assert!((t - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_echo_within_spacing_is_not_separate() {
        // 直後の残響が本体より大きい場合でも、最小間隔内なら1つのイベント
        let det = SyncDetector::new(0.5, 0.1);
        let t = det.find_event(&AudioTrack::new(RATE, silence_with_claps())).unwrap();
        assert!((t - 0.52).abs() < 1e-3, "got {}", t);

        // 間隔を狭めると別イベントとして最初の拍手が残る
        let det = SyncDetector::new(0.5, 0.01);
        let t = det.find_event(&AudioTrack::new(RATE, silence_with_claps())).unwrap();
        assert!((t - 0.50).abs() < 1e-3, "got {}", t);
    }

    fn silence_with_claps() -> Vec<f32> {
        let mut samples = silence(2.0);
        clap_at(&mut samples, 0.50, 0.9);
        clap_at(&mut samples, 0.52, 1.0);
        samples
    }

    #[test]
    fn test_plateau_peak_uses_first_sample() {
        let env = [0.0, 0.2, 0.9, 0.9, 0.9, 0.1, 0.0];
        assert_eq!(local_peaks(&env, 0.5), vec![2]);
    }

    #[test]
    fn test_load_stereo_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..RATE {
            let v: i16 = if i == RATE / 2 { 20000 } else { 0 };
            writer.write_sample(v).unwrap();
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let track = AudioTrack::load(&path).unwrap();
        assert_eq!(track.sample_rate, RATE);
        assert_eq!(track.samples.len(), RATE as usize);

        let det = SyncDetector::new(0.5, 0.1);
        let t = det.find_event_in_file(&path).unwrap().unwrap();
        assert!((t - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_load_missing_is_missing_input() {
        let err = AudioTrack::load(Path::new("/nonexistent/audio.wav")).unwrap_err();
        assert!(matches!(err, MocapError::MissingInput { .. }));
    }
}
