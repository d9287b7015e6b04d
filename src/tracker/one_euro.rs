use crate::config::FilterConfig;
use crate::triangulation::Point3;

/// Low-pass filter component
struct LowPassFilter {
    prev: Option<f64>,
}

impl LowPassFilter {
    fn new() -> Self {
        Self { prev: None }
    }

    fn filter(&mut self, value: f64, alpha: f64) -> f64 {
        match self.prev {
            Some(prev) => {
                let result = alpha * value + (1.0 - alpha) * prev;
                self.prev = Some(result);
                result
            }
            None => {
                self.prev = Some(value);
                value
            }
        }
    }
}

/// alpha = 1 / (1 + tau/Te), tau = 1/(2*pi*fc)
fn smoothing_factor(te: f64, cutoff: f64) -> f64 {
    let r = 2.0 * std::f64::consts::PI * cutoff * te;
    r / (r + 1.0)
}

/// One Euro Filter for a single scalar channel
///
/// 動きが速いほどカットオフが上がり遅延が減る。静止時はカットオフが
/// `min_cutoff` まで下がりジッターを抑える。
pub struct ScalarFilter {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    nominal_dt: f64,
    x_filter: LowPassFilter,
    dx_filter: LowPassFilter,
    prev_value: Option<f64>,
    prev_time: Option<f64>,
}

impl ScalarFilter {
    pub fn new(min_cutoff: f64, beta: f64, d_cutoff: f64, nominal_dt: f64) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff,
            nominal_dt,
            x_filter: LowPassFilter::new(),
            dx_filter: LowPassFilter::new(),
            prev_value: None,
            prev_time: None,
        }
    }

    pub fn filter(&mut self, timestamp: f64, value: f64) -> f64 {
        // 初回・時刻が進んでいない場合は名目上の dt を使う
        let dt = match self.prev_time {
            Some(prev) if timestamp > prev => timestamp - prev,
            _ => self.nominal_dt,
        };
        self.prev_time = Some(timestamp);

        let dx = match self.prev_value {
            Some(prev) => (value - prev) / dt,
            None => 0.0,
        };
        self.prev_value = Some(value);

        let edx = self
            .dx_filter
            .filter(dx, smoothing_factor(dt, self.d_cutoff));
        let cutoff = self.min_cutoff + self.beta * edx.abs();
        self.x_filter.filter(value, smoothing_factor(dt, cutoff))
    }
}

/// 関節 × 軸ごとに独立した One Euro Filter のバンク
pub struct TemporalFilter {
    channels: Vec<ScalarFilter>,
}

impl TemporalFilter {
    pub fn new(joint_count: usize, min_cutoff: f64, beta: f64, d_cutoff: f64, fps: f64) -> Self {
        let nominal_dt = if fps > 0.0 { 1.0 / fps } else { 1.0 / 30.0 };
        Self {
            channels: (0..joint_count * 3)
                .map(|_| ScalarFilter::new(min_cutoff, beta, d_cutoff, nominal_dt))
                .collect(),
        }
    }

    pub fn from_config(config: &FilterConfig, joint_count: usize, fps: f64) -> Self {
        Self::new(joint_count, config.min_cutoff, config.beta, config.d_cutoff, fps)
    }

    pub fn joint_count(&self) -> usize {
        self.channels.len() / 3
    }

    /// 1フレーム分の3D点を平滑化
    ///
    /// 未解決の関節は (0, 0, 0) として通す。フィルタ状態も0のサンプルで更新される
    /// （欠損と原点を区別しない）。
    pub fn filter_frame(&mut self, timestamp: f64, points: &[Option<Point3>]) -> Vec<Point3> {
        self.channels
            .chunks_mut(3)
            .enumerate()
            .map(|(joint, axes)| {
                let raw = points.get(joint).copied().flatten().unwrap_or_else(Point3::zeros);
                Point3::new(
                    axes[0].filter(timestamp, raw.x),
                    axes[1].filter(timestamp, raw.y),
                    axes[2].filter(timestamp, raw.z),
                )
            })
            .collect()
    }
}
