use crate::config::merge::{load_document, merged_with_defaults};
use crate::utils::error::Result;
use crate::utils::validation::{
    validate_one_of, validate_path, validate_positive_number, validate_range, Validate,
    ValidationReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const DEFAULT_ATLASES: &[&str] = &[
    "AAL",
    "AAL2",
    "AAL3",
    "Brodmann",
    "HCP-MMP",
    "AICHA",
    "Talairach",
    "FreeSurferDKT",
    "FreeSurferDKT_Cortical",
    "Schaefer100",
    "Schaefer200",
    "Schaefer400",
    "Gordon333",
    "Power264",
];

pub const DEFAULT_CONNECTIVITY_VALUES: &[&str] = &[
    "count",
    "ncount",
    "ncount2",
    "mean_length",
    "qa",
    "fa",
    "dti_fa",
    "md",
    "ad",
    "rd",
    "iso",
    "rdi",
    "ndi",
    "dti_ad",
    "dti_rd",
    "dti_md",
    "trk",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingParameters {
    /// 0=streamline(Euler), 1=RK4, 2=voxel tracking
    pub method: i64,
    pub otsu_threshold: f64,
    /// 0 表示自動
    pub fa_threshold: f64,
    /// 0 表示隨機 15-90 度
    pub turning_angle: f64,
    /// 0 表示隨機 1-3 voxels
    pub step_size: f64,
    pub smoothing: f64,
    pub min_length: i64,
    pub max_length: i64,
    pub track_voxel_ratio: f64,
    pub check_ending: i64,
    pub random_seed: i64,
    pub dt_threshold: f64,
}

impl Default for TrackingParameters {
    fn default() -> Self {
        Self {
            method: 0,
            otsu_threshold: 0.6,
            fa_threshold: 0.0,
            turning_angle: 0.0,
            step_size: 0.0,
            smoothing: 0.0,
            min_length: 0,
            max_length: 0,
            track_voxel_ratio: 2.0,
            check_ending: 0,
            random_seed: 0,
            dt_threshold: 0.2,
        }
    }
}

impl TrackingParameters {
    /// 只輸出與預設值不同的追蹤參數
    pub fn non_default_flags(&self) -> Vec<String> {
        let defaults = Self::default();
        let mut flags = Vec::new();

        if self.method != defaults.method {
            flags.push(format!("--method={}", self.method));
        }
        if self.otsu_threshold != defaults.otsu_threshold {
            flags.push(format!("--otsu_threshold={}", self.otsu_threshold));
        }
        if self.fa_threshold != defaults.fa_threshold {
            flags.push(format!("--fa_threshold={}", self.fa_threshold));
        }
        if self.turning_angle != defaults.turning_angle {
            flags.push(format!("--turning_angle={}", self.turning_angle));
        }
        if self.step_size != defaults.step_size {
            flags.push(format!("--step_size={}", self.step_size));
        }
        if self.smoothing != defaults.smoothing {
            flags.push(format!("--smoothing={}", self.smoothing));
        }
        if self.min_length != defaults.min_length {
            flags.push(format!("--min_length={}", self.min_length));
        }
        if self.max_length != defaults.max_length {
            flags.push(format!("--max_length={}", self.max_length));
        }
        if self.track_voxel_ratio != defaults.track_voxel_ratio {
            flags.push(format!("--track_voxel_ratio={}", self.track_voxel_ratio));
        }
        if self.check_ending != defaults.check_ending {
            flags.push(format!("--check_ending={}", self.check_ending));
        }
        if self.random_seed != defaults.random_seed {
            flags.push(format!("--random_seed={}", self.random_seed));
        }

        flags
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityOptions {
    /// "pass" 或 "end"
    pub connectivity_type: String,
    pub connectivity_threshold: f64,
    pub connectivity_output: String,
}

impl Default for ConnectivityOptions {
    fn default() -> Self {
        Self {
            connectivity_type: "pass".to_string(),
            connectivity_threshold: 0.001,
            connectivity_output: "matrix,connectogram,measure".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub atlases: Vec<String>,
    pub connectivity_values: Vec<String>,
    pub track_count: i64,
    pub thread_count: i64,
    pub dsi_studio_cmd: String,
    pub tracking_parameters: TrackingParameters,
    pub connectivity_options: ConnectivityOptions,
    /// 每個 atlas 的追蹤逾時秒數
    pub timeout_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            atlases: DEFAULT_ATLASES.iter().map(|s| s.to_string()).collect(),
            connectivity_values: DEFAULT_CONNECTIVITY_VALUES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            track_count: 100_000,
            thread_count: 8,
            dsi_studio_cmd: "dsi_studio".to_string(),
            tracking_parameters: TrackingParameters::default(),
            connectivity_options: ConnectivityOptions::default(),
            timeout_seconds: 3600,
        }
    }
}

/// 命令列覆寫值，只有提供的欄位會生效
#[derive(Debug, Clone, Default)]
pub struct ExtractOverrides {
    pub atlases: Option<Vec<String>>,
    pub connectivity_values: Option<Vec<String>>,
    pub track_count: Option<i64>,
    pub thread_count: Option<i64>,
    pub dsi_studio_cmd: Option<String>,
    pub method: Option<i64>,
    pub fa_threshold: Option<f64>,
    pub turning_angle: Option<f64>,
    pub step_size: Option<f64>,
    pub smoothing: Option<f64>,
    pub track_voxel_ratio: Option<f64>,
    pub connectivity_type: Option<String>,
    pub connectivity_threshold: Option<f64>,
}

impl ConnectivityConfig {
    /// 設定檔深度合併到預設值之上
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let document = load_document(path.as_ref())?;
        Self::from_value(document)
    }

    pub fn from_value(overlay: Value) -> Result<Self> {
        merged_with_defaults(&Self::default(), overlay)
    }

    pub fn apply_overrides(&mut self, overrides: &ExtractOverrides) {
        if let Some(atlases) = &overrides.atlases {
            self.atlases = atlases.clone();
        }
        if let Some(values) = &overrides.connectivity_values {
            self.connectivity_values = values.clone();
        }
        if let Some(tracks) = overrides.track_count {
            self.track_count = tracks;
        }
        if let Some(threads) = overrides.thread_count {
            self.thread_count = threads;
        }
        if let Some(cmd) = &overrides.dsi_studio_cmd {
            self.dsi_studio_cmd = cmd.clone();
        }

        let tracking = &mut self.tracking_parameters;
        if let Some(method) = overrides.method {
            tracking.method = method;
        }
        if let Some(fa) = overrides.fa_threshold {
            tracking.fa_threshold = fa;
        }
        if let Some(angle) = overrides.turning_angle {
            tracking.turning_angle = angle;
        }
        if let Some(step) = overrides.step_size {
            tracking.step_size = step;
        }
        if let Some(smoothing) = overrides.smoothing {
            tracking.smoothing = smoothing;
        }
        if let Some(ratio) = overrides.track_voxel_ratio {
            tracking.track_voxel_ratio = ratio;
        }

        let options = &mut self.connectivity_options;
        if let Some(kind) = &overrides.connectivity_type {
            options.connectivity_type = kind.clone();
        }
        if let Some(threshold) = overrides.connectivity_threshold {
            options.connectivity_threshold = threshold;
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self.tracking_parameters.method {
            1 => "rk4",
            2 => "voxel",
            _ => "streamline",
        }
    }

    /// 例如 `tracks_100k_streamline_angle45_fa0.15`
    pub fn parameter_dir_name(&self) -> String {
        let mut name = format!("tracks_{}k_{}", self.track_count / 1000, self.method_name());
        let tracking = &self.tracking_parameters;
        if tracking.turning_angle != 0.0 {
            name.push_str(&format!("_angle{}", tracking.turning_angle as i64));
        }
        if tracking.fa_threshold != 0.0 {
            name.push_str(&format!("_fa{:.2}", tracking.fa_threshold));
        }
        name
    }

    /// 檢查參數合理性；DSI Studio 是否可用另外檢查
    pub fn validate_configuration(&self, cpu_count: Option<usize>) -> ValidationReport {
        let mut report = ValidationReport::new();

        if self.atlases.is_empty() {
            report.warning("No atlases specified");
        } else {
            tracing::info!(
                "📊 Will process {} atlases: {}",
                self.atlases.len(),
                self.atlases.join(", ")
            );
            report.note(format!("Configured atlases: {}", self.atlases.join(", ")));
        }

        if self.connectivity_values.is_empty() {
            report.warning("No connectivity values specified");
        } else {
            tracing::info!(
                "📊 Will extract {} connectivity metrics: {}",
                self.connectivity_values.len(),
                self.connectivity_values.join(", ")
            );
            report.note(format!(
                "Connectivity metrics: {}",
                self.connectivity_values.join(", ")
            ));
        }

        if self.track_count <= 0 {
            report.error(format!(
                "Track count must be positive, got: {}",
                self.track_count
            ));
        } else if self.track_count < 1000 {
            report.warning(format!(
                "Low track count ({}), results may be sparse",
                self.track_count
            ));
        } else if self.track_count > 1_000_000 {
            report.warning(format!(
                "Very high track count ({}), processing may be slow",
                self.track_count
            ));
        }

        let tracking = &self.tracking_parameters;
        if !(0..=2).contains(&tracking.method) {
            report.error(format!(
                "Tracking method must be 0 (streamline), 1 (RK4) or 2 (voxel), got: {}",
                tracking.method
            ));
        }
        if tracking.fa_threshold < 0.0 || tracking.fa_threshold > 1.0 {
            report.warning(format!(
                "FA threshold {} outside normal range [0-1]",
                tracking.fa_threshold
            ));
        }
        if tracking.turning_angle > 180.0 {
            report.warning(format!(
                "Turning angle {}° seems too large",
                tracking.turning_angle
            ));
        }

        let connectivity_type = self.connectivity_options.connectivity_type.as_str();
        if connectivity_type != "pass" && connectivity_type != "end" {
            report.error(format!(
                "Connectivity type must be 'pass' or 'end', got: {}",
                connectivity_type
            ));
        }

        if self.thread_count <= 0 {
            report.error(format!(
                "Thread count must be positive, got: {}",
                self.thread_count
            ));
        } else if self.thread_count > 32 {
            report.warning(format!(
                "Very high thread count ({}), may exceed system capacity",
                self.thread_count
            ));
        } else if let Some(cpus) = cpu_count {
            if self.thread_count as usize > cpus {
                report.warning(format!(
                    "Thread count ({}) exceeds available CPUs ({})",
                    self.thread_count, cpus
                ));
            }
        }

        report
    }
}

/// 啟動前的快速檢查，第一個錯誤就停止；完整報告用 `validate_configuration`
impl Validate for ConnectivityConfig {
    fn validate(&self) -> Result<()> {
        validate_path("dsi_studio_cmd", &self.dsi_studio_cmd)?;
        validate_positive_number("track_count", self.track_count, 1)?;
        validate_positive_number("thread_count", self.thread_count, 1)?;
        validate_range("tracking_parameters.method", self.tracking_parameters.method, 0, 2)?;
        validate_one_of(
            "connectivity_options.connectivity_type",
            &self.connectivity_options.connectivity_type,
            &["pass", "end"],
        )?;
        Ok(())
    }
}
