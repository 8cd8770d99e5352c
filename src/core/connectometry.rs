use crate::adapters::storage::LocalStorage;
use crate::config::connectometry::{BatchConfiguration, ConnectometryConfig};
use crate::domain::model::{AnalysisResult, AnalysisStatus, AnalysisSummary, CommandSpec};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{DsiError, Result};
use futures::future::join_all;
use rand::Rng;
use serde_json::{Map, Number, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// DSI Studio 參數名稱，依字母順序輸出
const MAPPED_FLAGS: &[&str] = &[
    "index_name",
    "t_threshold",
    "effect_size",
    "length_threshold",
    "fdr_threshold",
    "permutation",
    "thread_count",
    "exclude_cb",
    "normalize_iso",
    "tip_iteration",
    "region_pruning",
    "no_tractogram",
    "output",
    "select",
    "seed",
    "roi",
    "roa",
];

const REQUIRED_INPUTS: &[&str] = &["source", "demo", "variable_list", "voi"];

/// 小於這個大小的 track 檔視為沒有結果
const FINDINGS_MIN_BYTES: u64 = 1000;

fn round10(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// 單一範圍最多展開的值數
pub const MAX_RANGE_VALUES: usize = 10_000;

/// 解析 `start:end` 或 `start:step:end`，包含終點。
///
/// 只接受數字、`.`、`:`、`-`；三個值都是整數時產生整數。
pub fn parse_range_string(value: &str) -> Option<Vec<Value>> {
    if !value.contains(':') {
        return None;
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | ':' | '-'))
    {
        return None;
    }

    let parts: Vec<f64> = value
        .split(':')
        .map(|part| part.parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;

    let (start, step, end) = match parts.as_slice() {
        [start, end] => (*start, 1.0, *end),
        [start, step, end] => (*start, *step, *end),
        _ => return None,
    };

    let integral = !value.contains('.');
    let to_value = |x: f64| {
        if integral {
            Value::Number(Number::from(x.round() as i64))
        } else {
            float_value(round10(x))
        }
    };

    if !(start.is_finite() && step.is_finite() && end.is_finite()) {
        tracing::warn!("⚠️  Ignoring non-finite range: {}", value);
        return None;
    }
    if step == 0.0 {
        return Some(vec![to_value(start)]);
    }

    let steps = ((end - start) / step + 1e-5).floor();
    if steps < 0.0 {
        return Some(Vec::new());
    }
    if steps >= MAX_RANGE_VALUES as f64 {
        tracing::warn!(
            "⚠️  Range {} expands to more than {} values, ignoring",
            value,
            MAX_RANGE_VALUES
        );
        return None;
    }

    // 以乘法計算避免累加誤差
    let count = steps as usize + 1;
    Some(
        (0..count)
            .map(|i| to_value(start + step * i as f64))
            .collect(),
    )
}

/// 範圍字串與陣列視為多值參數，展開成笛卡兒積（第一個 key 變化最慢）
pub fn expand_parameter_grid(params: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let mut list_params: Vec<(&String, Vec<Value>)> = Vec::new();
    let mut single_params = Map::new();

    for (key, value) in params {
        let range = value.as_str().and_then(parse_range_string);
        match (range, value) {
            (Some(values), _) => list_params.push((key, values)),
            (None, Value::Array(items)) => list_params.push((key, items.clone())),
            (None, other) => {
                single_params.insert(key.clone(), other.clone());
            }
        }
    }

    if list_params.is_empty() {
        return vec![params.clone()];
    }

    let mut combinations = vec![single_params];
    for (key, values) in &list_params {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combo in &combinations {
            for value in values {
                let mut extended = combo.clone();
                extended.insert((*key).clone(), value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    combinations
}

fn name_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// `qa_0.3_20_2000` 形式的名稱；缺少任何一個關鍵參數時用 `<base>_combo_<n>`
pub fn generate_analysis_name(params: &Map<String, Value>, base_name: &str, index: usize) -> String {
    let keys = ["index_name", "effect_size", "length_threshold", "permutation"];
    let parts: Option<Vec<String>> = keys
        .iter()
        .map(|key| {
            params
                .get(*key)
                .filter(|value| !value.is_null())
                .map(name_part)
        })
        .collect();

    match parts {
        Some(parts) => parts.join("_"),
        None => format!("{}_combo_{}", base_name, index + 1),
    }
}

fn flag_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn is_headless_qt_error(stderr: &str, code: Option<i32>) -> bool {
    stderr.contains("qt.qpa") || matches!(code, Some(-6) | Some(134))
}

fn has_findings(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.len() > FINDINGS_MIN_BYTES)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub output_dir: PathBuf,
    pub config_file: String,
    pub workers: usize,
    /// 平行執行時每個分析開始前的隨機延遲範圍（秒）
    pub stagger: Option<(f64, f64)>,
    pub xvfb: Option<PathBuf>,
    pub dry_run: bool,
}

impl RunnerOptions {
    pub fn new(output_dir: impl Into<PathBuf>, config_file: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            config_file: config_file.into(),
            workers: 1,
            stagger: Some((2.0, 30.0)),
            xvfb: None,
            dry_run: false,
        }
    }
}

pub struct ConnectometryRunner<R: CommandRunner> {
    runner: Arc<R>,
    config: ConnectometryConfig,
    options: RunnerOptions,
    results: Vec<AnalysisResult>,
}

impl<R: CommandRunner> ConnectometryRunner<R> {
    pub fn new(runner: Arc<R>, config: ConnectometryConfig, options: RunnerOptions) -> Result<Self> {
        fs::create_dir_all(&options.output_dir)?;
        Ok(Self {
            runner,
            config,
            options,
            results: Vec::new(),
        })
    }

    pub fn results(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn config(&self) -> &ConnectometryConfig {
        &self.config
    }

    pub fn build_command(&self, analysis_name: &str, params: &Map<String, Value>) -> Result<CommandSpec> {
        let dsi_cmd = self.config.dsi_studio_cmd.as_str();
        let mut spec = match &self.options.xvfb {
            Some(xvfb) => CommandSpec::new(xvfb.to_string_lossy())
                .arg("-a")
                .arg(dsi_cmd),
            None => CommandSpec::new(dsi_cmd),
        };
        spec.push("--action=cnt");

        for key in REQUIRED_INPUTS {
            let value = params
                .get(*key)
                .and_then(flag_text)
                .or_else(|| self.config.core_value(key).and_then(flag_text));
            if let Some(value) = value {
                spec.push(format!("--{}={}", key, value));
            }
        }

        let mut keys: Vec<&String> = params
            .keys()
            .filter(|key| MAPPED_FLAGS.contains(&key.as_str()))
            .collect();
        keys.sort();
        for key in keys {
            if let Some(value) = params.get(key).and_then(flag_text) {
                spec.push(format!("--{}={}", key, value));
            }
        }

        if !spec.has_flag("output") {
            let analysis_dir = self.options.output_dir.join(analysis_name);
            if !self.options.dry_run {
                fs::create_dir_all(&analysis_dir)?;
            }
            spec.push(format!(
                "--output={}",
                analysis_dir.join(analysis_name).display()
            ));
        }

        Ok(spec.timeout(Duration::from_secs(self.config.timeout_seconds)))
    }

    /// 只產生命令不執行
    pub fn plan_analysis(&self, analysis_name: &str, params: &Map<String, Value>) -> AnalysisResult {
        let mut result = AnalysisResult::pending(analysis_name, params.clone());
        match self.build_command(analysis_name, params) {
            Ok(spec) => {
                tracing::info!("📝 [dry run] {}: {}", analysis_name, spec.display());
                result.command = Some(spec.display());
                result.status = AnalysisStatus::Planned;
            }
            Err(e) => {
                result.status = AnalysisStatus::Error;
                result.stderr = Some(e.to_string());
            }
        }
        result
    }

    pub async fn run_single_analysis(
        &self,
        analysis_name: &str,
        params: &Map<String, Value>,
        index: usize,
        total: usize,
    ) -> AnalysisResult {
        if self.options.dry_run {
            return self.plan_analysis(analysis_name, params);
        }

        let mut result = AnalysisResult::pending(analysis_name, params.clone());

        let spec = match self.build_command(analysis_name, params) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::error!("✗ Analysis error: {}", e);
                result.status = AnalysisStatus::Error;
                result.end_time = Some(chrono::Local::now().to_rfc3339());
                result.stderr = Some(e.to_string());
                return result;
            }
        };
        let command_line = spec.display();
        result.command = Some(command_line.clone());

        let rule = "=".repeat(80);
        tracing::info!("{}", rule);
        tracing::info!("Analysis {}/{}: {}", index + 1, total, analysis_name);
        tracing::info!("{}", rule);
        tracing::info!(
            "Parameters: {}",
            serde_json::to_string_pretty(params).unwrap_or_default()
        );
        tracing::info!("Command: {}", command_line);

        if self.options.workers > 1 {
            if let Some((min, max)) = self.options.stagger {
                let delay = if max > min {
                    rand::rng().random_range(min..max)
                } else {
                    min
                };
                tracing::info!(
                    "Waiting {:.2}s before starting to avoid race conditions...",
                    delay
                );
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
            }
        }

        result.start_time = Some(chrono::Local::now().to_rfc3339());
        let outcome = self.runner.run(&spec).await;
        result.end_time = Some(chrono::Local::now().to_rfc3339());

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                tracing::error!("✗ Analysis error: {}", e);
                result.status = AnalysisStatus::Error;
                result.stderr = Some(e.to_string());
                return result;
            }
        };

        result.duration = Some(output.duration.as_secs_f64());

        if output.is_timeout() {
            tracing::error!("✗ Analysis timed out");
            result.status = AnalysisStatus::Timeout;
            return result;
        }

        result.return_code = output.code();
        result.stdout = Some(output.stdout.clone());
        result.stderr = Some(output.stderr.clone());

        if output.success() {
            result.status = AnalysisStatus::Success;
            tracing::info!(
                "✓ Analysis completed successfully in {:.2}s",
                output.duration.as_secs_f64()
            );

            if let Some(prefix) = spec.flag_value("output") {
                let increased = has_findings(Path::new(&format!("{}.inc.tt.gz", prefix)));
                let decreased = has_findings(Path::new(&format!("{}.dec.tt.gz", prefix)));
                if increased {
                    tracing::info!("  -> Found INCREASED connectivity findings");
                }
                if decreased {
                    tracing::info!("  -> Found DECREASED connectivity findings");
                }
                result.findings_increased = Some(increased);
                result.findings_decreased = Some(decreased);
            }
        } else {
            result.status = AnalysisStatus::Failed;
            tracing::error!(
                "✗ Analysis failed with return code {:?}",
                output.code()
            );
            tracing::error!("STDERR: {}", output.stderr);

            if is_headless_qt_error(&output.stderr, output.code()) {
                let bang = "!".repeat(80);
                tracing::error!("{}", bang);
                tracing::error!("HEADLESS SERVER ERROR DETECTED");
                tracing::error!("{}", bang);
                tracing::error!("DSI Studio 'cnt' action requires a display or xvfb.");
                tracing::error!("Please ask your administrator to install 'xvfb' and run:");
                tracing::error!("  xvfb-run -a {}", command_line);
                tracing::error!("{}", bang);
            }
        }

        result
    }

    async fn execute_all(&self, jobs: Vec<(String, Map<String, Value>)>) -> Vec<AnalysisResult> {
        let total = jobs.len();

        if self.options.workers <= 1 {
            let mut results = Vec::with_capacity(total);
            for (i, (name, params)) in jobs.iter().enumerate() {
                results.push(self.run_single_analysis(name, params, i, total).await);
            }
            return results;
        }

        tracing::info!("Running with {} parallel workers", self.options.workers);
        let semaphore = Arc::new(Semaphore::new(self.options.workers));
        let futures = jobs.iter().enumerate().map(|(i, (name, params))| {
            let semaphore = semaphore.clone();
            async move {
                // semaphore 不會被關閉，取得失敗時直接照常執行
                let _permit = semaphore.acquire().await.ok();
                self.run_single_analysis(name, params, i, total).await
            }
        });

        join_all(futures).await
    }

    pub async fn run_batch_configuration(
        &mut self,
        batch: &BatchConfiguration,
        batch_index: usize,
        total_batches: usize,
    ) -> usize {
        let name = if batch.name.is_empty() {
            format!("batch_{}", batch_index)
        } else {
            batch.name.clone()
        };

        let rule = "#".repeat(80);
        tracing::info!("{}", rule);
        tracing::info!("BATCH {}/{}: {}", batch_index + 1, total_batches, name);
        tracing::info!("Description: {}", batch.description);
        tracing::info!("{}", rule);

        let defaults = self.config.defaults();
        let combinations = expand_parameter_grid(&batch.parameters);
        tracing::info!(
            "Generated {} parameter combination(s)",
            combinations.len()
        );

        let jobs: Vec<(String, Map<String, Value>)> = combinations
            .into_iter()
            .enumerate()
            .map(|(i, combo)| {
                let mut full = defaults.clone();
                full.extend(combo);
                (generate_analysis_name(&full, &name, i), full)
            })
            .collect();

        let results = self.execute_all(jobs).await;
        let count = results.len();
        self.results.extend(results);
        count
    }

    pub async fn run_all_batches(&mut self, exclude: &[&str]) -> usize {
        let batches: Vec<BatchConfiguration> = self
            .config
            .batch_configurations
            .iter()
            .filter(|batch| !exclude.contains(&batch.name.as_str()))
            .cloned()
            .collect();

        if batches.is_empty() {
            tracing::warn!("⚠️  No batch configurations found (after filtering)");
            return 0;
        }

        tracing::info!(
            "🚀 Starting batch processing: {} batch(es) selected",
            batches.len()
        );
        let mut count = 0;
        for (i, batch) in batches.iter().enumerate() {
            count += self.run_batch_configuration(batch, i, batches.len()).await;
        }
        count
    }

    pub async fn run_test_batch(&mut self) -> Result<usize> {
        let batch = self
            .config
            .find_batch("test_run")
            .cloned()
            .ok_or_else(|| DsiError::config("No batch named 'test_run' found in configuration"))?;
        Ok(self.run_batch_configuration(&batch, 0, 1).await)
    }

    pub async fn run_batch_index(&mut self, index: usize) -> Result<usize> {
        let total = self.config.batch_configurations.len();
        let batch = self
            .config
            .batch_configurations
            .get(index)
            .cloned()
            .ok_or_else(|| DsiError::InvalidConfigValueError {
                field: "batch".to_string(),
                value: index.to_string(),
                reason: format!("Invalid batch index; {} batch(es) configured", total),
            })?;
        Ok(self.run_batch_configuration(&batch, index, total).await)
    }

    pub async fn run_custom_analysis(&mut self, params: Map<String, Value>, name: Option<String>) {
        let name = name.unwrap_or_else(|| {
            format!(
                "custom_analysis_{}",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            )
        });
        let result = self.run_single_analysis(&name, &params, 0, 1).await;
        self.results.push(result);
    }

    /// 重跑摘要檔中狀態為 failed、timeout 或 error 的分析
    pub async fn retry_failed(&mut self, summary_path: &Path) -> Result<usize> {
        if !summary_path.exists() {
            return Err(DsiError::input(
                summary_path.display().to_string(),
                "Summary file not found",
            ));
        }

        let content = fs::read_to_string(summary_path)?;
        let summary: AnalysisSummary = serde_json::from_str(&content)?;
        let jobs: Vec<(String, Map<String, Value>)> = summary
            .analyses
            .into_iter()
            .filter(|analysis| analysis.status.is_retryable())
            .map(|analysis| (analysis.name, analysis.params))
            .collect();

        if jobs.is_empty() {
            tracing::info!("No failed analyses found in summary.");
            return Ok(0);
        }

        tracing::info!("🔁 Found {} failed analyses. Retrying...", jobs.len());
        let results = self.execute_all(jobs).await;
        let count = results.len();
        self.results.extend(results);
        Ok(count)
    }

    pub async fn save_summary(&self) -> Result<AnalysisSummary> {
        let summary = AnalysisSummary::from_results(&self.options.config_file, &self.results);
        let file_name = format!(
            "analysis_summary_{}.json",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = LocalStorage::new(&self.options.output_dir)
            .write_json(&file_name, &summary)
            .await?;

        let rule = "=".repeat(80);
        tracing::info!("{}", rule);
        tracing::info!("SUMMARY");
        tracing::info!("{}", rule);
        tracing::info!("Total analyses: {}", summary.total_analyses);
        tracing::info!("Successful: {}", summary.successful);
        tracing::info!("Failed: {}", summary.failed);
        tracing::info!("Timeout: {}", summary.timeout);
        tracing::info!("Error: {}", summary.error);
        tracing::info!("Summary saved to: {}", path.display());

        Ok(summary)
    }
}
