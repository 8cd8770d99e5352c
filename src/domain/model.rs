use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// 一次外部程式呼叫的描述
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `--name=value` 形式參數的值
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{}=", name);
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flag_value(name).is_some()
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// 非零結束碼；被 signal 終止時為負的 signal 編號
    Failure(Option<i32>),
    Timeout,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub outcome: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            outcome: ExitOutcome::Success,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::from_millis(10),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            outcome: ExitOutcome::Failure(Some(code)),
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::from_millis(10),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            outcome: ExitOutcome::Timeout,
            stdout: String::new(),
            stderr: String::new(),
            duration: after,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, ExitOutcome::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, ExitOutcome::Timeout)
    }

    pub fn code(&self) -> Option<i32> {
        match self.outcome {
            ExitOutcome::Success => Some(0),
            ExitOutcome::Failure(code) => code,
            ExitOutcome::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub available: bool,
    pub path: String,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn unavailable(path: &str, error: impl Into<String>) -> Self {
        Self {
            available: false,
            path: path.to_string(),
            version: None,
            error: Some(error.into()),
        }
    }
}

/// 摘要檔中記錄的 DSI Studio 資訊
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsiStudioInfo {
    pub path: String,
    pub version: String,
    pub available: bool,
}

impl From<&ProbeResult> for DsiStudioInfo {
    fn from(probe: &ProbeResult) -> Self {
        Self {
            path: probe.path.clone(),
            version: probe
                .version
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            available: probe.available,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasResult {
    pub atlas: String,
    pub success: bool,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTotals {
    pub total_atlases: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub input_file: String,
    pub output_directory: String,
    pub timestamp: String,
    pub dsi_studio: DsiStudioInfo,
    pub config: Value,
    pub results: Vec<AtlasResult>,
    pub summary: ExtractionTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFileResult {
    pub file: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrices_extracted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTotals {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pilot_mode: bool,
    pub pilot_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed_files: Vec<BatchFileResult>,
    pub dsi_studio: DsiStudioInfo,
    pub summary: BatchTotals,
    pub timestamp: String,
}

impl BatchReport {
    /// pilot 至少成功一個檔案才建議進行完整批次
    pub fn ready_for_full_batch(&self) -> bool {
        self.summary.successful > 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Timeout,
    Error,
    Planned,
}

impl AnalysisStatus {
    /// 可以用 `--retry-failed` 重跑的狀態
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Failed | AnalysisStatus::Timeout | AnalysisStatus::Error
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisResult {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub status: AnalysisStatus,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_increased: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_decreased: Option<bool>,
}

impl AnalysisResult {
    pub fn pending(name: &str, params: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            params,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub config_file: String,
    pub total_analyses: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    pub analyses: Vec<AnalysisResult>,
}

impl AnalysisSummary {
    pub fn from_results(config_file: &str, results: &[AnalysisResult]) -> Self {
        let count = |status: AnalysisStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            config_file: config_file.to_string(),
            total_analyses: results.len(),
            successful: count(AnalysisStatus::Success),
            failed: count(AnalysisStatus::Failed),
            timeout: count(AnalysisStatus::Timeout),
            error: count(AnalysisStatus::Error),
            analyses: results.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub dwi_file: String,
    pub src_file: Option<String>,
    pub fib_file: Option<String>,
    pub param0: String,
    pub timestamp: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub found: usize,
    pub processed: usize,
    pub skipped_missing: usize,
    pub skipped_existing: usize,
    pub src_ok: usize,
    pub fib_ok: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_flags() {
        let spec = CommandSpec::new("dsi_studio")
            .arg("--action=cnt")
            .arg("--output=/tmp/run/qa_0.3");

        assert_eq!(spec.flag_value("output"), Some("/tmp/run/qa_0.3"));
        assert!(spec.has_flag("action"));
        assert!(!spec.has_flag("source"));
        assert_eq!(
            spec.display(),
            "dsi_studio --action=cnt --output=/tmp/run/qa_0.3"
        );
    }

    #[test]
    fn test_summary_counts_statuses() {
        let mut ok = AnalysisResult::pending("a", Map::new());
        ok.status = AnalysisStatus::Success;
        let mut failed = AnalysisResult::pending("b", Map::new());
        failed.status = AnalysisStatus::Failed;
        let mut timeout = AnalysisResult::pending("c", Map::new());
        timeout.status = AnalysisStatus::Timeout;

        let summary = AnalysisSummary::from_results("cfg.json", &[ok, failed, timeout]);
        assert_eq!(summary.total_analyses, 3);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timeout, 1);
        assert_eq!(summary.error, 0);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&AnalysisStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert!(AnalysisStatus::Error.is_retryable());
        assert!(!AnalysisStatus::Success.is_retryable());
    }
}
