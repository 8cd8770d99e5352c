use crate::domain::model::{CommandOutput, CommandSpec, ExitOutcome};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{DsiError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn convert_exit_status(status: std::process::ExitStatus) -> ExitOutcome {
        if status.success() {
            return ExitOutcome::Success;
        }

        if let Some(code) = status.code() {
            return ExitOutcome::Failure(Some(code));
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Failure(Some(-signal));
            }
        }

        ExitOutcome::Failure(None)
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!("Executing subprocess: {}", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DsiError::ExecutableNotFound {
                    path: command.program.clone(),
                }
            } else {
                DsiError::IoError(e)
            }
        })?;

        // 逾時時 future 被丟棄，kill_on_drop 會終止子程序
        let output = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!("⏱️ Command timed out after {:?}: {}", limit, command.program);
                    return Ok(CommandOutput::timed_out(start.elapsed()));
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            outcome: Self::convert_exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }
}

type Handler = Box<dyn Fn(&CommandSpec) -> Option<Result<CommandOutput>> + Send + Sync>;

/// 記錄所有呼叫並依規則回應的替身，用於測試與不啟動 DSI Studio 的情境。
/// 沒有規則符合時回傳成功且輸出為空。
#[derive(Default)]
pub struct RecordingRunner {
    handlers: Mutex<Vec<Handler>>,
    history: Mutex<Vec<CommandSpec>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一個回傳 `Some` 的 handler 決定結果
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Option<Result<CommandOutput>> + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(Box::new(handler));
        }
        self
    }

    pub fn respond_when<P>(self, predicate: P, output: CommandOutput) -> Self
    where
        P: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.with_handler(move |spec| predicate(spec).then(|| Ok(output.clone())))
    }

    pub fn missing_program(self, program: &str) -> Self {
        let program = program.to_string();
        self.with_handler(move |spec| {
            (spec.program == program).then(|| {
                Err(DsiError::ExecutableNotFound {
                    path: spec.program.clone(),
                })
            })
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// 含有 `--action=<action>` 的呼叫
    pub fn calls_with_action(&self, action: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|spec| spec.flag_value("action") == Some(action))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        if let Ok(mut history) = self.history.lock() {
            history.push(command.clone());
        }

        let handlers = self
            .handlers
            .lock()
            .map_err(|_| DsiError::processing("recording runner lock poisoned"))?;

        for handler in handlers.iter() {
            if let Some(result) = handler(command) {
                return result;
            }
        }

        Ok(CommandOutput::succeeded(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recording_runner_matches_first_rule() {
        let runner = RecordingRunner::new()
            .respond_when(
                |spec| spec.args.contains(&"--version".to_string()),
                CommandOutput::succeeded("DSI Studio version: Hou \"侯\""),
            )
            .respond_when(|_| true, CommandOutput::failed(1, "boom"));

        let version = runner
            .run(&CommandSpec::new("dsi_studio").arg("--version"))
            .await
            .unwrap();
        assert!(version.success());
        assert!(version.stdout.contains("Hou"));

        let other = runner
            .run(&CommandSpec::new("dsi_studio").arg("--action=trk"))
            .await
            .unwrap();
        assert_eq!(other.code(), Some(1));
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.calls_with_action("trk").len(), 1);
    }

    #[tokio::test]
    async fn test_recording_runner_missing_program() {
        let runner = RecordingRunner::new().missing_program("dsi_studio");
        let result = runner.run(&CommandSpec::new("dsi_studio")).await;
        assert!(matches!(result, Err(DsiError::ExecutableNotFound { .. })));
    }

    #[tokio::test]
    async fn test_tokio_runner_reports_missing_executable() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-dsi-studio-binary")
            .timeout(Duration::from_secs(5));
        let result = runner.run(&spec).await;
        assert!(matches!(result, Err(DsiError::ExecutableNotFound { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output_and_exit_code() {
        let runner = TokioCommandRunner::new();

        let ok = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo tracking done"]))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "tracking done");

        let failed = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(failed.code(), Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_times_out() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));

        let output = runner.run(&spec).await.unwrap();
        assert!(output.is_timeout());
        assert_eq!(output.code(), None);
    }
}
