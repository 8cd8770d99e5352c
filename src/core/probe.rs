use crate::domain::model::{CommandSpec, ProbeResult};
use crate::domain::ports::CommandRunner;
use crate::utils::error::DsiError;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const HELP_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// 確認 DSI Studio 可以執行並取得版本字串。
///
/// 使用 `--version` 避免啟動 GUI；失敗時改試 `--help`。
/// 這個函式不回傳錯誤，所有問題都記錄在 `ProbeResult::error`。
pub async fn check_dsi_studio<R: CommandRunner + ?Sized>(runner: &R, dsi_cmd: &str) -> ProbeResult {
    let cmd_path = Path::new(dsi_cmd);
    if cmd_path.is_absolute() {
        if !cmd_path.exists() {
            return ProbeResult::unavailable(
                dsi_cmd,
                format!("DSI Studio executable not found at: {}", dsi_cmd),
            );
        }
        if !is_executable(cmd_path) {
            return ProbeResult::unavailable(
                dsi_cmd,
                format!("DSI Studio executable is not executable: {}", dsi_cmd),
            );
        }
    }

    let version_cmd = CommandSpec::new(dsi_cmd)
        .arg("--version")
        .timeout(VERSION_TIMEOUT);

    let version_output = match runner.run(&version_cmd).await {
        Ok(output) => output,
        Err(DsiError::ExecutableNotFound { .. }) => {
            return ProbeResult::unavailable(
                dsi_cmd,
                format!(
                    "DSI Studio command not found: {}. Check PATH or use absolute path.",
                    dsi_cmd
                ),
            );
        }
        Err(e) => {
            return ProbeResult::unavailable(
                dsi_cmd,
                format!("Error running DSI Studio --version: {}", e),
            );
        }
    };

    if version_output.is_timeout() {
        return ProbeResult::unavailable(dsi_cmd, "DSI Studio --version command timed out");
    }

    if version_output.success() {
        // 有些版本把版本資訊寫到 stderr
        let version = if !version_output.stdout.trim().is_empty() {
            version_output.stdout.trim().to_string()
        } else if !version_output.stderr.trim().is_empty() {
            version_output.stderr.trim().to_string()
        } else {
            "Version detected but no output".to_string()
        };

        return ProbeResult {
            available: true,
            path: dsi_cmd.to_string(),
            version: Some(version),
            error: None,
        };
    }

    let help_cmd = CommandSpec::new(dsi_cmd).arg("--help").timeout(HELP_TIMEOUT);
    match runner.run(&help_cmd).await {
        Ok(help) if help.is_timeout() => ProbeResult::unavailable(
            dsi_cmd,
            "DSI Studio --help command timed out (GUI launch issue?)",
        ),
        Ok(help) if help.success() => ProbeResult {
            available: true,
            path: dsi_cmd.to_string(),
            version: Some("Version unknown (--help works)".to_string()),
            error: None,
        },
        Ok(_) => ProbeResult::unavailable(
            dsi_cmd,
            format!(
                "DSI Studio returned error code {}",
                version_output
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        ),
        Err(e) => ProbeResult::unavailable(
            dsi_cmd,
            format!("Error testing DSI Studio --help: {}", e),
        ),
    }
}

/// 查詢 GPU，任何失敗只產生警告
pub async fn check_cuda<R: CommandRunner + ?Sized>(runner: &R) -> Vec<String> {
    let cmd = CommandSpec::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used",
            "--format=csv,noheader",
        ])
        .timeout(HELP_TIMEOUT);

    match runner.run(&cmd).await {
        Ok(output) if output.success() => {
            let gpus: Vec<String> = output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            for gpu in &gpus {
                tracing::info!("🎮 GPU: {}", gpu);
            }
            if gpus.is_empty() {
                tracing::warn!("⚠️  nvidia-smi reported no GPUs");
            }
            gpus
        }
        Ok(output) if output.is_timeout() => {
            tracing::warn!("⚠️  nvidia-smi timed out");
            Vec::new()
        }
        Ok(output) => {
            tracing::warn!(
                "⚠️  nvidia-smi failed (code {:?}): {}",
                output.code(),
                output.stderr.trim()
            );
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("⚠️  CUDA not available: {}", e);
            Vec::new()
        }
    }
}

/// 在 PATH 中尋找可執行檔
pub fn which(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file() && is_executable(candidate))
}

/// Linux 且沒有 `DISPLAY` 時回傳 `xvfb-run` 的路徑
pub fn find_xvfb() -> Option<PathBuf> {
    if !cfg!(target_os = "linux") || std::env::var_os("DISPLAY").is_some() {
        return None;
    }
    which("xvfb-run")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::process::RecordingRunner;
    use crate::domain::model::CommandOutput;

    fn is_flag(spec: &CommandSpec, flag: &str) -> bool {
        spec.args.iter().any(|a| a == flag)
    }

    #[tokio::test]
    async fn test_version_from_stdout() {
        let runner = RecordingRunner::new().respond_when(
            |spec| is_flag(spec, "--version"),
            CommandOutput::succeeded("DSI Studio version: Hou \"侯\" 2024\n"),
        );

        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(probe.available);
        assert_eq!(probe.version.as_deref(), Some("DSI Studio version: Hou \"侯\" 2024"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_version_without_output() {
        let runner = RecordingRunner::new();
        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(probe.available);
        assert_eq!(
            probe.version.as_deref(),
            Some("Version detected but no output")
        );
    }

    #[tokio::test]
    async fn test_help_fallback() {
        let runner = RecordingRunner::new().respond_when(
            |spec| is_flag(spec, "--version"),
            CommandOutput::failed(1, "unknown option"),
        );

        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(probe.available);
        assert_eq!(
            probe.version.as_deref(),
            Some("Version unknown (--help works)")
        );
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].timeout, Some(HELP_TIMEOUT));
    }

    #[tokio::test]
    async fn test_both_probes_fail() {
        let runner = RecordingRunner::new().respond_when(|_| true, CommandOutput::failed(2, ""));
        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(!probe.available);
        assert_eq!(
            probe.error.as_deref(),
            Some("DSI Studio returned error code 2")
        );
    }

    #[tokio::test]
    async fn test_missing_on_path() {
        let runner = RecordingRunner::new().missing_program("dsi_studio");
        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(!probe.available);
        assert!(probe.error.unwrap().contains("Check PATH"));
    }

    #[tokio::test]
    async fn test_missing_absolute_path_skips_execution() {
        let runner = RecordingRunner::new();
        let probe = check_dsi_studio(&runner, "/nonexistent/dsi-studio/dsi_studio").await;
        assert!(!probe.available);
        assert!(probe.error.unwrap().contains("not found at"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_version_timeout() {
        let runner = RecordingRunner::new().respond_when(
            |_| true,
            CommandOutput::timed_out(VERSION_TIMEOUT),
        );
        let probe = check_dsi_studio(&runner, "dsi_studio").await;
        assert!(!probe.available);
        assert_eq!(
            probe.error.as_deref(),
            Some("DSI Studio --version command timed out")
        );
    }

    #[tokio::test]
    async fn test_cuda_lines() {
        let runner = RecordingRunner::new().respond_when(
            |spec| spec.program == "nvidia-smi",
            CommandOutput::succeeded("NVIDIA A100, 40960 MiB, 10 MiB\n\n"),
        );
        let gpus = check_cuda(&runner).await;
        assert_eq!(gpus, vec!["NVIDIA A100, 40960 MiB, 10 MiB"]);

        let missing = RecordingRunner::new().missing_program("nvidia-smi");
        assert!(check_cuda(&missing).await.is_empty());
    }
}
