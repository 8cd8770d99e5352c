use thiserror::Error;

#[derive(Error, Debug)]
pub enum DsiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid file pattern: {0}")]
    PatternError(#[from] glob::PatternError),

    #[error("Template rendering error: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Executable not found: {path}")]
    ExecutableNotFound { path: String },

    #[error("Command failed with exit code {code:?}: {command}")]
    ProcessFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out after {seconds}s: {command}")]
    ProcessTimeout { command: String, seconds: u64 },

    #[error("Invalid input '{path}': {reason}")]
    InputError { path: String, reason: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

pub type Result<T> = std::result::Result<T, DsiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Input,
    External,
    Filesystem,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DsiError {
    pub fn config(message: impl Into<String>) -> Self {
        DsiError::ConfigError {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        DsiError::ProcessingError {
            message: message.into(),
        }
    }

    pub fn input(path: impl Into<String>, reason: impl Into<String>) -> Self {
        DsiError::InputError {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DsiError::ConfigError { .. }
            | DsiError::ConfigValidationError { .. }
            | DsiError::InvalidConfigValueError { .. }
            | DsiError::MissingConfigError { .. }
            | DsiError::TomlError(_)
            | DsiError::ValidationError { .. } => ErrorCategory::Configuration,
            DsiError::InputError { .. } | DsiError::PatternError(_) => ErrorCategory::Input,
            DsiError::ExecutableNotFound { .. }
            | DsiError::ProcessFailed { .. }
            | DsiError::ProcessTimeout { .. } => ErrorCategory::External,
            DsiError::IoError(_) => ErrorCategory::Filesystem,
            DsiError::SerializationError(_)
            | DsiError::CsvError(_)
            | DsiError::TemplateError(_)
            | DsiError::ProcessingError { .. } => ErrorCategory::Data,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // 外部程式逾時通常可以重跑
            DsiError::ProcessTimeout { .. } => ErrorSeverity::Medium,
            DsiError::ProcessFailed { .. } => ErrorSeverity::Medium,
            DsiError::ExecutableNotFound { .. } | DsiError::IoError(_) => {
                ErrorSeverity::Critical
            }
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check the JSON configuration file and run dsi-validate before processing"
            }
            ErrorCategory::Input => {
                "Verify the input path exists and contains .fib.gz or .fz files"
            }
            ErrorCategory::External => match self {
                DsiError::ExecutableNotFound { .. } => {
                    "Install DSI Studio or pass its absolute path with --dsi_studio_cmd"
                }
                DsiError::ProcessTimeout { .. } => {
                    "Retry with fewer tracks, more threads or a longer timeout"
                }
                _ => "Inspect the DSI Studio stderr in the log file; try pilot mode first",
            },
            ErrorCategory::Filesystem => "Check permissions and free space in the output directory",
            ErrorCategory::Data => "Inspect the offending result file; it may be truncated",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            DsiError::ExecutableNotFound { path } => {
                format!("DSI Studio could not be found at '{}'", path)
            }
            DsiError::ProcessTimeout { seconds, .. } => {
                format!("DSI Studio did not finish within {} seconds", seconds)
            }
            DsiError::ProcessFailed { code, stderr, .. } => {
                let detail = stderr.lines().last().unwrap_or("").trim();
                format!("DSI Studio exited with code {:?}: {}", code, detail)
            }
            other => other.to_string(),
        }
    }

    /// 依嚴重程度對應的程式結束碼
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_executable_is_critical() {
        let err = DsiError::ExecutableNotFound {
            path: "/opt/dsi/dsi_studio".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::External);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.exit_code(), 3);
        assert!(err.user_friendly_message().contains("/opt/dsi/dsi_studio"));
    }

    #[test]
    fn test_config_errors_map_to_exit_code_one() {
        let err = DsiError::config("bad atlas list");
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.exit_code(), 1);
        assert!(err.recovery_suggestion().contains("dsi-validate"));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = DsiError::ProcessTimeout {
            command: "dsi_studio --action=trk".to_string(),
            seconds: 3600,
        };
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert_eq!(err.exit_code(), 2);
    }
}
