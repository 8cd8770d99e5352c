use crate::utils::error::{DsiError, Result};
use serde::{Deserialize, Serialize};

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// 累積式的驗證結果：錯誤會讓 `valid` 變成 false，警告與提示不會
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.info.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }

    pub fn log(&self) {
        if self.valid {
            tracing::info!("✅ Configuration validation passed");
        } else {
            tracing::error!("❌ Configuration validation failed");
        }

        if !self.warnings.is_empty() {
            tracing::warn!("⚠️  {} warning(s) found", self.warnings.len());
            for warning in &self.warnings {
                tracing::warn!("   - {}", warning);
            }
        }

        if !self.errors.is_empty() {
            tracing::error!("❌ {} error(s) found", self.errors.len());
            for error in &self.errors {
                tracing::error!("   - {}", error);
            }
        }
    }

    pub fn into_result(self) -> Result<ValidationReport> {
        if self.valid {
            Ok(self)
        } else {
            Err(DsiError::ValidationError {
                message: self.errors.join("; "),
            })
        }
    }
}

fn invalid(field_name: &str, value: impl ToString, reason: impl Into<String>) -> DsiError {
    DsiError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// 路徑或命令字串：不可為空、不可含 NUL
pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(invalid(field_name, path, "Path cannot be empty"));
    }
    if path.contains('\0') {
        return Err(invalid(field_name, path, "Path contains null bytes"));
    }
    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: i64, min_value: i64) -> Result<()> {
    if value < min_value {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be at least {}", min_value),
        ));
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field_name, value, "Value cannot be empty or whitespace-only"));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

pub fn validate_one_of(field_name: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if !allowed.contains(&value) {
        return Err(invalid(
            field_name,
            value,
            format!("Allowed values: {}", allowed.join(", ")),
        ));
    }
    Ok(())
}
