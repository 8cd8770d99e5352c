use crate::utils::error::Result;
use crate::utils::validation::ValidationReport;
use rand::Rng;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_PATTERN: &str = "*.fib.gz";

pub fn is_fiber_file(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".fib.gz") || name.ends_with(".fz")
}

/// `subject01.fib.gz` → `subject01`, `subject01.fz` → `subject01`
pub fn fiber_base_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for suffix in [".fib.gz", ".fz", ".gz"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name
}

fn base_patterns(pattern: &str) -> Vec<String> {
    if pattern == DEFAULT_PATTERN {
        return vec!["*.fib.gz".to_string(), "*.fz".to_string()];
    }

    let mut patterns = vec![pattern.to_string()];
    if !pattern.ends_with(".fz") {
        let fz_pattern = pattern.replace(".fib.gz", ".fz");
        if fz_pattern != pattern {
            patterns.push(fz_pattern);
        }
    }
    patterns
}

/// 搜尋 `.fib.gz` 與 `.fz` 纖維檔，結果排序且不重複
pub fn find_fib_files(input_dir: &Path, pattern: &str, recursive: bool) -> Result<Vec<PathBuf>> {
    let escaped_dir = glob::Pattern::escape(&input_dir.to_string_lossy());

    let mut search_patterns = Vec::new();
    for base in base_patterns(pattern) {
        search_patterns.push(format!("{}/{}", escaped_dir, base));
        if recursive {
            search_patterns.push(format!("{}/**/{}", escaped_dir, base));
        }
    }

    let mut unique = BTreeSet::new();
    for search in &search_patterns {
        for entry in glob::glob(search)? {
            match entry {
                Ok(path) if path.is_file() => {
                    unique.insert(path);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️  Unreadable path during search: {}", e),
            }
        }
    }

    let files: Vec<PathBuf> = unique.into_iter().collect();
    let fz_count = files
        .iter()
        .filter(|f| f.to_string_lossy().ends_with(".fz"))
        .count();
    let fib_gz_count = files
        .iter()
        .filter(|f| f.to_string_lossy().ends_with(".fib.gz"))
        .count();

    tracing::info!(
        "🔍 Found {} fiber files in {}",
        files.len(),
        input_dir.display()
    );
    if fz_count > 0 {
        tracing::info!("  - {} .fz files", fz_count);
    }
    if fib_gz_count > 0 {
        tracing::info!("  - {} .fib.gz files", fib_gz_count);
    }
    for (i, file) in files.iter().take(5).enumerate() {
        tracing::info!(
            "    {}. {}",
            i + 1,
            file.file_name().unwrap_or_default().to_string_lossy()
        );
    }
    if files.len() > 5 {
        tracing::info!("    ... and {} more", files.len() - 5);
    }

    Ok(files)
}

/// 不重複抽樣；數量不小於清單長度時回傳全部
pub fn select_pilot_files<R: Rng + ?Sized>(
    files: &[PathBuf],
    count: usize,
    rng: &mut R,
) -> Vec<PathBuf> {
    if files.is_empty() {
        tracing::warn!("⚠️  No files available for pilot selection");
        return Vec::new();
    }

    if count >= files.len() {
        tracing::info!(
            "Pilot count ({}) >= available files ({}), using all files",
            count,
            files.len()
        );
        return files.to_vec();
    }

    let selected: Vec<PathBuf> = rand::seq::index::sample(rng, files.len(), count)
        .into_iter()
        .map(|i| files[i].clone())
        .collect();

    tracing::info!("🧪 Selected {} pilot files:", selected.len());
    for file in &selected {
        tracing::info!(
            "  - {}",
            file.file_name().unwrap_or_default().to_string_lossy()
        );
    }
    selected
}

#[derive(Debug, Clone)]
pub struct InputValidation {
    pub report: ValidationReport,
    pub files_found: Vec<PathBuf>,
}

pub fn validate_input_path(input: &Path, pattern: &str, recursive: bool) -> Result<InputValidation> {
    let mut report = ValidationReport::new();

    if !input.exists() {
        report.error(format!("Input path does not exist: {}", input.display()));
        return Ok(InputValidation {
            report,
            files_found: Vec::new(),
        });
    }

    if input.is_file() {
        if !is_fiber_file(input) {
            report.warning(format!(
                "File extension should be .fib.gz or .fz: {}",
                input.display()
            ));
        }
        report.note(format!(
            "Single file mode: {}",
            input.file_name().unwrap_or_default().to_string_lossy()
        ));
        return Ok(InputValidation {
            report,
            files_found: vec![input.to_path_buf()],
        });
    }

    if input.is_dir() {
        tracing::info!("🔍 Scanning directory: {}", input.display());
        let files_found = find_fib_files(input, pattern, recursive)?;
        if files_found.is_empty() {
            report.error(format!(
                "No fiber files found in directory: {}",
                input.display()
            ));
        }
        return Ok(InputValidation {
            report,
            files_found,
        });
    }

    report.error(format!(
        "Input path is neither file nor directory: {}",
        input.display()
    ));
    Ok(InputValidation {
        report,
        files_found: Vec::new(),
    })
}
