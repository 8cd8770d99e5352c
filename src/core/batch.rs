use crate::adapters::storage::LocalStorage;
use crate::core::discovery::{find_fib_files, select_pilot_files};
use crate::core::extract::ConnectivityExtractor;
use crate::domain::model::{BatchFileResult, BatchReport, BatchTotals, DsiStudioInfo};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{DsiError, Result};
use crate::utils::logger::log_banner;
use crate::utils::monitor::SystemMonitor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub pilot_mode: bool,
    pub pilot_count: usize,
    pub monitor: bool,
}

/// 目錄輸入即使沒有 `--batch` 也走批次流程
pub fn is_batch_input(batch_flag: bool, input: &Path) -> bool {
    batch_flag || input.is_dir()
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub pattern: String,
    pub recursive: bool,
    pub pilot: bool,
    pub pilot_count: usize,
    pub seed: Option<u64>,
    pub monitor: bool,
}

/// 搜尋目錄下的 FIB 檔，pilot 模式先抽樣，再交給 `run_extraction_batch`
pub async fn run_directory_batch<R: CommandRunner>(
    extractor: &ConnectivityExtractor<R>,
    input: &Path,
    output_dir: &Path,
    options: &DiscoveryOptions,
) -> Result<BatchReport> {
    let mut files = find_fib_files(input, &options.pattern, options.recursive)?;
    if files.is_empty() {
        return Err(DsiError::input(
            input.display().to_string(),
            format!("No files matching '{}' found", options.pattern),
        ));
    }

    if options.pilot {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        files = select_pilot_files(&files, options.pilot_count, &mut rng);
    }

    run_extraction_batch(
        extractor,
        &files,
        output_dir,
        &BatchOptions {
            pilot_mode: options.pilot,
            pilot_count: files.len(),
            monitor: options.monitor,
        },
    )
    .await
}

/// 逐一處理檔案；單一檔案失敗只記錄，不中斷批次
pub async fn run_extraction_batch<R: CommandRunner>(
    extractor: &ConnectivityExtractor<R>,
    files: &[PathBuf],
    output_dir: &Path,
    options: &BatchOptions,
) -> Result<BatchReport> {
    let monitor = SystemMonitor::new(options.monitor);
    monitor.log_stats("Batch start");

    tracing::info!("📊 Processing {} file(s)...", files.len());
    let mut processed_files = Vec::with_capacity(files.len());

    for (i, file) in files.iter().enumerate() {
        let display_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        log_banner(&format!(
            "Processing file {}/{}: {}",
            i + 1,
            files.len(),
            display_name
        ));

        match extractor.extract_all_matrices(file, output_dir, None).await {
            Ok(report) => {
                tracing::info!("✅ Successfully processed {}", display_name);
                processed_files.push(BatchFileResult {
                    file: file.display().to_string(),
                    success: true,
                    output_dir: Some(report.output_directory),
                    matrices_extracted: Some(report.summary.successful),
                    error: None,
                });
            }
            Err(e) => {
                tracing::error!("❌ Failed to process {}: {}", display_name, e);
                processed_files.push(BatchFileResult {
                    file: file.display().to_string(),
                    success: false,
                    output_dir: None,
                    matrices_extracted: None,
                    error: Some(e.to_string()),
                });
            }
        }

        monitor.log_stats(&format!("After {}", display_name));
    }

    let successful = processed_files.iter().filter(|r| r.success).count();
    let failed = processed_files.len() - successful;

    log_banner("BATCH PROCESSING SUMMARY");
    tracing::info!("📁 Total files processed: {}", processed_files.len());
    tracing::info!("✅ Successful: {}", successful);
    tracing::info!("❌ Failed: {}", failed);

    let probe = extractor.probe().await;
    let report = BatchReport {
        processed_files,
        dsi_studio: DsiStudioInfo::from(&probe),
        summary: BatchTotals {
            total: files.len(),
            successful,
            failed,
            pilot_mode: options.pilot_mode,
            pilot_count: options.pilot_mode.then_some(options.pilot_count),
        },
        timestamp: chrono::Local::now().to_rfc3339(),
    };

    if options.pilot_mode {
        tracing::info!("🧪 Pilot mode: {} file(s) tested", options.pilot_count);
        tracing::info!(
            "   Ready for full batch processing: {}",
            if report.ready_for_full_batch() { "YES" } else { "NO" }
        );
    }

    let summary_file = LocalStorage::new(output_dir)
        .write_json("batch_processing_summary.json", &report)
        .await?;
    tracing::info!("📄 Batch summary saved: {}", summary_file.display());

    monitor.log_final_stats();
    Ok(report)
}
