use crate::adapters::storage::LocalStorage;
use crate::config::connectivity::ConnectivityConfig;
use crate::core::discovery::fiber_base_name;
use crate::core::probe::check_dsi_studio;
use crate::domain::model::{
    AtlasResult, CommandSpec, DsiStudioInfo, ExtractionReport, ExtractionTotals, ProbeResult,
};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{DsiError, Result};
use crate::utils::logger::log_banner;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 對每個 atlas 執行一次 `--action=trk` 並整理輸出的連接矩陣
pub struct ConnectivityExtractor<R: CommandRunner> {
    runner: Arc<R>,
    config: ConnectivityConfig,
    cpu_count: Option<usize>,
}

impl<R: CommandRunner> ConnectivityExtractor<R> {
    pub fn new(runner: Arc<R>, config: ConnectivityConfig) -> Self {
        Self {
            runner,
            config,
            cpu_count: None,
        }
    }

    pub fn with_cpu_count(mut self, cpu_count: Option<usize>) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    pub async fn probe(&self) -> ProbeResult {
        check_dsi_studio(self.runner.as_ref(), &self.config.dsi_studio_cmd).await
    }

    /// `<out>/<base>_<timestamp>/<param_dir>/` 加上各分類子目錄
    pub fn create_output_structure(&self, output_dir: &Path, base_name: &str) -> Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let run_dir = output_dir
            .join(format!("{}_{}", base_name, timestamp))
            .join(self.config.parameter_dir_name());

        for atlas in &self.config.atlases {
            fs::create_dir_all(run_dir.join("by_atlas").join(atlas))?;
        }
        for value in &self.config.connectivity_values {
            fs::create_dir_all(run_dir.join("by_metric").join(value))?;
        }
        fs::create_dir_all(run_dir.join("combined"))?;
        fs::create_dir_all(run_dir.join("logs"))?;

        Ok(run_dir)
    }

    pub fn build_track_command(
        &self,
        input_file: &Path,
        run_dir: &Path,
        atlas: &str,
        base_name: &str,
    ) -> CommandSpec {
        let options = &self.config.connectivity_options;
        let output_prefix = run_dir
            .join("by_atlas")
            .join(atlas)
            .join(format!("{}_{}", base_name, atlas));

        CommandSpec::new(&self.config.dsi_studio_cmd)
            .arg("--action=trk")
            .arg(format!("--source={}", input_file.display()))
            .arg(format!("--tract_count={}", self.config.track_count))
            .arg(format!("--connectivity={}", atlas))
            .arg(format!(
                "--connectivity_value={}",
                self.config.connectivity_values.join(",")
            ))
            .arg(format!("--connectivity_type={}", options.connectivity_type))
            .arg(format!(
                "--connectivity_threshold={}",
                options.connectivity_threshold
            ))
            .arg(format!(
                "--connectivity_output={}",
                options.connectivity_output
            ))
            .arg(format!("--thread_count={}", self.config.thread_count))
            .arg(format!("--output={}.tt.gz", output_prefix.display()))
            .arg("--export=stat")
            .args(self.config.tracking_parameters.non_default_flags())
            .timeout(Duration::from_secs(self.config.timeout_seconds))
    }

    pub async fn extract_connectivity_matrix(
        &self,
        input_file: &Path,
        run_dir: &Path,
        atlas: &str,
        base_name: &str,
    ) -> Result<AtlasResult> {
        tracing::info!("🧠 Processing atlas: {}", atlas);

        let command = self.build_track_command(input_file, run_dir, atlas, base_name);
        let output = self.runner.run(&command).await?;

        if output.is_timeout() {
            tracing::error!("✗ Timeout while processing {}", atlas);
            return Ok(AtlasResult {
                atlas: atlas.to_string(),
                success: false,
                duration: self.config.timeout_seconds as f64,
                command: Some(command.display()),
                stdout: None,
                stderr: None,
                output_files: Vec::new(),
                error: Some("Timeout".to_string()),
            });
        }

        let duration = output.duration.as_secs_f64();
        let success = output.success();
        let mut error = None;
        if success {
            tracing::info!("✓ Successfully processed {} in {:.1}s", atlas, duration);
            // 整理失敗只記在這個 atlas 上，矩陣本身已經產生
            if let Err(e) = self.organize_output_files(run_dir, atlas, base_name) {
                tracing::error!("❌ Could not organize outputs for {}: {}", atlas, e);
                error = Some(format!("Failed to organize outputs: {}", e));
            }
        } else {
            tracing::error!("✗ Failed to process {}", atlas);
            tracing::error!("Error output: {}", output.stderr);
            error = Some(format!("DSI Studio exited with code {:?}", output.code()));
        }

        let atlas_dir = run_dir.join("by_atlas").join(atlas);
        let output_files = matching_files(
            &atlas_dir,
            &format!("{}*", glob::Pattern::escape(&format!("{}_{}", base_name, atlas))),
        )?
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

        Ok(AtlasResult {
            atlas: atlas.to_string(),
            success,
            duration,
            command: Some(command.display()),
            stdout: Some(output.stdout),
            stderr: Some(output.stderr),
            output_files,
            error,
        })
    }

    /// 依 metric 與合併目錄建立連結，檔案已存在就保留
    pub fn organize_output_files(&self, run_dir: &Path, atlas: &str, base_name: &str) -> Result<()> {
        let atlas_dir = run_dir.join("by_atlas").join(atlas);
        let prefix = glob::Pattern::escape(&format!("{}_{}", base_name, atlas));

        for value in &self.config.connectivity_values {
            let metric_dir = run_dir.join("by_metric").join(value);
            let pattern = format!(
                "{}.*.{}.*.connectivity.*",
                prefix,
                glob::Pattern::escape(value)
            );
            for file in matching_files(&atlas_dir, &pattern)? {
                let link = metric_dir.join(format!("{}_{}", atlas, file_name(&file)));
                link_or_copy(&file, &link)?;
            }
        }

        let combined_dir = run_dir.join("combined");
        for file in matching_files(&atlas_dir, "*.connectivity.*")? {
            let link = combined_dir.join(format!("{}_{}", atlas, file_name(&file)));
            link_or_copy(&file, &link)?;
        }

        Ok(())
    }

    pub async fn extract_all_matrices(
        &self,
        input_file: &Path,
        output_dir: &Path,
        atlases: Option<&[String]>,
    ) -> Result<ExtractionReport> {
        tracing::info!("🚀 Starting connectivity matrix extraction...");

        let validation = self.config.validate_configuration(self.cpu_count);
        validation.log();
        if !validation.valid {
            return Err(DsiError::ValidationError {
                message: format!(
                    "Configuration validation failed: {}",
                    validation.errors.join("; ")
                ),
            });
        }

        let probe = self.probe().await;
        if !probe.available {
            tracing::error!(
                "❌ DSI Studio not available: {}",
                probe.error.as_deref().unwrap_or("unknown error")
            );
            return Err(DsiError::ExecutableNotFound {
                path: probe.path.clone(),
            });
        }

        if !input_file.exists() {
            return Err(DsiError::input(
                input_file.display().to_string(),
                "Input file does not exist",
            ));
        }
        if !crate::core::discovery::is_fiber_file(input_file) {
            tracing::warn!(
                "⚠️  Input file should be .fib.gz or .fz: {}",
                input_file.display()
            );
        }

        let atlases: Vec<String> = match atlases {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => self.config.atlases.clone(),
        };
        let base_name = fiber_base_name(input_file);
        let run_dir = self.create_output_structure(output_dir, &base_name)?;

        log_banner(&format!(
            "🎯 Starting connectivity extraction for {} atlases",
            atlases.len()
        ));
        tracing::info!("📁 Input: {}", input_file.display());
        tracing::info!("📁 Output: {}", run_dir.display());
        tracing::info!("🧠 DSI Studio: {}", probe.path);
        if let Some(version) = &probe.version {
            tracing::info!("📊 Version: {}", version);
        }

        let mut results = Vec::with_capacity(atlases.len());
        for atlas in &atlases {
            // 缺少 by_atlas 目錄的自訂 atlas 也能處理
            fs::create_dir_all(run_dir.join("by_atlas").join(atlas))?;
            let result = self
                .extract_connectivity_matrix(input_file, &run_dir, atlas, &base_name)
                .await?;
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let report = ExtractionReport {
            input_file: input_file.display().to_string(),
            output_directory: run_dir.display().to_string(),
            timestamp: chrono::Local::now().to_rfc3339(),
            dsi_studio: DsiStudioInfo::from(&probe),
            config: serde_json::to_value(&self.config)?,
            summary: ExtractionTotals {
                total_atlases: atlases.len(),
                successful,
                failed: results.len() - successful,
                total_duration: results.iter().map(|r| r.duration).sum(),
            },
            results,
        };

        let storage = LocalStorage::new(&run_dir);
        storage
            .write_json("logs/extraction_summary.json", &report)
            .await?;
        write_results_csv(&run_dir.join("logs").join("processing_results.csv"), &report.results)?;
        storage
            .write_text("README.md", &self.render_readme(&base_name, &report.results))
            .await?;

        tracing::info!(
            "✅ Extraction completed: {}/{} successful",
            report.summary.successful,
            report.summary.total_atlases
        );
        Ok(report)
    }

    fn render_readme(&self, base_name: &str, results: &[AtlasResult]) -> String {
        let successful: Vec<&str> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.atlas.as_str())
            .collect();
        let failed: Vec<&str> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.atlas.as_str())
            .collect();

        let mut readme = format!(
            "# Connectivity Analysis Results for {base}\n\n\
             ## Directory Structure\n\n\
             📁 **by_atlas/** - Results organized by brain atlas\n   \
             └── Each atlas has its own subdirectory with all connectivity matrices\n\n\
             📁 **by_metric/** - Results organized by connectivity metric\n   \
             └── Each metric has links or copies from all atlases for easy comparison\n\n\
             📁 **combined/** - All connectivity matrices in one place\n   \
             └── Files renamed for easy identification: [atlas]_{base}_[atlas].[metric].connectivity.*\n\n\
             📁 **logs/** - Processing logs and summaries\n   \
             └── extraction_summary.json, processing_results.csv\n\n\
             ## Processing Summary\n\n",
            base = base_name
        );

        readme.push_str(&format!(
            "✅ **Successfully processed**: {}\n",
            successful.join(", ")
        ));
        if !failed.is_empty() {
            readme.push_str(&format!("❌ **Failed**: {}\n", failed.join(", ")));
        }
        readme.push_str(&format!(
            "\n📊 **Total matrices generated**: ~{}\n",
            successful.len() * self.config.connectivity_values.len()
        ));
        readme
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut files: Vec<PathBuf> = glob::glob(&full)?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn link_or_copy(source: &Path, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let target = fs::canonicalize(source)?;
        if std::os::unix::fs::symlink(&target, link).is_ok() {
            return Ok(());
        }
    }

    fs::copy(source, link)?;
    Ok(())
}

fn write_results_csv(path: &Path, results: &[AtlasResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["atlas", "success", "duration_seconds", "error"])?;
    for result in results {
        let duration = result.duration.to_string();
        writer.write_record([
            result.atlas.as_str(),
            if result.success { "True" } else { "False" },
            duration.as_str(),
            result.error.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
