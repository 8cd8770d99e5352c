use crate::config::connectivity::{ConnectivityConfig, ExtractOverrides};
use crate::core::extract::ConnectivityExtractor;
use crate::core::probe::{check_cuda, check_dsi_studio};
use crate::domain::model::{CommandSpec, PipelineStats, SessionRecord, SessionStatus};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{DsiError, Result};
use flate2::read::GzDecoder;
use rand::seq::IndexedRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>DSI Studio Processing Report - {{ subject_id }}</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; background: #f5f5f5; }
        .container { max-width: 1200px; margin: 0 auto; background: white; padding: 20px; border-radius: 8px; }
        h1 { color: #2c3e50; border-bottom: 3px solid #3498db; padding-bottom: 10px; }
        .session { background: #ecf0f1; padding: 15px; margin: 10px 0; border-radius: 5px; border-left: 4px solid #3498db; }
        .success { color: #27ae60; font-weight: bold; }
        .failed { color: #e74c3c; font-weight: bold; }
        .info { color: #7f8c8d; font-size: 0.9em; }
        table { width: 100%; border-collapse: collapse; margin: 10px 0; }
        th, td { padding: 10px; text-align: left; border-bottom: 1px solid #ddd; }
        th { background: #34495e; color: white; }
        .timestamp { color: #95a5a6; font-size: 0.85em; }
    </style>
</head>
<body>
    <div class="container">
        <h1>DSI Studio Processing Report: {{ subject_id }}</h1>
        <p class="timestamp">Generated: {{ generated }}</p>

        <h2>Processing Summary</h2>
        <table>
            <tr><th>Metric</th><th>Value</th></tr>
            <tr><td>Total Sessions</td><td>{{ sessions | length }}</td></tr>
            <tr><td>Successful</td><td class="success">{{ successful }}</td></tr>
            <tr><td>Failed</td><td class="failed">{{ failed }}</td></tr>
        </table>

        <h2>Session Details</h2>
{% for session in sessions %}
        <div class="session">
            <h3>Session: {{ session.session_id }}</h3>
            <p><strong>Status:</strong> <span class="{{ session.status }}">{{ session.status | upper }}</span></p>
            <p class="info">DWI: {{ session.dwi_file }}</p>
            <p class="info">SRC: {% if session.src_file %}{{ session.src_file }}{% else %}N/A{% endif %}</p>
            <p class="info">FIB: {% if session.fib_file %}{{ session.fib_file }}{% else %}N/A{% endif %}</p>
            <p class="info">Method: {{ method }} (param0={{ session.param0 }})</p>
            <p class="timestamp">Processed: {{ session.timestamp }}</p>
        </div>
{% endfor %}
    </div>
</body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub qsiprep_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dsi_studio_cmd: String,
    /// 4=GQI, 7=QSDR
    pub method: String,
    pub param0: String,
    pub threads: String,
    pub db_name: String,
    pub rawdata_dir: Option<PathBuf>,
    pub verify_rawdata: bool,
    pub require_mask: bool,
    pub require_t1w: bool,
    pub skip_existing: bool,
    /// 比這個秒數新的檔案可能還在寫入
    pub min_file_age: u64,
    pub pilot: bool,
    pub dry_run: bool,
    pub run_connectivity: bool,
    pub connectivity_config: Option<PathBuf>,
    pub connectivity_output_dir: Option<PathBuf>,
    pub connectivity_threads: Option<i64>,
    pub diff_cmd: Option<String>,
}

impl PipelineOptions {
    pub fn new(qsiprep_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            qsiprep_dir: qsiprep_dir.into(),
            output_dir: output_dir.into(),
            dsi_studio_cmd: "dsi_studio".to_string(),
            method: "4".to_string(),
            param0: "1.25".to_string(),
            threads: "8".to_string(),
            db_name: "connectometry.db.fib.gz".to_string(),
            rawdata_dir: None,
            verify_rawdata: false,
            require_mask: false,
            require_t1w: false,
            skip_existing: false,
            min_file_age: 300,
            pilot: false,
            dry_run: false,
            run_connectivity: false,
            connectivity_config: None,
            connectivity_output_dir: None,
            connectivity_threads: None,
            diff_cmd: None,
        }
    }
}

/// 檔名中第一個 `sub-*` 與 `ses-*`；session 在第一個 `.` 截斷
pub fn parse_sub_ses(file_name: &str) -> (String, String) {
    let parts: Vec<&str> = file_name.split('_').collect();
    let sub = parts
        .iter()
        .find(|p| p.starts_with("sub-"))
        .map(|p| p.to_string())
        .unwrap_or_default();
    let ses = parts
        .iter()
        .find(|p| p.starts_with("ses-"))
        .and_then(|p| p.split('.').next())
        .map(str::to_string)
        .unwrap_or_default();
    (sub, ses)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `x_dwi.nii.gz` → `x_dwi.<ext>`
fn gradient_file(dwi: &Path, ext: &str) -> PathBuf {
    let name = file_name_of(dwi);
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    dwi.with_file_name(format!("{}.{}", stem, ext))
}

fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut paths: Vec<PathBuf> = glob::glob(&full)?.filter_map(|e| e.ok()).collect();
    paths.sort();
    Ok(paths)
}

fn non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn age_seconds(path: &Path, now: SystemTime) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map(|age| age.as_secs_f64())
        .unwrap_or(0.0)
}

/// 解壓 DSI Studio 產生的 `.sz`，成功後刪除壓縮檔
pub fn decompress_sz(archive: &Path) -> Result<PathBuf> {
    let dest = archive.with_extension("");
    let mut decoder = GzDecoder::new(File::open(archive)?);
    let mut out = File::create(&dest)?;
    io::copy(&mut decoder, &mut out)?;
    fs::remove_file(archive)?;
    Ok(dest)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCheck {
    pub missing: Vec<(String, String)>,
    pub extra: Vec<(String, String)>,
}

pub struct PreprocessingPipeline<R: CommandRunner> {
    runner: Arc<R>,
    options: PipelineOptions,
    rawdata_dir: PathBuf,
    connectivity_output_dir: PathBuf,
    src_dir: PathBuf,
    fib_dir: PathBuf,
    diff_dir: PathBuf,
    reports_dir: PathBuf,
    stats: PipelineStats,
    subject_details: BTreeMap<String, Vec<SessionRecord>>,
}

impl<R: CommandRunner> PreprocessingPipeline<R> {
    pub fn new(runner: Arc<R>, options: PipelineOptions) -> Result<Self> {
        let output_dir = &options.output_dir;
        let rawdata_dir = options.rawdata_dir.clone().unwrap_or_else(|| {
            options
                .qsiprep_dir
                .parent()
                .unwrap_or(Path::new("."))
                .join("rawdata")
        });
        let connectivity_output_dir = options
            .connectivity_output_dir
            .clone()
            .unwrap_or_else(|| output_dir.join("connectivity"));

        let src_dir = output_dir.join("src");
        let fib_dir = output_dir.join("fib");
        let diff_dir = output_dir.join("diff");
        let reports_dir = output_dir.join("reports");
        for dir in [&src_dir, &fib_dir, &diff_dir, &reports_dir, &connectivity_output_dir] {
            fs::create_dir_all(dir)?;
        }

        tracing::info!("🚀 Starting DSI Studio Pipeline");
        tracing::info!("QSIPREP Dir: {}", options.qsiprep_dir.display());
        tracing::info!("Output Dir: {}", output_dir.display());

        Ok(Self {
            runner,
            options,
            rawdata_dir,
            connectivity_output_dir,
            src_dir,
            fib_dir,
            diff_dir,
            reports_dir,
            stats: PipelineStats::default(),
            subject_details: BTreeMap::new(),
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn fib_dir(&self) -> &Path {
        &self.fib_dir
    }

    /// DSI Studio 不可用時中止（dry run 除外）；CUDA 只做提示
    pub async fn preflight(&self) -> Result<()> {
        let probe = check_dsi_studio(self.runner.as_ref(), &self.options.dsi_studio_cmd).await;
        if probe.available {
            tracing::info!(
                "🔧 DSI Studio version: {}",
                probe.version.as_deref().unwrap_or("Unknown")
            );
        } else {
            tracing::error!(
                "❌ DSI Studio command '{}' not found or failed: {}",
                self.options.dsi_studio_cmd,
                probe.error.as_deref().unwrap_or("unknown error")
            );
            if !self.options.dry_run {
                return Err(DsiError::ExecutableNotFound {
                    path: self.options.dsi_studio_cmd.clone(),
                });
            }
        }

        check_cuda(self.runner.as_ref()).await;
        Ok(())
    }

    async fn run_command(&self, spec: &CommandSpec) -> Result<bool> {
        tracing::info!("Running: {}", spec.display());
        if self.options.dry_run {
            return Ok(true);
        }

        let output = self.runner.run(spec).await?;
        if output.success() {
            if !output.stdout.is_empty() {
                tracing::debug!("{}", output.stdout);
            }
            return Ok(true);
        }

        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        if output.is_timeout() {
            tracing::error!("Command timed out: {}", spec.program);
        } else {
            tracing::error!("Command failed with error: {}", detail);
        }
        Ok(false)
    }

    fn preproc_dwi_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = glob_in(root, "sub-*/dwi/*_desc-preproc_dwi.nii.gz")?;
        files.extend(glob_in(root, "sub-*/ses-*/dwi/*_desc-preproc_dwi.nii.gz")?);
        Ok(files)
    }

    pub fn verify_raw_vs_qsiprep(&self) -> Result<RawCheck> {
        if !self.rawdata_dir.exists() {
            tracing::warn!(
                "⚠️  Rawdata directory not found: {}; skipping raw-vs-qsiprep check.",
                self.rawdata_dir.display()
            );
            return Ok(RawCheck::default());
        }

        let mut raw_files = glob_in(&self.rawdata_dir, "sub-*/dwi/*_dwi.nii.gz")?;
        raw_files.extend(glob_in(&self.rawdata_dir, "sub-*/ses-*/dwi/*_dwi.nii.gz")?);
        let raw_keys: BTreeSet<(String, String)> = raw_files
            .iter()
            .map(|f| parse_sub_ses(&file_name_of(f)))
            .collect();

        let qsi_keys: BTreeSet<(String, String)> = self
            .preproc_dwi_files(&self.options.qsiprep_dir)?
            .iter()
            .map(|f| parse_sub_ses(&file_name_of(f)))
            .collect();

        let check = RawCheck {
            missing: raw_keys.difference(&qsi_keys).cloned().collect(),
            extra: qsi_keys.difference(&raw_keys).cloned().collect(),
        };

        if check.missing.is_empty() {
            tracing::info!(
                "✅ Rawdata vs qsiprep check: all raw subjects/sessions present in qsiprep outputs."
            );
        } else {
            tracing::warn!(
                "⚠️  Rawdata subjects/sessions missing in qsiprep: {:?}",
                check.missing
            );
        }
        if !check.extra.is_empty() {
            tracing::info!(
                "qsiprep has extra subjects/sessions not in rawdata: {:?}",
                check.extra
            );
        }
        Ok(check)
    }

    /// 找出有 bval/bvec 且已寫入完成的前處理 DWI
    pub fn find_qsiprep_files(&mut self, now: SystemTime) -> Result<Vec<PathBuf>> {
        let mut all_dwi = self.preproc_dwi_files(&self.options.qsiprep_dir)?;
        if all_dwi.is_empty() {
            all_dwi = glob_in(&self.options.qsiprep_dir, "*_desc-preproc_dwi.nii.gz")?;
        }

        let mut valid = Vec::new();
        for dwi in all_dwi {
            let name = file_name_of(&dwi);
            let bval = gradient_file(&dwi, "bval");
            let bvec = gradient_file(&dwi, "bvec");

            if !bval.exists() || !bvec.exists() {
                tracing::warn!("⚠️  Skipping {}: Missing .bval or .bvec", name);
                self.stats.skipped_missing += 1;
                continue;
            }
            if !non_empty(&dwi) || !non_empty(&bval) || !non_empty(&bvec) {
                tracing::warn!(
                    "⚠️  Skipping {}: One of the files is empty (nii/bval/bvec)",
                    name
                );
                self.stats.skipped_missing += 1;
                continue;
            }

            if self.options.min_file_age > 0 {
                let youngest = [&dwi, &bval, &bvec]
                    .iter()
                    .map(|p| age_seconds(p, now))
                    .fold(f64::INFINITY, f64::min);
                if youngest < self.options.min_file_age as f64 {
                    tracing::info!(
                        "Skipping {}: Files too recent (age: {:.0}s < {}s, likely still being written)",
                        name,
                        youngest,
                        self.options.min_file_age
                    );
                    self.stats.skipped_missing += 1;
                    continue;
                }
            }

            valid.push(dwi);
        }

        if valid.is_empty() {
            tracing::error!("❌ No valid DWI files (with bval/bvec) found!");
            self.stats.found = 0;
            return Ok(valid);
        }

        self.stats.found = valid.len();

        if self.options.pilot {
            let subjects: Vec<String> = valid
                .iter()
                .map(|f| file_name_of(f).split('_').next().unwrap_or_default().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if let Some(selected) = subjects.choose(&mut rand::rng()) {
                let prefix = format!("{}_", selected);
                let files: Vec<PathBuf> = valid
                    .into_iter()
                    .filter(|f| file_name_of(f).starts_with(&prefix))
                    .collect();
                tracing::info!(
                    "🧪 PILOT MODE: Randomly selected subject {} ({} files)",
                    selected,
                    files.len()
                );
                return Ok(files);
            }
        }

        tracing::info!("Found {} valid DWI files", valid.len());
        Ok(valid)
    }

    pub async fn generate_src(&mut self, dwi: &Path) -> Result<Option<PathBuf>> {
        let name = file_name_of(dwi);
        let mut tokens = name.split('_');
        let subject_id = tokens.next().unwrap_or_default().to_string();
        let session_id = if name.contains("_ses-") {
            format!("_{}", tokens.next().unwrap_or_default())
        } else {
            String::new()
        };
        let base_id = format!("{}{}", subject_id, session_id);

        let bval = gradient_file(dwi, "bval");
        let bvec = gradient_file(dwi, "bvec");
        if !bval.exists() || !bvec.exists() {
            tracing::warn!("⚠️  Missing bval/bvec for {}, skipping.", name);
            return Ok(None);
        }

        let output_src = self.src_dir.join(format!("{}.src.gz", base_id));
        let mut spec = CommandSpec::new(&self.options.dsi_studio_cmd)
            .arg("--action=src")
            .arg(format!("--source={}", dwi.display()))
            .arg(format!("--bval={}", bval.display()))
            .arg(format!("--bvec={}", bvec.display()))
            .arg(format!("--output={}", output_src.display()));

        let t1w = match dwi.parent().and_then(Path::parent) {
            Some(session_dir) => glob_in(
                &session_dir.join("anat"),
                &format!("{}_*desc-preproc_T1w.nii.gz", glob::Pattern::escape(&subject_id)),
            )?
            .into_iter()
            .next(),
            None => None,
        };
        if let Some(t1w) = &t1w {
            spec.push(format!("--t1w={}", t1w.display()));
            tracing::info!("Found T1w for {}: {}", base_id, file_name_of(t1w));
        }

        let mask = match dwi.parent() {
            Some(dwi_dir) => glob_in(
                dwi_dir,
                &format!("{}_*desc-brain_mask.nii.gz", glob::Pattern::escape(&base_id)),
            )?
            .into_iter()
            .next(),
            None => None,
        };
        match &mask {
            Some(mask) => {
                spec.push(format!("--mask={}", mask.display()));
                tracing::info!("Found mask for {}: {}", base_id, file_name_of(mask));
            }
            None if self.options.require_mask => {
                tracing::warn!(
                    "⚠️  Missing mask for {}; skipping due to --require_mask",
                    base_id
                );
                return Ok(None);
            }
            None => {}
        }

        if self.options.require_t1w && t1w.is_none() {
            tracing::warn!(
                "⚠️  Missing T1w for {}; skipping due to --require_t1w",
                base_id
            );
            return Ok(None);
        }

        if output_src.exists() && self.options.skip_existing {
            tracing::info!("SRC exists, skipping generation: {}", file_name_of(&output_src));
            return Ok(Some(output_src));
        }

        if !self.run_command(&spec).await? {
            return Ok(None);
        }

        if self.options.dry_run {
            self.stats.src_ok += 1;
            return Ok(Some(output_src));
        }

        // DSI Studio 有時輸出 .src.gz.sz
        let produced = if output_src.exists() {
            output_src
        } else {
            let zipped = PathBuf::from(format!("{}.sz", output_src.display()));
            if !zipped.exists() {
                tracing::error!(
                    "❌ SRC file not found at {} or {}",
                    output_src.display(),
                    zipped.display()
                );
                return Ok(None);
            }
            zipped
        };

        self.stats.src_ok += 1;
        Ok(Some(produced))
    }

    fn collect_reconstruction_outputs(&self, src: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        let parent = src.parent().unwrap_or(Path::new("."));
        let escaped = glob::Pattern::escape(prefix);
        let mut outputs: Vec<PathBuf> = Vec::new();

        for pattern in [
            format!("{}.*fib.gz", escaped),
            format!("{}.*fib.gz.sz", escaped),
            format!("{}.*fz", escaped),
            format!("{}.*odf.*", escaped),
        ] {
            for found in glob_in(parent, &pattern)? {
                let candidate = if found.extension().map(|e| e == "sz").unwrap_or(false) {
                    match decompress_sz(&found) {
                        Ok(path) => path,
                        Err(e) => {
                            tracing::error!("❌ Failed to decompress {}: {}", found.display(), e);
                            continue;
                        }
                    }
                } else {
                    found
                };
                if !outputs.contains(&candidate) {
                    outputs.push(candidate);
                }
            }
        }
        Ok(outputs)
    }

    pub async fn reconstruct_fib(&mut self, src: &Path) -> Result<Option<PathBuf>> {
        let src_name = file_name_of(src);
        let prefix = src_name.split(".src").next().unwrap_or_default().to_string();

        // 以 `.` 錨定，避免 sub-01 配到 sub-010
        let existing = glob_in(&self.fib_dir, &format!("{}.*", glob::Pattern::escape(&prefix)))?;
        if self.options.skip_existing {
            if let Some(first) = existing.into_iter().next() {
                tracing::info!("FIB exists, skipping reconstruction: {}", file_name_of(&first));
                self.stats.skipped_existing += 1;
                return Ok(Some(first));
            }
        }

        let spec = CommandSpec::new(&self.options.dsi_studio_cmd)
            .arg("--action=rec")
            .arg(format!("--source={}", src.display()))
            .arg(format!("--method={}", self.options.method))
            .arg(format!("--param0={}", self.options.param0))
            .arg(format!("--thread_count={}", self.options.threads))
            .arg("--other_output=all");

        if !self.run_command(&spec).await? {
            return Ok(None);
        }

        if self.options.dry_run {
            let planned = self.fib_dir.join(format!("{}.fib.gz", prefix));
            tracing::info!("Dry run: would move reconstruction outputs to {}", self.fib_dir.display());
            self.stats.fib_ok += 1;
            return Ok(Some(planned));
        }

        let generated = self.collect_reconstruction_outputs(src, &prefix)?;
        let mut moved = Vec::with_capacity(generated.len());
        for file in generated {
            let dest = self.fib_dir.join(file_name_of(&file));
            fs::rename(&file, &dest)?;
            moved.push(dest);
        }

        if moved.is_empty() {
            tracing::error!("❌ No reconstruction output found for {}", src_name);
            return Ok(None);
        }
        self.stats.fib_ok += moved.len();
        Ok(moved.into_iter().next())
    }

    /// 呼叫外部差異命令產生 `<sub>_<ses_f>_minus_<ses_b>.fib.gz`
    pub async fn generate_longitudinal_diff(
        &self,
        baseline: &Path,
        followup: &Path,
    ) -> Result<Option<PathBuf>> {
        let (_, ses_b) = parse_sub_ses(&file_name_of(baseline));
        let (sub_f, ses_f) = parse_sub_ses(&file_name_of(followup));
        if ses_b.is_empty() || ses_f.is_empty() {
            tracing::warn!(
                "⚠️  Could not determine sessions for {} or {}",
                file_name_of(baseline),
                file_name_of(followup)
            );
            return Ok(None);
        }

        let output_name = format!("{}_{}_minus_{}.fib.gz", sub_f, ses_f, ses_b);
        let output_path = self.diff_dir.join(&output_name);
        if output_path.exists() && self.options.skip_existing {
            tracing::info!("Diff already exists, skipping: {}", output_name);
            return Ok(Some(output_path));
        }

        let Some(diff_cmd) = self.options.diff_cmd.as_deref() else {
            tracing::warn!(
                "⚠️  No differential command configured (--diff_cmd); skipping {}",
                output_name
            );
            return Ok(None);
        };

        let mut words = diff_cmd.split_whitespace();
        let Some(program) = words.next() else {
            return Ok(None);
        };
        let spec = CommandSpec::new(program)
            .args(words)
            .arg("--baseline")
            .arg(baseline.display().to_string())
            .arg("--followup")
            .arg(followup.display().to_string())
            .arg("--output")
            .arg(output_path.display().to_string());

        tracing::info!(
            "Computing longitudinal change: {} - {} for {}",
            ses_f,
            ses_b,
            sub_f
        );
        if self.run_command(&spec).await? {
            Ok(Some(output_path))
        } else {
            Ok(None)
        }
    }

    /// 以同一個 runner 在程序內執行連接矩陣萃取，回傳成功的檔案數
    pub async fn run_connectivity_extraction(&self, fibs: &[PathBuf]) -> Result<usize> {
        if fibs.is_empty() {
            tracing::warn!("⚠️  No FIB files available for connectivity extraction");
            return Ok(0);
        }

        let mut config = match &self.options.connectivity_config {
            Some(path) if !path.exists() => {
                tracing::error!("❌ Connectivity config not found: {}", path.display());
                return Ok(0);
            }
            Some(path) => match ConnectivityConfig::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(
                        "❌ Could not load connectivity config {}: {}",
                        path.display(),
                        e
                    );
                    return Ok(0);
                }
            },
            None => ConnectivityConfig::default(),
        };
        config.apply_overrides(&ExtractOverrides {
            thread_count: self.options.connectivity_threads,
            dsi_studio_cmd: Some(self.options.dsi_studio_cmd.clone()),
            ..Default::default()
        });

        if self.options.dry_run {
            for fib in fibs {
                tracing::info!(
                    "Dry run: would extract connectivity for {} into {}",
                    file_name_of(fib),
                    self.connectivity_output_dir.display()
                );
            }
            return Ok(fibs.len());
        }

        let extractor = ConnectivityExtractor::new(self.runner.clone(), config);
        let mut successful = 0;
        for fib in fibs {
            tracing::info!("Launching connectivity extraction for {}", file_name_of(fib));
            match extractor
                .extract_all_matrices(fib, &self.connectivity_output_dir, None)
                .await
            {
                Ok(_) => successful += 1,
                Err(e) => tracing::error!(
                    "❌ Connectivity extraction failed for {}: {}",
                    file_name_of(fib),
                    e
                ),
            }
        }
        Ok(successful)
    }

    pub async fn create_database(
        &self,
        fibs: &[PathBuf],
        output_db: Option<PathBuf>,
        index_name: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        if fibs.is_empty() {
            tracing::error!("❌ No FIB files found to create database");
            return Ok(None);
        }

        let output_db = output_db.unwrap_or_else(|| self.options.output_dir.join(&self.options.db_name));
        let source_list = fibs
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut spec = CommandSpec::new(&self.options.dsi_studio_cmd)
            .arg("--action=db")
            .arg(format!("--source={}", source_list))
            .arg(format!("--output={}", output_db.display()));
        if let Some(index) = index_name {
            spec.push(format!("--index_name={}", index));
        }

        if self.run_command(&spec).await? {
            tracing::info!("🗄️  Database created at {}", output_db.display());
            Ok(Some(output_db))
        } else {
            Ok(None)
        }
    }

    /// participants.tsv 的 `participant_id` 欄位
    pub fn load_participants(&self) -> Result<Vec<String>> {
        let mut participants_file = self
            .options
            .qsiprep_dir
            .parent()
            .and_then(Path::parent)
            .map(|dir| dir.join("participants.tsv"))
            .unwrap_or_else(|| PathBuf::from("participants.tsv"));

        if !participants_file.exists() && self.rawdata_dir.exists() {
            participants_file = self.rawdata_dir.join("participants.tsv");
        }
        if !participants_file.exists() {
            tracing::warn!("⚠️  participants.tsv not found, skipping completeness check");
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(&participants_file)?;
        let column = reader
            .headers()?
            .iter()
            .position(|h| h == "participant_id")
            .ok_or_else(|| DsiError::input(
                participants_file.display().to_string(),
                "Missing participant_id column",
            ))?;

        let mut subjects = Vec::new();
        for record in reader.records() {
            if let Some(id) = record?.get(column) {
                subjects.push(id.to_string());
            }
        }
        Ok(subjects)
    }

    pub fn render_report(&self, subject_id: &str, sessions: &[SessionRecord]) -> Result<String> {
        let mut context = tera::Context::new();
        context.insert("subject_id", subject_id);
        context.insert(
            "generated",
            &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        context.insert("sessions", sessions);
        context.insert(
            "successful",
            &sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Success)
                .count(),
        );
        context.insert(
            "failed",
            &sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Failed)
                .count(),
        );
        context.insert(
            "method",
            match self.options.method.as_str() {
                "7" => "QSDR",
                _ => "GQI",
            },
        );

        Ok(tera::Tera::one_off(REPORT_TEMPLATE, &context, true)?)
    }

    fn write_reports(&self) -> Result<()> {
        for (subject_id, sessions) in &self.subject_details {
            let html = self.render_report(subject_id, sessions)?;
            let report_file = self.reports_dir.join(format!("{}_report.html", subject_id));
            fs::write(&report_file, html)?;
            tracing::info!("📄 Generated report: {}", report_file.display());
        }
        Ok(())
    }

    pub async fn run(&mut self, now: SystemTime) -> Result<PipelineStats> {
        if self.options.verify_rawdata {
            self.verify_raw_vs_qsiprep()?;
        }

        let dwi_files = self.find_qsiprep_files(now)?;
        let mut fib_files = Vec::new();

        for dwi in &dwi_files {
            let name = file_name_of(dwi);
            tracing::info!("Processing {}", name);

            let mut tokens = name.split('_');
            let sub_id = tokens.next().unwrap_or_default().to_string();
            let ses_id = if name.contains("_ses-") {
                tokens.next().unwrap_or("ses-1").to_string()
            } else {
                "ses-1".to_string()
            };

            let mut record = SessionRecord {
                session_id: ses_id,
                dwi_file: name.clone(),
                src_file: None,
                fib_file: None,
                param0: self.options.param0.clone(),
                timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                status: SessionStatus::Failed,
            };

            match self.generate_src(dwi).await? {
                Some(src) => {
                    record.src_file = Some(file_name_of(&src));
                    if let Some(fib) = self.reconstruct_fib(&src).await? {
                        record.fib_file = Some(file_name_of(&fib));
                        record.status = SessionStatus::Success;
                        fib_files.push(fib);
                    }
                }
                None => self.stats.skipped_missing += 1,
            }

            self.subject_details.entry(sub_id).or_default().push(record);
        }

        self.write_reports()?;
        self.stats.processed = fib_files.len();

        if self.options.run_connectivity {
            tracing::info!("🔗 Starting connectivity extraction step");
            self.run_connectivity_extraction(&fib_files).await?;
        }

        tracing::info!("Checking for longitudinal data...");
        let mut subject_fibs: BTreeMap<String, BTreeMap<String, PathBuf>> = BTreeMap::new();
        for fib in &fib_files {
            let (sub, ses) = parse_sub_ses(&file_name_of(fib));
            if sub.is_empty() {
                continue;
            }
            subject_fibs.entry(sub).or_default().insert(ses, fib.clone());
        }

        let mut diff_groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for (sub, sessions) in &subject_fibs {
            if sessions.len() < 2 {
                continue;
            }
            let mut ordered = sessions.iter();
            let Some((baseline_ses, baseline_fib)) = ordered.next() else {
                continue;
            };
            tracing::info!(
                "Subject {} has {} sessions. Baseline: {}",
                sub,
                sessions.len(),
                baseline_ses
            );

            for (followup_ses, followup_fib) in ordered {
                if let Some(diff) = self
                    .generate_longitudinal_diff(baseline_fib, followup_fib)
                    .await?
                {
                    diff_groups
                        .entry(format!("{}_minus_{}", followup_ses, baseline_ses))
                        .or_default()
                        .push(diff);
                }
            }
        }

        for (group, fibs) in &diff_groups {
            let db_path = self
                .options
                .output_dir
                .join(format!("longitudinal_{}.db.fib.gz", group));
            tracing::info!(
                "Creating longitudinal database for {} ({} subjects)",
                group,
                fibs.len()
            );
            self.create_database(fibs, Some(db_path), Some("qa")).await?;
        }

        if !self.options.pilot {
            let expected = self.load_participants()?;
            if expected.is_empty() {
                if !fib_files.is_empty() {
                    self.create_database(&fib_files, None, None).await?;
                }
            } else {
                let missing: BTreeSet<&String> = expected
                    .iter()
                    .filter(|s| !self.subject_details.contains_key(*s))
                    .collect();
                if !missing.is_empty() {
                    tracing::warn!("⚠️  Not all subjects processed. Missing: {:?}", missing);
                    tracing::warn!("Skipping database creation until all subjects are complete.");
                } else if !fib_files.is_empty() {
                    tracing::info!("✅ All subjects from participants.tsv processed successfully!");
                    self.create_database(&fib_files, None, None).await?;
                }
            }
        }

        let stats = &self.stats;
        tracing::info!(
            "🏁 Pipeline completed. Processed={}, Found={}, SRC ok={}, FIB ok={}, Skipped missing={}, Skipped existing={}",
            stats.processed,
            stats.found,
            stats.src_ok,
            stats.fib_ok,
            stats.skipped_missing,
            stats.skipped_existing
        );

        Ok(self.stats.clone())
    }
}
