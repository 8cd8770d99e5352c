use crate::config::connectivity::ExtractOverrides;
use clap::Parser;
use std::path::PathBuf;

fn split_csv(value: &Option<String>) -> Option<Vec<String>> {
    value.as_ref().map(|raw| {
        raw.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dsi-extract")]
#[command(about = "Extract connectivity matrices from DSI Studio fiber files")]
pub struct ExtractArgs {
    /// .fib.gz/.fz 檔案或目錄（批次模式）
    pub input: Option<PathBuf>,

    pub output: Option<PathBuf>,

    #[arg(long, help = "JSON or TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Process all fiber files in the input directory")]
    pub batch: bool,

    #[arg(long, help = "Test on a random subset of files first")]
    pub pilot: bool,

    #[arg(long, default_value = "1")]
    pub pilot_count: usize,

    #[arg(long, default_value = "*.fib.gz", help = "File pattern (also searches .fz)")]
    pub pattern: String,

    #[arg(long, help = "Only search the top-level input directory")]
    pub no_recursive: bool,

    #[arg(short = 'a', long, help = "Comma-separated atlases")]
    pub atlases: Option<String>,

    #[arg(short = 'v', long, help = "Comma-separated connectivity metrics")]
    pub values: Option<String>,

    #[arg(short = 't', long)]
    pub tracks: Option<i64>,

    #[arg(short = 'j', long)]
    pub threads: Option<i64>,

    #[arg(long, value_parser = clap::value_parser!(i64).range(0..=2),
          help = "0=Streamline(Euler), 1=RK4, 2=Voxel")]
    pub method: Option<i64>,

    #[arg(long = "fa_threshold")]
    pub fa_threshold: Option<f64>,

    #[arg(long = "turning_angle")]
    pub turning_angle: Option<f64>,

    #[arg(long = "step_size")]
    pub step_size: Option<f64>,

    #[arg(long)]
    pub smoothing: Option<f64>,

    #[arg(long = "track_voxel_ratio")]
    pub track_voxel_ratio: Option<f64>,

    #[arg(long = "connectivity_type", value_parser = ["pass", "end"])]
    pub connectivity_type: Option<String>,

    #[arg(long = "connectivity_threshold")]
    pub connectivity_threshold: Option<f64>,

    #[arg(long = "dsi_studio_cmd")]
    pub dsi_studio_cmd: Option<String>,

    #[arg(long, help = "Log CPU and memory usage")]
    pub monitor: bool,

    #[arg(long)]
    pub verbose: bool,

    #[arg(long, default_value = "logs")]
    pub logs_dir: PathBuf,

    #[arg(long, help = "Random seed for pilot selection")]
    pub seed: Option<u64>,
}

impl ExtractArgs {
    pub fn overrides(&self) -> ExtractOverrides {
        ExtractOverrides {
            atlases: split_csv(&self.atlases),
            connectivity_values: split_csv(&self.values),
            track_count: self.tracks,
            thread_count: self.threads,
            dsi_studio_cmd: self.dsi_studio_cmd.clone(),
            method: self.method,
            fa_threshold: self.fa_threshold,
            turning_angle: self.turning_angle,
            step_size: self.step_size,
            smoothing: self.smoothing,
            track_voxel_ratio: self.track_voxel_ratio,
            connectivity_type: self.connectivity_type.clone(),
            connectivity_threshold: self.connectivity_threshold,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dsi-validate")]
#[command(about = "Validate the DSI Studio installation, configuration and input files")]
pub struct ValidateArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, help = "File or directory to check for fiber files")]
    pub test_input: Option<PathBuf>,

    #[arg(long, default_value = "*.fib.gz")]
    pub pattern: String,

    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dsi-connectometry")]
#[command(about = "Run batch connectometry analyses with DSI Studio")]
pub struct ConnectometryArgs {
    #[arg(long)]
    pub config: PathBuf,

    #[arg(long, default_value = "connectometry_results")]
    pub output: PathBuf,

    #[arg(long, help = "Run only the batch with this 0-based index")]
    pub batch: Option<usize>,

    #[arg(long, default_value = "1")]
    pub workers: usize,

    #[arg(long, help = "Custom analysis parameters as JSON")]
    pub custom: Option<String>,

    #[arg(long, help = "Re-run failed analyses from a summary JSON file")]
    pub retry_failed: Option<PathBuf>,

    #[arg(long, help = "Run only the 'test_run' batch")]
    pub test: bool,

    #[arg(long, help = "Show commands without executing them")]
    pub dry_run: bool,

    #[arg(long, help = "Disable the random start delay between parallel workers")]
    pub no_stagger: bool,

    #[arg(long, help = "Write findings_index.json/csv after the run")]
    pub index_results: bool,

    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dsi-pipeline")]
#[command(about = "qsiprep outputs to SRC, FIB and connectometry database")]
pub struct PipelineArgs {
    #[arg(long = "qsiprep_dir")]
    pub qsiprep_dir: PathBuf,

    #[arg(long = "output_dir")]
    pub output_dir: PathBuf,

    #[arg(long = "dsi_studio_cmd", default_value = "dsi_studio")]
    pub dsi_studio_cmd: String,

    #[arg(long = "dsi_studio_path", help = "Folder containing the dsi_studio executable")]
    pub dsi_studio_path: Option<PathBuf>,

    #[arg(long, default_value = "4", help = "Reconstruction method (4=GQI, 7=QSDR)")]
    pub method: String,

    #[arg(long, default_value = "1.25", help = "Diffusion sampling length ratio")]
    pub param0: String,

    #[arg(long, default_value = "8")]
    pub threads: String,

    #[arg(long = "db_name", default_value = "connectometry.db.fib.gz")]
    pub db_name: String,

    #[arg(long = "rawdata_dir")]
    pub rawdata_dir: Option<PathBuf>,

    #[arg(long = "verify_rawdata")]
    pub verify_rawdata: bool,

    #[arg(long = "require_mask")]
    pub require_mask: bool,

    #[arg(long = "require_t1w")]
    pub require_t1w: bool,

    #[arg(long = "skip_existing")]
    pub skip_existing: bool,

    #[arg(long = "min_file_age", default_value = "300")]
    pub min_file_age: u64,

    #[arg(long)]
    pub pilot: bool,

    #[arg(long = "dry_run")]
    pub dry_run: bool,

    #[arg(long = "run_connectivity")]
    pub run_connectivity: bool,

    #[arg(long = "connectivity_config")]
    pub connectivity_config: Option<PathBuf>,

    #[arg(long = "connectivity_output_dir")]
    pub connectivity_output_dir: Option<PathBuf>,

    #[arg(long = "connectivity_threads")]
    pub connectivity_threads: Option<i64>,

    #[arg(long = "diff_cmd", help = "External command that builds a differential FIB")]
    pub diff_cmd: Option<String>,

    #[arg(long)]
    pub verbose: bool,
}

impl PipelineArgs {
    /// `--dsi_studio_path` 優先於 `--dsi_studio_cmd`
    pub fn resolved_dsi_studio_cmd(&self) -> String {
        match &self.dsi_studio_path {
            Some(folder) => folder.join("dsi_studio").to_string_lossy().into_owned(),
            None => self.dsi_studio_cmd.clone(),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "dsi-convert")]
#[command(about = "Convert DSI Studio connectogram and network measure text files to CSV")]
pub struct ConvertArgs {
    /// 單一檔案或包含輸出檔的目錄
    pub input: PathBuf,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[arg(long, help = "Emit JSON log lines")]
    pub log_json: bool,
}
