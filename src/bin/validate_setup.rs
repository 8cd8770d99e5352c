use clap::Parser;
use dsi_toolkit::config::cli::ValidateArgs;
use dsi_toolkit::core::discovery::validate_input_path;
use dsi_toolkit::core::probe::{check_cuda, check_dsi_studio};
use dsi_toolkit::utils::logger::{self, log_banner};
use dsi_toolkit::utils::monitor::SystemMonitor;
use dsi_toolkit::utils::validation::ValidationReport;
use dsi_toolkit::{ConnectivityConfig, TokioCommandRunner};

fn load_config(args: &ValidateArgs, report: &mut ValidationReport) -> ConnectivityConfig {
    let Some(path) = &args.config else {
        tracing::info!("No configuration file given, using defaults");
        return ConnectivityConfig::default();
    };

    if !path.exists() {
        tracing::warn!("⚠️  Configuration file not found: {}", path.display());
        tracing::warn!("   Using default configuration");
        return ConnectivityConfig::default();
    }

    tracing::info!("📄 Loading configuration from: {}", path.display());
    match ConnectivityConfig::from_file(path) {
        Ok(config) => {
            tracing::info!("✅ Configuration loaded successfully");
            config
        }
        Err(e) => {
            report.error(format!("Error loading configuration: {}", e));
            ConnectivityConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ValidateArgs::parse();
    logger::init_cli_logger(args.verbose);

    let mut report = ValidationReport::new();
    let config = load_config(&args, &mut report);

    log_banner("🔍 DSI STUDIO SETUP VALIDATION");

    let runner = TokioCommandRunner::new();
    let probe = check_dsi_studio(&runner, &config.dsi_studio_cmd).await;
    if probe.available {
        report.note(format!(
            "DSI Studio version: {}",
            probe.version.as_deref().unwrap_or("Unknown")
        ));
    } else {
        report.error(
            probe
                .error
                .clone()
                .unwrap_or_else(|| "DSI Studio is not available".to_string()),
        );
    }

    let gpus = check_cuda(&runner).await;
    if gpus.is_empty() {
        report.note("No CUDA GPU detected; DSI Studio will run on CPU");
    }

    let cpu_count = SystemMonitor::new(false).cpu_count();
    report.merge(config.validate_configuration(cpu_count));

    let mut files_count = 0;
    if let Some(test_input) = &args.test_input {
        tracing::info!("🔍 Testing input path: {}", test_input.display());
        let input = validate_input_path(test_input, &args.pattern, true)?;
        files_count = input.files_found.len();
        if input.report.valid {
            tracing::info!("✅ Input validation passed - Found {} file(s)", files_count);
        } else {
            tracing::error!("❌ Input validation failed");
        }
        report.merge(input.report);
    }

    log_banner("📊 VALIDATION SUMMARY");
    report.log();

    if report.valid {
        println!("✅ VALIDATION PASSED - Ready for processing!");
        println!();
        println!("📋 Configuration Summary:");
        println!("   🧠 DSI Studio: {}", config.dsi_studio_cmd);
        println!("   🏗️  Atlases: {} configured", config.atlases.len());
        println!("   📊 Metrics: {} configured", config.connectivity_values.len());
        println!("   🔄 Tracks: {}", config.track_count);
        println!("   ⚡ Threads: {}", config.thread_count);
        if let Some(test_input) = &args.test_input {
            println!("   🧪 Test input: {} ({} file(s))", test_input.display(), files_count);
        }
        println!();
        println!("🚀 Next Steps:");
        println!("1. 🧪 Try pilot mode first: --pilot --pilot-count 1");
        println!("2. 📊 Run full batch processing");
        let config_arg = args
            .config
            .as_ref()
            .map(|p| format!(" --config {}", p.display()))
            .unwrap_or_default();
        println!("   dsi-extract{} --pilot --batch input_dir/ output/", config_arg);
        println!("   dsi-extract{} --batch input_dir/ output/", config_arg);
        Ok(())
    } else {
        println!("❌ VALIDATION FAILED - Fix errors before processing!");
        for error in &report.errors {
            eprintln!("   ❌ {}", error);
        }
        println!("🔄 Fix the errors above and re-run dsi-validate");
        std::process::exit(1);
    }
}
