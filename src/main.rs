use anyhow::Context;
use clap::{CommandFactory, Parser};
use dsi_toolkit::config::cli::ExtractArgs;
use dsi_toolkit::core::batch::{is_batch_input, run_directory_batch, DiscoveryOptions};
use dsi_toolkit::utils::{logger, monitor::SystemMonitor, validation::Validate};
use dsi_toolkit::{ConnectivityConfig, ConnectivityExtractor, DsiError, TokioCommandRunner};
use std::path::Path;
use std::sync::Arc;

fn report_failure(e: &DsiError) -> ! {
    tracing::error!(
        "❌ Connectivity extraction failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(e.exit_code().max(1));
}

fn load_config(args: &ExtractArgs) -> anyhow::Result<ConnectivityConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loaded configuration from {}", path.display());
            ConnectivityConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?
        }
        None => ConnectivityConfig::default(),
    };
    config.apply_overrides(&args.overrides());
    config.validate().context("Invalid connectivity settings")?;
    Ok(config)
}

async fn run_single(
    extractor: &ConnectivityExtractor<TokioCommandRunner>,
    input: &Path,
    output: &Path,
) -> Result<(), DsiError> {
    let report = extractor.extract_all_matrices(input, output, None).await?;
    tracing::info!(
        "🎉 Extraction completed: {}/{} atlases successful",
        report.summary.successful,
        report.summary.total_atlases
    );
    println!("📁 Results saved to: {}", report.output_directory);
    Ok(())
}

async fn run_batch(
    extractor: &ConnectivityExtractor<TokioCommandRunner>,
    args: &ExtractArgs,
    input: &Path,
    output: &Path,
) -> Result<(), DsiError> {
    let options = DiscoveryOptions {
        pattern: args.pattern.clone(),
        recursive: !args.no_recursive,
        pilot: args.pilot,
        pilot_count: args.pilot_count,
        seed: args.seed,
        monitor: args.monitor,
    };
    let report = run_directory_batch(extractor, input, output, &options).await?;

    if report.summary.failed > 0 {
        println!(
            "⚠️  {} of {} file(s) failed, see batch_processing_summary.json",
            report.summary.failed, report.summary.total
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ExtractArgs::parse();

    let (Some(input), Some(output)) = (args.input.clone(), args.output.clone()) else {
        ExtractArgs::command().print_help()?;
        println!();
        println!("Example: dsi-extract subject.fib.gz ./connectivity --atlases AAL3,Brainnetome");
        return Ok(());
    };

    logger::init_session_logger("connectivity_extraction", &args.logs_dir, args.verbose)?;
    tracing::info!("Starting dsi-extract");
    if args.verbose {
        tracing::debug!("CLI args: {:?}", args);
    }

    let config = load_config(&args)?;
    let monitor = SystemMonitor::new(args.monitor);
    if monitor.is_enabled() {
        tracing::info!("🔍 System monitoring enabled");
    }

    let extractor = ConnectivityExtractor::new(Arc::new(TokioCommandRunner::new()), config)
        .with_cpu_count(monitor.cpu_count());

    let result = if is_batch_input(args.batch, &input) {
        run_batch(&extractor, &args, &input, &output).await
    } else {
        run_single(&extractor, &input, &output).await
    };

    if let Err(e) = result {
        report_failure(&e);
    }

    tracing::info!("✅ dsi-extract finished");
    Ok(())
}
