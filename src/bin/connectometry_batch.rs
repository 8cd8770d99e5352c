use anyhow::Context;
use clap::Parser;
use dsi_toolkit::config::cli::ConnectometryArgs;
use dsi_toolkit::core::connectometry::{ConnectometryRunner, RunnerOptions};
use dsi_toolkit::core::findings::write_findings_index;
use dsi_toolkit::core::probe::find_xvfb;
use dsi_toolkit::utils::logger;
use dsi_toolkit::utils::validation::Validate;
use dsi_toolkit::{ConnectometryConfig, DsiError, TokioCommandRunner};
use serde_json::{Map, Value};
use std::sync::Arc;

fn exit_with(e: &DsiError) -> ! {
    tracing::error!("❌ Connectometry batch failed: {}", e);
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(e.exit_code().max(1));
}

fn parse_custom(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("Invalid JSON passed to --custom")? {
        Value::Object(params) => Ok(params),
        _ => anyhow::bail!("--custom must be a JSON object"),
    }
}

async fn dispatch(
    runner: &mut ConnectometryRunner<TokioCommandRunner>,
    args: &ConnectometryArgs,
) -> anyhow::Result<usize> {
    if let Some(raw) = &args.custom {
        tracing::info!("Running custom analysis");
        runner.run_custom_analysis(parse_custom(raw)?, None).await;
        return Ok(1);
    }

    if let Some(summary) = &args.retry_failed {
        return Ok(runner.retry_failed(summary).await?);
    }

    if args.test {
        tracing::info!("🧪 Running test batch");
        return Ok(runner.run_test_batch().await?);
    }

    if let Some(index) = args.batch {
        return Ok(runner.run_batch_index(index).await?);
    }

    Ok(runner.run_all_batches(&["test_run"]).await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ConnectometryArgs::parse();
    logger::init_session_logger("connectometry_batch", &args.output.join("logs"), args.verbose)?;

    let config = match ConnectometryConfig::from_file(&args.config).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    };

    let mut options = RunnerOptions::new(&args.output, args.config.display().to_string());
    options.workers = args.workers.max(1);
    options.dry_run = args.dry_run;
    if args.no_stagger {
        options.stagger = None;
    }
    options.xvfb = find_xvfb();
    match &options.xvfb {
        Some(xvfb) => tracing::info!("🖥️  No display detected, wrapping DSI Studio with {}", xvfb.display()),
        None => tracing::debug!("Running DSI Studio without xvfb-run"),
    }
    if options.dry_run {
        tracing::info!("DRY RUN: commands are printed, not executed");
    }

    let mut runner = ConnectometryRunner::new(Arc::new(TokioCommandRunner::new()), config, options)
        .context("Failed to prepare output directory")?;

    let count = match dispatch(&mut runner, &args).await {
        Ok(count) => count,
        Err(e) => match e.downcast_ref::<DsiError>() {
            Some(dsi_error) => exit_with(dsi_error),
            None => return Err(e),
        },
    };
    tracing::info!("Ran {} analysis run(s)", count);

    let summary = runner.save_summary().await?;

    if args.index_results && !args.dry_run {
        let (records, path) = write_findings_index(&args.output)?;
        println!("📑 {} finding file(s) indexed in {}", records.len(), path.display());
    }

    if summary.failed + summary.timeout + summary.error > 0 {
        println!(
            "⚠️  {} analysis run(s) did not succeed; rerun with --retry-failed <summary json>",
            summary.failed + summary.timeout + summary.error
        );
        std::process::exit(2);
    }
    Ok(())
}
