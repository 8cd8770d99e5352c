use clap::Parser;
use dsi_toolkit::config::cli::PipelineArgs;
use dsi_toolkit::core::pipeline::{PipelineOptions, PreprocessingPipeline};
use dsi_toolkit::utils::logger;
use dsi_toolkit::TokioCommandRunner;
use std::sync::Arc;
use std::time::SystemTime;

fn options_from(args: &PipelineArgs) -> PipelineOptions {
    PipelineOptions {
        dsi_studio_cmd: args.resolved_dsi_studio_cmd(),
        method: args.method.clone(),
        param0: args.param0.clone(),
        threads: args.threads.clone(),
        db_name: args.db_name.clone(),
        rawdata_dir: args.rawdata_dir.clone(),
        verify_rawdata: args.verify_rawdata,
        require_mask: args.require_mask,
        require_t1w: args.require_t1w,
        skip_existing: args.skip_existing,
        min_file_age: args.min_file_age,
        pilot: args.pilot,
        dry_run: args.dry_run,
        run_connectivity: args.run_connectivity,
        connectivity_config: args.connectivity_config.clone(),
        connectivity_output_dir: args.connectivity_output_dir.clone(),
        connectivity_threads: args.connectivity_threads,
        diff_cmd: args.diff_cmd.clone(),
        ..PipelineOptions::new(&args.qsiprep_dir, &args.output_dir)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PipelineArgs::parse();
    logger::init_session_logger("dsi_pipeline", &args.output_dir.join("logs"), args.verbose)?;

    let runner = Arc::new(TokioCommandRunner::new());
    let mut pipeline = PreprocessingPipeline::new(runner, options_from(&args))?;

    let result = match pipeline.preflight().await {
        Ok(()) => pipeline.run(SystemTime::now()).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(stats) => {
            println!(
                "✅ Pipeline completed: {} FIB file(s) from {} DWI input(s)",
                stats.processed, stats.found
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "❌ Pipeline failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(e.exit_code().max(1));
        }
    }
}
