use clap::Parser;
use dsi_toolkit::config::cli::ConvertArgs;
use dsi_toolkit::core::convert::convert_path;
use dsi_toolkit::utils::logger;

fn main() -> anyhow::Result<()> {
    let args = ConvertArgs::parse();
    if args.log_json {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🔄 Converting DSI Studio outputs in {}", args.input.display());
    let summary = match convert_path(&args.input) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(e.exit_code().max(1));
        }
    };

    for result in &summary.results {
        if args.verbose {
            for output in &result.outputs {
                println!("   → {}", output.display());
            }
        }
        if let Some(error) = &result.error {
            eprintln!("   ❌ {}: {}", result.input.display(), error);
        }
    }

    println!(
        "📊 Converted {} file(s), {} failed",
        summary.converted, summary.failed
    );
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
