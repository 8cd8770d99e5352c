use dsi_toolkit::core::batch::{
    is_batch_input, run_directory_batch, run_extraction_batch, BatchOptions, DiscoveryOptions,
};
use dsi_toolkit::core::discovery::{find_fib_files, select_pilot_files};
use dsi_toolkit::domain::model::CommandOutput;
use dsi_toolkit::{ConnectivityConfig, ConnectivityExtractor, DsiError, RecordingRunner};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn two_atlas_config() -> ConnectivityConfig {
    ConnectivityConfig {
        atlases: vec!["AAL3".to_string(), "Brainnetome".to_string()],
        connectivity_values: vec!["count".to_string(), "fa".to_string()],
        ..Default::default()
    }
}

/// 追蹤成功時照 DSI Studio 的命名寫出矩陣檔；Brainnetome 失敗
fn fake_tracking() -> RecordingRunner {
    RecordingRunner::new().with_handler(|spec| {
        if spec.flag_value("action") != Some("trk") {
            return None;
        }
        let atlas = spec.flag_value("connectivity")?;
        if atlas == "Brainnetome" {
            return Some(Ok(CommandOutput::failed(1, "atlas not found")));
        }
        let output = spec.flag_value("output")?;
        for value in spec.flag_value("connectivity_value")?.split(',') {
            let matrix = format!("{}.{}.{}.pass.connectivity.mat", output, atlas, value);
            fs::write(matrix, b"matrix").ok()?;
        }
        Some(Ok(CommandOutput::succeeded("tracking finished")))
    })
}

fn touch(path: &Path) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"fib").unwrap();
    path.to_path_buf()
}

#[tokio::test]
async fn test_single_file_extraction_layout() {
    let temp = TempDir::new().unwrap();
    let input = touch(&temp.path().join("sub-01.fib.gz"));
    let output = temp.path().join("connectivity");

    let runner = Arc::new(fake_tracking());
    let extractor = ConnectivityExtractor::new(runner.clone(), two_atlas_config());
    let report = extractor
        .extract_all_matrices(&input, &output, None)
        .await
        .unwrap();

    assert_eq!(report.summary.total_atlases, 2);
    assert_eq!(report.summary.successful, 1);
    assert_eq!(report.summary.failed, 1);

    let failed = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.atlas, "Brainnetome");
    assert!(failed.error.as_deref().unwrap().contains("code"));

    let run_dir = PathBuf::from(&report.output_directory);
    assert!(run_dir.starts_with(&output));
    assert!(run_dir
        .join("by_metric/fa/AAL3_sub-01_AAL3.tt.gz.AAL3.fa.pass.connectivity.mat")
        .exists());
    assert!(run_dir
        .join("combined/AAL3_sub-01_AAL3.tt.gz.AAL3.count.pass.connectivity.mat")
        .exists());
    assert!(run_dir.join("logs/extraction_summary.json").exists());

    let csv = fs::read_to_string(run_dir.join("logs/processing_results.csv")).unwrap();
    assert!(csv.lines().any(|l| l.starts_with("AAL3,True")));
    assert!(csv.lines().any(|l| l.starts_with("Brainnetome,False")));

    let readme = fs::read_to_string(run_dir.join("README.md")).unwrap();
    assert!(readme.contains("Brainnetome"));

    let trk = runner.calls_with_action("trk");
    assert_eq!(trk.len(), 2);
    assert!(trk.iter().all(|c| c.flag_value("connectivity_value") == Some("count,fa")));
}

#[tokio::test]
async fn test_organize_failure_stays_on_its_atlas() {
    let temp = TempDir::new().unwrap();
    let input = touch(&temp.path().join("sub-01.fib.gz"));

    // AAL3 追蹤時把 by_metric 移掉，Brainnetome 時再建回來
    let runner = RecordingRunner::new().with_handler(|spec| {
        if spec.flag_value("action") != Some("trk") {
            return None;
        }
        let atlas = spec.flag_value("connectivity")?;
        let output = spec.flag_value("output")?;
        let run_dir = Path::new(output).parent()?.parent()?.parent()?.to_path_buf();
        if atlas == "AAL3" {
            fs::remove_dir_all(run_dir.join("by_metric")).ok()?;
        } else {
            for value in ["count", "fa"] {
                fs::create_dir_all(run_dir.join("by_metric").join(value)).ok()?;
            }
        }
        for value in spec.flag_value("connectivity_value")?.split(',') {
            let matrix = format!("{}.{}.{}.pass.connectivity.mat", output, atlas, value);
            fs::write(matrix, b"matrix").ok()?;
        }
        Some(Ok(CommandOutput::succeeded("tracking finished")))
    });

    let runner = Arc::new(runner);
    let extractor = ConnectivityExtractor::new(runner.clone(), two_atlas_config());
    let report = extractor
        .extract_all_matrices(&input, &temp.path().join("out"), None)
        .await
        .unwrap();

    assert_eq!(runner.calls_with_action("trk").len(), 2);
    let aal3 = report.results.iter().find(|r| r.atlas == "AAL3").unwrap();
    assert!(aal3.success);
    assert!(aal3.error.as_deref().unwrap().contains("organize"));

    let brainnetome = report.results.iter().find(|r| r.atlas == "Brainnetome").unwrap();
    assert!(brainnetome.success);
    assert!(brainnetome.error.is_none());
    let run_dir = PathBuf::from(&report.output_directory);
    assert!(run_dir
        .join("by_metric/fa/Brainnetome_sub-01_Brainnetome.tt.gz.Brainnetome.fa.pass.connectivity.mat")
        .exists());
}

#[tokio::test]
async fn test_pilot_batch_over_discovered_files() {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    touch(&data.join("sub-01.fib.gz"));
    touch(&data.join("nested/sub-02.fz"));
    touch(&data.join("nested/deeper/sub-03.fib.gz"));
    touch(&data.join("notes.txt"));

    let files = find_fib_files(&data, "*.fib.gz", true).unwrap();
    assert_eq!(files.len(), 3);
    let top_level = find_fib_files(&data, "*.fib.gz", false).unwrap();
    assert_eq!(top_level.len(), 1);

    let mut rng = StdRng::seed_from_u64(42);
    let pilot = select_pilot_files(&files, 2, &mut rng);
    assert_eq!(pilot.len(), 2);
    assert_ne!(pilot[0], pilot[1]);

    let extractor = ConnectivityExtractor::new(Arc::new(fake_tracking()), two_atlas_config());
    let output = temp.path().join("out");
    let report = run_extraction_batch(
        &extractor,
        &pilot,
        &output,
        &BatchOptions {
            pilot_mode: true,
            pilot_count: pilot.len(),
            monitor: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(report.summary.successful, 2);
    assert!(report
        .processed_files
        .iter()
        .all(|f| f.matrices_extracted == Some(1)));
    assert!(report.ready_for_full_batch());
    assert!(output.join("batch_processing_summary.json").exists());
}

#[tokio::test]
async fn test_directory_input_runs_as_batch() {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    let single = touch(&data.join("sub-01.fib.gz"));
    touch(&data.join("nested/sub-02.fz"));

    assert!(is_batch_input(false, &data));
    assert!(!is_batch_input(false, &single));
    assert!(is_batch_input(true, &single));

    let extractor = ConnectivityExtractor::new(Arc::new(fake_tracking()), two_atlas_config());
    let output = temp.path().join("out");
    let options = DiscoveryOptions {
        pattern: "*.fib.gz".to_string(),
        recursive: true,
        pilot: false,
        pilot_count: 1,
        seed: None,
        monitor: false,
    };
    let report = run_directory_batch(&extractor, &data, &output, &options)
        .await
        .unwrap();

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.successful, 2);
    assert!(!report.summary.pilot_mode);
    assert!(output.join("batch_processing_summary.json").exists());

    let empty = temp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let err = run_directory_batch(&extractor, &empty, &output, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, DsiError::InputError { .. }));
}

#[tokio::test]
async fn test_missing_dsi_studio_stops_extraction() {
    let temp = TempDir::new().unwrap();
    let input = touch(&temp.path().join("sub-01.fz"));

    let runner = RecordingRunner::new().missing_program("dsi_studio");
    let extractor = ConnectivityExtractor::new(Arc::new(runner), two_atlas_config());
    let err = extractor
        .extract_all_matrices(&input, &temp.path().join("out"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DsiError::ExecutableNotFound { .. }));
    assert_eq!(err.exit_code(), 3);
}
