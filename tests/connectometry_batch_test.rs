use dsi_toolkit::core::connectometry::{ConnectometryRunner, RunnerOptions};
use dsi_toolkit::core::findings::write_findings_index;
use dsi_toolkit::domain::model::{AnalysisStatus, CommandOutput};
use dsi_toolkit::{ConnectometryConfig, RecordingRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const CONFIG: &str = r#"{
    "dsi_studio_cmd": "/opt/dsi/dsi_studio",
    "core_parameters": {
        "source": {"value": "/data/study.db.fib.gz", "description": "connectometry database"},
        "demo": {"value": "/data/demographics.csv"},
        "variable_list": "1,2",
        "voi": "1"
    },
    "threshold_parameters": {
        "effect_size": 0.3,
        "length_threshold": 20
    },
    "analysis_parameters": {
        "index_name": "qa",
        "permutation": 2000,
        "thread_count": 8,
        "exclude_cb": true
    },
    "batch_configurations": [
        {
            "name": "test_run",
            "description": "quick check",
            "parameters": {"permutation": 100}
        },
        {
            "name": "sweep",
            "description": "effect size x length",
            "parameters": {
                "effect_size": "0.2:0.1:0.3",
                "length_threshold": [20, 30]
            }
        }
    ]
}"#;

fn load_config(dir: &Path) -> (PathBuf, ConnectometryConfig) {
    let path = dir.join("connectometry.json");
    fs::write(&path, CONFIG).unwrap();
    let config = ConnectometryConfig::from_file(&path).unwrap();
    (path, config)
}

fn options(output: &Path, config_path: &Path) -> RunnerOptions {
    RunnerOptions {
        workers: 2,
        stagger: None,
        ..RunnerOptions::new(output, config_path.display().to_string())
    }
}

fn find_summary(output: &Path) -> PathBuf {
    fs::read_dir(output)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().starts_with("analysis_summary_"))
                .unwrap_or(false)
        })
        .unwrap()
}

#[tokio::test]
async fn test_sweep_summary_retry_and_findings() {
    let temp = TempDir::new().unwrap();
    let (config_path, config) = load_config(temp.path());
    let output = temp.path().join("results");

    let runner = RecordingRunner::new().with_handler(|spec| {
        let effect = spec.flag_value("effect_size")?;
        let length = spec.flag_value("length_threshold")?;
        if effect == "0.3" && length == "30" {
            return Some(Ok(CommandOutput::failed(1, "Not enough subjects")));
        }
        if effect == "0.2" && length == "20" {
            let prefix = spec.flag_value("output")?;
            fs::write(format!("{}.inc.tt.gz", prefix), vec![7u8; 2048]).ok()?;
            fs::write(format!("{}.dec.tt.gz", prefix), b"tiny").ok()?;
        }
        Some(Ok(CommandOutput::succeeded("connectometry done")))
    });
    let runner = Arc::new(runner);

    let mut batch = ConnectometryRunner::new(
        runner.clone(),
        config.clone(),
        options(&output, &config_path),
    )
    .unwrap();
    let count = batch.run_all_batches(&["test_run"]).await;
    assert_eq!(count, 4);

    let names: Vec<&str> = batch.results().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["qa_0.2_20_2000", "qa_0.2_30_2000", "qa_0.3_20_2000", "qa_0.3_30_2000"]
    );

    let calls = runner.calls_with_action("cnt");
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|c| c.program == "/opt/dsi/dsi_studio"));
    assert!(calls.iter().all(|c| c.flag_value("source") == Some("/data/study.db.fib.gz")));
    assert!(calls.iter().all(|c| c.flag_value("exclude_cb") == Some("1")));
    assert!(calls.iter().all(|c| c.flag_value("permutation") == Some("2000")));

    let first = &batch.results()[0];
    assert_eq!(first.status, AnalysisStatus::Success);
    assert_eq!(first.findings_increased, Some(true));
    assert_eq!(first.findings_decreased, Some(false));

    let summary = batch.save_summary().await.unwrap();
    assert_eq!(summary.total_analyses, 4);
    assert_eq!(summary.successful, 3);
    assert_eq!(summary.failed, 1);

    // 第二次只重跑失敗的那一個
    let retry_runner = Arc::new(RecordingRunner::new());
    let mut retry = ConnectometryRunner::new(
        retry_runner.clone(),
        config,
        options(&output, &config_path),
    )
    .unwrap();
    let retried = retry.retry_failed(&find_summary(&output)).await.unwrap();
    assert_eq!(retried, 1);
    assert_eq!(retry.results()[0].name, "qa_0.3_30_2000");
    assert_eq!(retry.results()[0].status, AnalysisStatus::Success);
    assert_eq!(retry_runner.calls().len(), 1);

    let (records, _) = write_findings_index(&output).unwrap();
    assert_eq!(records.len(), 2);
    let inc = records.iter().find(|r| r.kind == "inc").unwrap();
    assert_eq!(inc.modality.as_deref(), Some("qa"));
    assert_eq!(inc.effect_size, Some(0.2));
    assert_eq!(inc.length_threshold, Some(20));
}

#[tokio::test]
async fn test_dry_run_plans_every_entry_point() {
    let temp = TempDir::new().unwrap();
    let (config_path, config) = load_config(temp.path());
    let output = temp.path().join("results");
    let runner = Arc::new(RecordingRunner::new());

    let mut batch = ConnectometryRunner::new(
        runner.clone(),
        config,
        RunnerOptions {
            dry_run: true,
            ..options(&output, &config_path)
        },
    )
    .unwrap();

    assert_eq!(batch.run_test_batch().await.unwrap(), 1);
    assert_eq!(batch.run_batch_index(1).await.unwrap(), 4);
    batch
        .run_custom_analysis(
            serde_json::json!({"effect_size": 0.5, "index_name": "fa"})
                .as_object()
                .cloned()
                .unwrap(),
            Some("custom_fa".to_string()),
        )
        .await;

    assert!(runner.calls().is_empty());
    assert_eq!(batch.results().len(), 6);
    assert!(batch
        .results()
        .iter()
        .all(|r| r.status == AnalysisStatus::Planned && r.command.is_some()));
    assert!(!output.join("qa_0.2_20_2000").exists());

    assert!(batch.run_batch_index(9).await.is_err());
}
