use dsi_toolkit::core::pipeline::{PipelineOptions, PreprocessingPipeline};
use dsi_toolkit::domain::model::{CommandOutput, CommandSpec};
use dsi_toolkit::RecordingRunner;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    qsiprep: PathBuf,
    output: PathBuf,
}

fn write_dwi(dir: &Path, base: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{}_desc-preproc_dwi.nii.gz", base)), b"nii").unwrap();
    fs::write(dir.join(format!("{}_desc-preproc_dwi.bval", base)), b"0 1000").unwrap();
    fs::write(dir.join(format!("{}_desc-preproc_dwi.bvec", base)), b"0 1").unwrap();
}

/// sub-01 有兩個 session（有 T1w、沒有 mask），sub-02 沒有 session（有 mask）
fn bids_fixture(participants: Option<&str>) -> Fixture {
    let temp = TempDir::new().unwrap();
    let qsiprep = temp.path().join("derivatives").join("qsiprep");

    write_dwi(&qsiprep.join("sub-01/ses-1/dwi"), "sub-01_ses-1");
    write_dwi(&qsiprep.join("sub-01/ses-2/dwi"), "sub-01_ses-2");
    let anat = qsiprep.join("sub-01/ses-1/anat");
    fs::create_dir_all(&anat).unwrap();
    fs::write(anat.join("sub-01_ses-1_desc-preproc_T1w.nii.gz"), b"t1").unwrap();

    let sub02 = qsiprep.join("sub-02/dwi");
    write_dwi(&sub02, "sub-02");
    fs::write(sub02.join("sub-02_desc-brain_mask.nii.gz"), b"mask").unwrap();

    if let Some(tsv) = participants {
        fs::write(temp.path().join("participants.tsv"), tsv).unwrap();
    }

    let output = temp.path().join("out");
    Fixture {
        _temp: temp,
        qsiprep,
        output,
    }
}

fn arg_after(spec: &CommandSpec, flag: &str) -> Option<String> {
    let position = spec.args.iter().position(|a| a == flag)?;
    spec.args.get(position + 1).cloned()
}

/// 模擬 DSI Studio 與外部差異命令產生的檔案
fn fake_dsi_studio() -> RecordingRunner {
    RecordingRunner::new().with_handler(|spec| {
        match spec.flag_value("action") {
            Some("src") | Some("db") => {
                let output = spec.flag_value("output")?;
                fs::write(output, b"data").ok()?;
            }
            Some("rec") => {
                let source = PathBuf::from(spec.flag_value("source")?);
                let name = source.file_name()?.to_string_lossy().into_owned();
                let prefix = name.split(".src").next()?.to_string();
                let fib = source.with_file_name(format!("{}.gqi.fib.gz", prefix));
                fs::write(fib, b"fib").ok()?;
            }
            _ if spec.program == "make_diff" => {
                fs::write(arg_after(spec, "--output")?, b"diff").ok()?;
            }
            _ => return None,
        }
        Some(Ok(CommandOutput::succeeded("")))
    })
}

fn options(fixture: &Fixture) -> PipelineOptions {
    PipelineOptions {
        min_file_age: 0,
        ..PipelineOptions::new(&fixture.qsiprep, &fixture.output)
    }
}

#[tokio::test]
async fn test_pipeline_builds_src_fib_and_databases() {
    let fixture = bids_fixture(Some("participant_id\tage\nsub-01\t30\nsub-02\t41\n"));
    let runner = Arc::new(fake_dsi_studio());
    let mut opts = options(&fixture);
    opts.diff_cmd = Some("make_diff --verbose".to_string());

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    pipeline.preflight().await.unwrap();
    let stats = pipeline.run(SystemTime::now()).await.unwrap();

    assert_eq!(stats.found, 3);
    assert_eq!(stats.src_ok, 3);
    assert_eq!(stats.fib_ok, 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.skipped_missing, 0);

    let src_calls = runner.calls_with_action("src");
    assert_eq!(src_calls.len(), 3);
    let sub01 = src_calls
        .iter()
        .find(|c| c.flag_value("output").unwrap().ends_with("sub-01_ses-1.src.gz"))
        .unwrap();
    assert!(sub01.has_flag("t1w"));
    assert!(!sub01.has_flag("mask"));
    let sub02 = src_calls
        .iter()
        .find(|c| c.flag_value("output").unwrap().ends_with("sub-02.src.gz"))
        .unwrap();
    assert!(sub02.flag_value("mask").unwrap().ends_with("sub-02_desc-brain_mask.nii.gz"));

    let rec = &runner.calls_with_action("rec")[0];
    assert_eq!(rec.flag_value("method"), Some("4"));
    assert_eq!(rec.flag_value("param0"), Some("1.25"));
    assert_eq!(rec.flag_value("thread_count"), Some("8"));
    assert_eq!(rec.flag_value("other_output"), Some("all"));

    assert!(pipeline.fib_dir().join("sub-01_ses-2.gqi.fib.gz").exists());
    assert!(fixture
        .output
        .join("diff")
        .join("sub-01_ses-2_minus_ses-1.fib.gz")
        .exists());

    let diff_call = runner
        .calls()
        .into_iter()
        .find(|c| c.program == "make_diff")
        .unwrap();
    assert_eq!(diff_call.args[0], "--verbose");
    assert!(arg_after(&diff_call, "--baseline").unwrap().ends_with("sub-01_ses-1.gqi.fib.gz"));

    let db_calls = runner.calls_with_action("db");
    assert_eq!(db_calls.len(), 2);
    assert_eq!(db_calls[0].flag_value("index_name"), Some("qa"));
    assert!(db_calls[0]
        .flag_value("output")
        .unwrap()
        .ends_with("longitudinal_ses-2_minus_ses-1.db.fib.gz"));
    assert_eq!(db_calls[1].flag_value("source").unwrap().split(',').count(), 3);
    assert!(fixture.output.join("connectometry.db.fib.gz").exists());

    let report = fs::read_to_string(fixture.output.join("reports/sub-01_report.html")).unwrap();
    assert!(report.contains("ses-2"));
    assert!(report.contains("SUCCESS"));
}

#[tokio::test]
async fn test_missing_participant_blocks_final_database() {
    let fixture = bids_fixture(Some("participant_id\nsub-01\nsub-02\nsub-03\n"));
    let runner = Arc::new(fake_dsi_studio());

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), options(&fixture)).unwrap();
    pipeline.run(SystemTime::now()).await.unwrap();

    // 沒有設定差異命令，也沒有完整的受試者名單
    assert!(runner.calls_with_action("db").is_empty());
    assert!(!fixture.output.join("connectometry.db.fib.gz").exists());
}

#[tokio::test]
async fn test_require_mask_skips_sessions_without_mask() {
    let fixture = bids_fixture(None);
    let runner = Arc::new(fake_dsi_studio());
    let mut opts = options(&fixture);
    opts.require_mask = true;

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    let stats = pipeline.run(SystemTime::now()).await.unwrap();

    assert_eq!(stats.found, 3);
    assert_eq!(stats.src_ok, 1);
    assert_eq!(stats.skipped_missing, 2);
    assert_eq!(runner.calls_with_action("src").len(), 1);
}

#[tokio::test]
async fn test_recent_files_are_skipped() {
    let fixture = bids_fixture(None);
    let mut opts = options(&fixture);
    opts.min_file_age = 300;

    let mut pipeline = PreprocessingPipeline::new(Arc::new(RecordingRunner::new()), opts).unwrap();
    let files = pipeline.find_qsiprep_files(SystemTime::now()).unwrap();

    assert!(files.is_empty());
    assert_eq!(pipeline.stats().skipped_missing, 3);
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let fixture = bids_fixture(None);
    let runner = Arc::new(RecordingRunner::new());
    let mut opts = options(&fixture);
    opts.dry_run = true;

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    let stats = pipeline.run(SystemTime::now()).await.unwrap();

    assert!(runner.calls().is_empty());
    assert_eq!(stats.src_ok, 3);
    assert_eq!(stats.fib_ok, 3);
    assert!(fs::read_dir(pipeline.fib_dir()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_pilot_processes_single_subject() {
    let fixture = bids_fixture(None);
    let mut opts = options(&fixture);
    opts.pilot = true;

    let mut pipeline = PreprocessingPipeline::new(Arc::new(RecordingRunner::new()), opts).unwrap();
    let files = pipeline.find_qsiprep_files(SystemTime::now()).unwrap();

    let names: Vec<String> = files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let subject = names[0].split('_').next().unwrap().to_string();
    assert!(names.iter().all(|n| n.starts_with(&format!("{}_", subject))));
    assert_eq!(pipeline.stats().found, 3);
}

#[tokio::test]
async fn test_compressed_reconstruction_output_is_unpacked() {
    let fixture = bids_fixture(None);
    let runner = Arc::new(RecordingRunner::new().with_handler(|spec| {
        if spec.flag_value("action") != Some("rec") {
            return None;
        }
        let source = PathBuf::from(spec.flag_value("source")?);
        let archive = source.with_file_name("sub-02.gqi.fib.gz.sz");
        let mut encoder = GzEncoder::new(fs::File::create(archive).ok()?, Compression::default());
        encoder.write_all(b"unpacked fib").ok()?;
        encoder.finish().ok()?;
        Some(Ok(CommandOutput::succeeded("")))
    }));

    let mut pipeline = PreprocessingPipeline::new(runner, options(&fixture)).unwrap();
    let src = fixture.output.join("src").join("sub-02.src.gz");
    fs::write(&src, b"src").unwrap();

    let fib = pipeline.reconstruct_fib(&src).await.unwrap().unwrap();
    assert_eq!(fib, pipeline.fib_dir().join("sub-02.gqi.fib.gz"));
    assert_eq!(fs::read(&fib).unwrap(), b"unpacked fib");
    assert!(!src.with_file_name("sub-02.gqi.fib.gz.sz").exists());
}

#[tokio::test]
async fn test_connectivity_step_runs_tracking_in_process() {
    let fixture = bids_fixture(None);
    let config = fixture.output.parent().unwrap().join("connectivity.json");
    fs::write(
        &config,
        r#"{"atlases": ["AAL3"], "connectivity_values": ["count"], "thread_count": 2}"#,
    )
    .unwrap();

    let runner = Arc::new(fake_dsi_studio());
    let mut opts = options(&fixture);
    opts.run_connectivity = true;
    opts.connectivity_config = Some(config);
    opts.connectivity_threads = Some(4);

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    pipeline.run(SystemTime::now()).await.unwrap();

    let trk = runner.calls_with_action("trk");
    assert_eq!(trk.len(), 3);
    assert!(trk.iter().all(|c| c.flag_value("thread_count") == Some("4")));
    assert!(trk.iter().all(|c| c.flag_value("connectivity") == Some("AAL3")));
    assert!(fixture.output.join("connectivity").exists());
}

#[tokio::test]
async fn test_reconstruction_ignores_neighbouring_session_files() {
    let fixture = bids_fixture(None);
    let runner = Arc::new(fake_dsi_studio());
    let mut opts = options(&fixture);
    opts.skip_existing = true;

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    // ses-10 的輸出不能讓 ses-1 被當成已完成，也不能被一起搬走
    fs::write(pipeline.fib_dir().join("sub-01_ses-10.gqi.fib.gz"), b"other").unwrap();
    let src_dir = fixture.output.join("src");
    fs::write(src_dir.join("sub-01_ses-10.gqi.fib.gz"), b"other").unwrap();
    let src = src_dir.join("sub-01_ses-1.src.gz");
    fs::write(&src, b"src").unwrap();

    let fib = pipeline.reconstruct_fib(&src).await.unwrap().unwrap();
    assert_eq!(fib, pipeline.fib_dir().join("sub-01_ses-1.gqi.fib.gz"));
    assert_eq!(runner.calls_with_action("rec").len(), 1);
    assert_eq!(pipeline.stats().fib_ok, 1);
    assert!(src_dir.join("sub-01_ses-10.gqi.fib.gz").exists());
}

#[tokio::test]
async fn test_broken_connectivity_config_does_not_stop_pipeline() {
    let fixture = bids_fixture(Some("participant_id\nsub-01\nsub-02\n"));
    let config = fixture.output.parent().unwrap().join("connectivity.json");
    fs::write(&config, "{ not json").unwrap();

    let runner = Arc::new(fake_dsi_studio());
    let mut opts = options(&fixture);
    opts.run_connectivity = true;
    opts.connectivity_config = Some(config);

    let mut pipeline = PreprocessingPipeline::new(runner.clone(), opts).unwrap();
    let stats = pipeline.run(SystemTime::now()).await.unwrap();

    assert_eq!(stats.fib_ok, 3);
    assert!(runner.calls_with_action("trk").is_empty());
    // 後面的資料庫步驟照常執行
    assert!(fixture.output.join("connectometry.db.fib.gz").exists());
}
