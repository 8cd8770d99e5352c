use crate::utils::error::{DsiError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

const CONNECTOGRAM_SUFFIX: &str = ".connectogram.txt";
const MEASURES_SUFFIX: &str = "network_measures.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    pub labels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl LabeledMatrix {
    pub fn size(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkMeasures {
    pub global: Vec<(String, f64)>,
    pub regions: Vec<String>,
    pub nodal: Vec<(String, Vec<f64>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub input: PathBuf,
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionSummary {
    pub results: Vec<ConversionResult>,
    pub converted: usize,
    pub failed: usize,
}

fn parse_number(cell: &str, row: usize) -> Result<f64> {
    cell.trim().parse::<f64>().map_err(|_| {
        DsiError::processing(format!("Non-numeric value '{}' on line {}", cell.trim(), row + 1))
    })
}

fn region_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("region_{:03}", i)).collect()
}

/// 前兩列是表頭（第二列從第三欄起是腦區名稱），資料列前兩欄是標籤
pub fn parse_connectogram(text: &str) -> Result<LabeledMatrix> {
    let rows: Vec<Vec<&str>> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').collect())
        .collect();

    if rows.len() < 2 {
        return Err(DsiError::processing("Connectogram is missing its header rows"));
    }

    let labels: Vec<String> = rows[1]
        .iter()
        .skip(2)
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect();

    let mut values = Vec::with_capacity(labels.len());
    for (index, row) in rows.iter().enumerate().skip(2) {
        let parsed = row
            .iter()
            .skip(2)
            .filter(|cell| !cell.trim().is_empty())
            .map(|cell| parse_number(cell, index))
            .collect::<Result<Vec<f64>>>()?;
        if parsed.len() != labels.len() {
            return Err(DsiError::processing(format!(
                "Row {} has {} values, expected {}",
                index + 1,
                parsed.len(),
                labels.len()
            )));
        }
        values.push(parsed);
    }

    if values.len() != labels.len() {
        return Err(DsiError::processing(format!(
            "Connectogram is not square: {} rows for {} regions",
            values.len(),
            labels.len()
        )));
    }

    Ok(LabeledMatrix { labels, values })
}

/// 一個數值的列是全域指標，多個數值的列是各腦區指標
pub fn parse_network_measures(text: &str) -> Result<NetworkMeasures> {
    let mut measures = NetworkMeasures::default();

    for (index, line) in text.lines().enumerate() {
        let cells: Vec<&str> = line
            .split('\t')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        let Some((name, rest)) = cells.split_first() else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }

        let is_header = *name == "network_measures"
            || rest.iter().any(|cell| cell.parse::<f64>().is_err());
        if is_header {
            measures.regions = rest.iter().map(|c| c.to_string()).collect();
            continue;
        }

        let numbers = rest
            .iter()
            .map(|cell| parse_number(cell, index))
            .collect::<Result<Vec<f64>>>()?;
        if numbers.len() == 1 {
            measures.global.push((name.to_string(), numbers[0]));
        } else {
            measures.nodal.push((name.to_string(), numbers));
        }
    }

    if measures.regions.is_empty() {
        let width = measures.nodal.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        measures.regions = region_names(width);
    }
    Ok(measures)
}

pub fn write_labeled_csv(matrix: &LabeledMatrix, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once("region").chain(matrix.labels.iter().map(String::as_str)))?;
    for (label, row) in matrix.labels.iter().zip(&matrix.values) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// 只有數字、固定六位小數
pub fn write_simple_csv(matrix: &LabeledMatrix, path: &Path) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    for row in &matrix.values {
        writer.write_record(row.iter().map(|v| format!("{:.6}", v)))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_global_measures_csv(measures: &NetworkMeasures, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["measure", "value"])?;
    for (name, value) in &measures.global {
        writer.write_record([name.clone(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_nodal_measures_csv(measures: &NetworkMeasures, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once("measure").chain(measures.regions.iter().map(String::as_str)))?;
    for (name, values) in &measures.nodal {
        let mut record = vec![name.clone()];
        record.extend(values.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn sibling(path: &Path, stem_suffix: &str, new_suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(stem_suffix).unwrap_or(&name);
    path.with_file_name(format!("{}{}", stem, new_suffix))
}

pub fn convert_connectogram_file(path: &Path) -> Result<Vec<PathBuf>> {
    let matrix = parse_connectogram(&std::fs::read_to_string(path)?)?;
    let labeled = sibling(path, ".txt", ".csv");
    let simple = sibling(path, ".txt", ".simple.csv");
    write_labeled_csv(&matrix, &labeled)?;
    write_simple_csv(&matrix, &simple)?;
    tracing::debug!("{} regions written to {}", matrix.size(), labeled.display());
    Ok(vec![labeled, simple])
}

pub fn convert_network_measures_file(path: &Path) -> Result<Vec<PathBuf>> {
    let measures = parse_network_measures(&std::fs::read_to_string(path)?)?;
    let mut outputs = Vec::new();
    if !measures.global.is_empty() {
        let global = sibling(path, ".txt", ".global.csv");
        write_global_measures_csv(&measures, &global)?;
        outputs.push(global);
    }
    if !measures.nodal.is_empty() {
        let nodal = sibling(path, ".txt", ".nodal.csv");
        write_nodal_measures_csv(&measures, &nodal)?;
        outputs.push(nodal);
    }
    if outputs.is_empty() {
        return Err(DsiError::processing("No measures found"));
    }
    Ok(outputs)
}

fn is_convertible(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let name = n.to_string_lossy();
            name.ends_with(CONNECTOGRAM_SUFFIX) || name.ends_with(MEASURES_SUFFIX)
        })
        .unwrap_or(false)
}

pub fn convert_file(path: &Path) -> Result<Vec<PathBuf>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.ends_with(CONNECTOGRAM_SUFFIX) {
        convert_connectogram_file(path)
    } else if name.ends_with(MEASURES_SUFFIX) {
        convert_network_measures_file(path)
    } else {
        Err(DsiError::input(path.display().to_string(), "Unsupported file type"))
    }
}

/// 單一檔案或遞迴整個目錄；某個檔案失敗時繼續
pub fn convert_path(path: &Path) -> Result<ConversionSummary> {
    if !path.exists() {
        return Err(DsiError::input(path.display().to_string(), "Path does not exist"));
    }

    let files: Vec<PathBuf> = if path.is_dir() {
        let escaped = glob::Pattern::escape(&path.to_string_lossy());
        let mut found: Vec<PathBuf> = glob::glob(&format!("{}/**/*.txt", escaped))?
            .filter_map(|entry| entry.ok())
            .filter(|p| is_convertible(p))
            .collect();
        found.sort();
        found
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        tracing::warn!("⚠️  No connectogram or network measure files found in {}", path.display());
    }

    let mut summary = ConversionSummary::default();
    for file in files {
        match convert_file(&file) {
            Ok(outputs) => {
                tracing::info!("✅ Converted {}", file.display());
                summary.converted += 1;
                summary.results.push(ConversionResult {
                    input: file,
                    outputs,
                    error: None,
                });
            }
            Err(e) => {
                tracing::error!("❌ Failed to convert {}: {}", file.display(), e);
                summary.failed += 1;
                summary.results.push(ConversionResult {
                    input: file,
                    outputs: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    tracing::info!(
        "📊 Conversion finished: {} converted, {} failed",
        summary.converted,
        summary.failed
    );
    Ok(summary)
}
