use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FINDING_PATTERNS: &[(&str, &str, &str)] = &[
    ("*.inc.jpg", "inc", "image"),
    ("*.dec.jpg", "dec", "image"),
    ("*.inc.tt.gz", "inc", "tracks"),
    ("*.dec.tt.gz", "dec", "tracks"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub modality: String,
    pub effect_size: f64,
    pub length_threshold: i64,
    pub permutation: i64,
}

/// `<modality>_<effect>_<length>_<permutation>`，modality 本身可以含底線
pub fn parse_analysis_dir_name(name: &str) -> Option<AnalysisParams> {
    let mut tokens = name.rsplitn(4, '_');
    let permutation = tokens.next()?.parse().ok()?;
    let length_threshold = tokens.next()?.parse().ok()?;
    let effect_size = tokens.next()?.parse().ok()?;
    let modality = tokens.next()?;
    if modality.is_empty() {
        return None;
    }

    Some(AnalysisParams {
        modality: modality.to_string(),
        effect_size,
        length_threshold,
        permutation,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRecord {
    pub path: String,
    pub filename: String,
    pub kind: String,
    pub file_type: String,
    pub modality: Option<String>,
    pub effect_size: Option<f64>,
    pub length_threshold: Option<i64>,
    pub permutation: Option<i64>,
}

fn params_from_ancestors(path: &Path, root: &Path) -> Option<AnalysisParams> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root))
        .filter_map(|dir| dir.file_name())
        .find_map(|name| parse_analysis_dir_name(&name.to_string_lossy()))
}

/// 搜尋 connectometry 結果中的增加/減少發現
pub fn index_findings(root: &Path) -> Result<Vec<FindingRecord>> {
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    let mut records = Vec::new();

    for (pattern, kind, file_type) in FINDING_PATTERNS {
        let search = format!("{}/**/{}", escaped_root, pattern);
        for path in glob::glob(&search)?.filter_map(|entry| entry.ok()) {
            let params = params_from_ancestors(&path, root);
            records.push(FindingRecord {
                path: path.display().to_string(),
                filename: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                kind: kind.to_string(),
                file_type: file_type.to_string(),
                modality: params.as_ref().map(|p| p.modality.clone()),
                effect_size: params.as_ref().map(|p| p.effect_size),
                length_threshold: params.as_ref().map(|p| p.length_threshold),
                permutation: params.as_ref().map(|p| p.permutation),
            });
        }
    }

    records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(records)
}

/// 寫出 `findings_index.json` 與 `findings_index.csv`
pub fn write_findings_index(root: &Path) -> Result<(Vec<FindingRecord>, PathBuf)> {
    let records = index_findings(root)?;

    let json_path = root.join("findings_index.json");
    std::fs::write(&json_path, serde_json::to_vec_pretty(&records)?)?;

    let mut writer = csv::Writer::from_path(root.join("findings_index.csv"))?;
    for record in &records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    tracing::info!(
        "📑 Indexed {} finding file(s) into {}",
        records.len(),
        json_path.display()
    );
    Ok((records, json_path))
}
