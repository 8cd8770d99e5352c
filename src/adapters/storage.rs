use crate::domain::ports::Storage;
use crate::utils::error::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    pub async fn write_json<T: Serialize + Sync>(&self, path: &str, value: &T) -> Result<PathBuf> {
        let data = serde_json::to_vec_pretty(value)?;
        self.write_file(path, &data).await?;
        Ok(self.resolve(path))
    }

    pub async fn write_text(&self, path: &str, text: &str) -> Result<PathBuf> {
        self.write_file(path, text.as_bytes()).await?;
        Ok(self.resolve(path))
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(path);
        let data = fs::read(full_path)?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.resolve(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(full_path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_json_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());

        let path = storage
            .write_json("logs/extraction_summary.json", &serde_json::json!({"successful": 2}))
            .await
            .unwrap();

        assert!(path.exists());
        let data = storage.read_file("logs/extraction_summary.json").await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["successful"], 2);
    }
}
