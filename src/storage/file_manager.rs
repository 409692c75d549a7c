use log::{debug, info, warn};
use std::path::{Component, Path, PathBuf};
use tokio::fs as async_fs;

use crate::storage::HashUtils;
use crate::utils::{P2PError, Result};

/// A flat directory of files, addressed by bare file name.
#[derive(Debug, Clone)]
pub struct FileManager {
    dir: PathBuf,
}

impl FileManager {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create directory: {}", e)))?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the regular files in the directory, sorted. Subdirectories
    /// and other entries are skipped.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let mut entries = async_fs::read_dir(&self.dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory: {}", e)))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory entry: {}", e)))?
        {
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => {
                    files.push(entry.file_name().to_string_lossy().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping {:?}: {}", entry.path(), e),
            }
        }

        files.sort();
        info!("Found {} file(s) in {:?}", files.len(), self.dir);
        Ok(files)
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        let content = async_fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => P2PError::FileNotFound(name.to_string()),
            _ => P2PError::IoError(format!("Failed to read {:?}: {}", path, e)),
        })?;

        debug!(
            "Read {} ({} bytes, sha256 {})",
            name,
            content.len(),
            HashUtils::hash_data(&content)
        );
        Ok(content)
    }

    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(name)?;
        async_fs::write(&path, content)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to write {:?}: {}", path, e)))?;

        info!("Wrote {} bytes to {:?}", content.len(), path);
        Ok(path)
    }

    /// Map a wire file name onto the directory. Only a single normal path
    /// component is accepted.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == name => Ok(self.dir.join(part)),
            _ => Err(P2PError::InvalidFileName(name.to_string())),
        }
    }
}
