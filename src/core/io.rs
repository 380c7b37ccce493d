use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Writes the whole file or nothing: a failed write leaves no file behind.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    /// Size in bytes, or `None` when nothing is at `path`.
    async fn size(&self, path: &str) -> Result<Option<u64>>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let staging = format!("{}.part", path);
        if let Err(e) = tokio::fs::write(&staging, content).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_reports_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/out.png");
        let path_str = path.to_str().unwrap();
        let storage = NativeStorage::new();

        assert_eq!(storage.size(path_str).await?, None);

        storage.write(path_str, &[7u8; 42]).await?;
        assert_eq!(storage.size(path_str).await?, Some(42));
        assert_eq!(std::fs::read(&path)?, vec![7u8; 42]);
        assert!(!dir.path().join("nested/out.png.part").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_removes_staging_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // A non-empty directory at the target path makes the final rename fail.
        let path = dir.path().join("taken.png");
        std::fs::create_dir(&path)?;
        std::fs::write(path.join("inside"), b"x")?;
        let storage = NativeStorage::new();

        assert!(storage.write(path.to_str().unwrap(), &[1u8; 16]).await.is_err());
        assert!(!dir.path().join("taken.png.part").exists());
        assert!(path.join("inside").is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_has_no_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        assert_eq!(storage.size(dir.path().to_str().unwrap()).await?, None);
        Ok(())
    }
}
