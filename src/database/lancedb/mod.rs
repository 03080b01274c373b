// LanceDB vector database module
// One LanceDB directory per named collection under a common root

pub mod vector_store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{CollectionStore, ScoreOrder, VectorIndex, check_collection_name};
use crate::{RecallError, Result};

pub use vector_store::{LanceIndex, TABLE_NAME};

/// Collections stored as `<root>/<name>/`, each a LanceDB database.
#[derive(Debug, Clone)]
pub struct LanceCollections {
    root: PathBuf,
    order: ScoreOrder,
}

impl LanceCollections {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P, order: ScoreOrder) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            order,
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, name: &str) -> Result<PathBuf> {
        check_collection_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl CollectionStore for LanceCollections {
    async fn open(&self, name: &str) -> Result<Arc<dyn VectorIndex>> {
        let path = self.collection_path(name)?;
        if !path.is_dir() {
            return Err(RecallError::IndexUnavailable(format!(
                "collection '{}' does not exist at {}",
                name,
                path.display()
            )));
        }

        let index = LanceIndex::open(name, &path, self.order).await?;
        Ok(Arc::new(index))
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn VectorIndex>> {
        let path = self.collection_path(name)?;
        if path.exists() {
            info!("Discarding existing collection '{}'", name);
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;

        let index = LanceIndex::open(name, &path, self.order).await?;
        Ok(Arc::new(index))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.collection_path(name)?;
        if !path.exists() {
            debug!("Collection '{}' not present, nothing to delete", name);
            return Ok(false);
        }

        tokio::fs::remove_dir_all(&path).await?;
        info!("Deleted collection '{}'", name);
        Ok(true)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.collection_path(name)?.is_dir())
    }

    async fn replace(&self, source: &str, target: &str) -> Result<()> {
        let source_path = self.collection_path(source)?;
        let target_path = self.collection_path(target)?;
        if !source_path.is_dir() {
            return Err(RecallError::IndexUnavailable(format!(
                "collection '{source}' does not exist"
            )));
        }

        // Park the old collection next to the new one so the swap is two renames.
        let retired = self.root.join(format!("{target}.retired"));
        if retired.exists() {
            tokio::fs::remove_dir_all(&retired).await?;
        }
        let had_target = target_path.exists();
        if had_target {
            tokio::fs::rename(&target_path, &retired).await?;
        }

        if let Err(e) = tokio::fs::rename(&source_path, &target_path).await {
            if had_target {
                warn!("Swap failed, restoring previous '{}': {}", target, e);
                tokio::fs::rename(&retired, &target_path).await?;
            }
            return Err(e.into());
        }

        if had_target {
            tokio::fs::remove_dir_all(&retired).await?;
        }

        info!("Collection '{}' replaced by '{}'", target, source);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if super::is_valid_collection_name(&name) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}
