use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crl::types::{FirstUnsaved, PendingMaps};
use crate::store::{
    DeltaCrlUpdate, FullCrlUpdate, IssuingPointRecord, RecordStore, Result, StoreError,
};

/// A file-based implementation of [`RecordStore`].
///
/// Each issuing point is kept in `<dir>/<id>.json`. Writes go to a temporary
/// file that is renamed over the record, so a crash never leaves a torn record.
pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    /// Creates the store, creating `dir` when missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("Using issuing point record directory {:?}", dir);
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::msg(format!("invalid issuing point id '{id}'")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn load(&self, path: &Path) -> Result<Option<IssuingPointRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, path: &Path, record: &IssuingPointRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        debug!("Saved issuing point record {:?}", path);
        Ok(())
    }

    async fn modify(&self, id: &str, f: impl FnOnce(&mut IssuingPointRecord) + Send) -> Result<()> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(&path)
            .await?
            .ok_or_else(|| StoreError::msg(format!("no record for issuing point {id}")))?;
        f(&mut record);
        self.save(&path, &record).await
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn read_record(&self, id: &str) -> Result<Option<IssuingPointRecord>> {
        let path = self.path_for(id)?;
        self.load(&path).await
    }

    async fn write_new_record(&self, record: &IssuingPointRecord) -> Result<()> {
        let path = self.path_for(&record.id)?;
        let _guard = self.write_lock.lock().await;
        self.save(&path, record).await
    }

    async fn update_full_crl(&self, id: &str, update: &FullCrlUpdate) -> Result<()> {
        self.modify(id, |record| record.apply_full(update)).await
    }

    async fn update_delta_crl(&self, id: &str, update: &DeltaCrlUpdate) -> Result<()> {
        self.modify(id, |record| record.apply_delta(update)).await
    }

    async fn update_pending_maps(&self, id: &str, maps: &PendingMaps) -> Result<()> {
        self.modify(id, |record| record.pending = maps.clone()).await
    }

    async fn update_first_unsaved(&self, id: &str, marker: FirstUnsaved) -> Result<()> {
        self.modify(id, |record| record.first_unsaved = Some(marker))
            .await
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted issuing point record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
