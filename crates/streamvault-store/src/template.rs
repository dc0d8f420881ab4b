//! Template Store
//!
//! Stream templates are stored as a pretty JSON dump plus a hex checksum
//! under `templates/<name>/`, the same shape as stream and consumer
//! metadata. Nothing else lives here; templates carry no message data.

use std::path::{Path, PathBuf};

use streamvault_core::record::RecordHasher;

use crate::config::{StreamTemplate, META_FILE, META_SUM_FILE, TEMPLATES_DIR};
use crate::error::{Error, Result};

pub struct TemplateFileStore {
    dir: PathBuf,
    hh: RecordHasher,
}

impl TemplateFileStore {
    pub fn new(store_dir: &Path) -> TemplateFileStore {
        TemplateFileStore {
            dir: store_dir.join(TEMPLATES_DIR),
            hh: RecordHasher::new(b"templates"),
        }
    }

    /// Persist a template iff it does not exist yet.
    pub async fn store(&self, tmpl: &StreamTemplate) -> Result<()> {
        let dir = self.dir.join(&tmpl.name);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            Error::Config(format!(
                "could not create template directory for {:?} - {}",
                tmpl.name, err
            ))
        })?;

        let meta = dir.join(META_FILE);
        if tokio::fs::metadata(&meta).await.is_ok() {
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(tmpl)
            .map_err(|err| Error::Config(format!("could not encode template: {}", err)))?;
        tokio::fs::write(&meta, &bytes).await?;

        let checksum = self.hh.hex_checksum(&bytes);
        tokio::fs::write(dir.join(META_SUM_FILE), checksum.as_bytes()).await?;
        Ok(())
    }

    /// Remove a template and its files.
    pub async fn delete(&self, name: &str) -> Result<()> {
        tokio::fs::remove_dir_all(self.dir.join(name)).await?;
        Ok(())
    }
}
