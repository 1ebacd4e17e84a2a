use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ListingSource, SellerScope, SourceBatch, SourceError, admit_records};

/// Reads the scraper's `products.json` export.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn read(&self, scope: &SellerScope) -> Result<SourceBatch, SourceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!(
                    "{} not found",
                    self.path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let records = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(records)) => records,
            Ok(_) => {
                return Err(SourceError::Unavailable(format!(
                    "{} must contain an array of products",
                    self.path.display()
                )));
            }
            Err(err) => {
                return Err(SourceError::Unavailable(format!(
                    "{} is not valid json: {err}",
                    self.path.display()
                )));
            }
        };

        let (listings, skipped) = admit_records(records, scope);
        for skip in &skipped {
            warn!(target = "catalog.source", id = %skip.id, reason = %skip.reason, "record_skipped");
        }
        debug!(
            target = "catalog.source",
            path = %self.path.display(),
            listings = listings.len(),
            skipped = skipped.len(),
            "products_loaded"
        );
        Ok(SourceBatch {
            listings,
            skipped,
            output: None,
        })
    }
}

#[async_trait]
impl ListingSource for JsonFileSource {
    async fn fetch(
        &self,
        scope: &SellerScope,
        cancel: &CancellationToken,
    ) -> Result<SourceBatch, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        self.read(scope).await
    }
}
