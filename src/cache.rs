use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{EngineError, StoreError};
use crate::generator::InsightGenerator;
use crate::models::{IndustryKey, InsightRecord};

/// Fetch-or-generate for a single industry key.
///
/// Reads never check staleness; refreshing is left to the scheduled job.
#[derive(Clone)]
pub struct InsightCache {
    db: Database,
    generator: Arc<InsightGenerator>,
    config: Arc<EngineConfig>,
}

impl InsightCache {
    pub fn new(db: Database, generator: Arc<InsightGenerator>, config: Arc<EngineConfig>) -> Self {
        Self {
            db,
            generator,
            config,
        }
    }

    /// Returns the live record for `industry`, generating and storing it on a
    /// miss. Concurrent misses may each call the generator, but exactly one
    /// create wins; the others return the winner's record.
    ///
    /// The fill runs in its own task, so dropping the returned future does not
    /// stop a generation that is already under way.
    pub async fn get_or_create(&self, industry: &IndustryKey) -> Result<InsightRecord, EngineError> {
        if let Some(record) = self.db.get_insight(industry).await? {
            debug!(%industry, "insight cache hit");
            return Ok(record);
        }

        let this = self.clone();
        let industry = industry.clone();
        tokio::spawn(async move { this.fill(industry).await })
            .await
            .map_err(|e| EngineError::Store(StoreError::Join(e.to_string())))?
    }

    async fn fill(&self, industry: IndustryKey) -> Result<InsightRecord, EngineError> {
        info!(%industry, model = self.generator.model_name(), "insight cache miss, generating");
        let payload = self.generator.generate(&industry).await?;
        let record = InsightRecord::new(industry.clone(), payload, Utc::now(), self.config.refresh_interval);

        match self.db.create_insight(&record).await {
            Ok(()) => {
                info!(%industry, next_update = %record.next_update, "insight created");
                Ok(record)
            }
            Err(StoreError::Conflict(_)) => {
                warn!(%industry, "insight created concurrently, discarding own generation");
                self.db
                    .get_insight(&industry)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("insight {}", industry)).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
