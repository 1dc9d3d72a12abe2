//! Profile updates that may need a first-time insight for the chosen industry.
//!
//! Two phases: `prepare` reads and, on a miss, calls the generator with no
//! transaction open; `Database::commit_profile_update` then creates the
//! candidate (or falls back to the row a concurrent caller created) and writes
//! the profile in a single transaction.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::cache::InsightCache;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{EngineError, StoreError};
use crate::generator::InsightGenerator;
use crate::models::{
    CallerIdentity, IndustryKey, InsightRecord, OnboardingStatus, PreparedInsight, ProfileUpdate,
    UserProfile,
};

#[derive(Debug, Clone)]
pub struct UpdatedProfile {
    pub profile: UserProfile,
    pub insight: InsightRecord,
}

#[derive(Clone)]
pub struct ProfileService {
    db: Database,
    generator: Arc<InsightGenerator>,
    config: Arc<EngineConfig>,
}

impl ProfileService {
    pub fn new(db: Database, generator: Arc<InsightGenerator>, config: Arc<EngineConfig>) -> Self {
        Self {
            db,
            generator,
            config,
        }
    }

    /// Sets the caller's industry and profile fields, creating the industry's
    /// insight if it does not exist yet. On any error after the profile row is
    /// resolved, neither the profile nor the insight table is changed.
    pub async fn update_profile(
        &self,
        caller: Option<&CallerIdentity>,
        update: ProfileUpdate,
    ) -> Result<UpdatedProfile, EngineError> {
        let caller = CallerIdentity::require(caller)?.clone();

        // Detached so an abandoned caller doesn't cut the generation or commit short.
        let this = self.clone();
        tokio::spawn(async move { this.run_update(caller, update).await })
            .await
            .map_err(|e| EngineError::Store(StoreError::Join(e.to_string())))?
    }

    async fn run_update(
        &self,
        caller: CallerIdentity,
        update: ProfileUpdate,
    ) -> Result<UpdatedProfile, EngineError> {
        let user = self.db.get_or_create_user(&caller).await?;
        let prepared = self.prepare(&update.industry).await?;
        let industry = prepared.industry().clone();

        let committed = self.db.commit_profile_update(user.id, update, prepared).await?;
        info!(
            user = %caller.user_id,
            %industry,
            created_insight = committed.created_insight,
            "profile updated"
        );

        Ok(UpdatedProfile {
            profile: committed.profile,
            insight: committed.insight,
        })
    }

    async fn prepare(&self, industry: &IndustryKey) -> Result<PreparedInsight, EngineError> {
        if let Some(existing) = self.db.get_insight(industry).await? {
            return Ok(PreparedInsight::Existing(existing));
        }
        info!(%industry, "no insight for industry yet, generating before commit");
        let payload = self.generator.generate(industry).await?;
        Ok(PreparedInsight::Candidate(InsightRecord::new(
            industry.clone(),
            payload,
            Utc::now(),
            self.config.refresh_interval,
        )))
    }
}

/// Resolves (or creates) the caller's profile and reports whether an
/// industry has been chosen.
pub async fn onboarding_status(
    db: &Database,
    caller: Option<&CallerIdentity>,
) -> Result<OnboardingStatus, EngineError> {
    let caller = CallerIdentity::require(caller)?;
    let user = db.get_or_create_user(caller).await?;
    Ok(OnboardingStatus {
        is_onboarded: user.industry.is_some(),
    })
}

/// The insight for the caller's own industry, generated on first use.
pub async fn insights_for_user(
    db: &Database,
    cache: &InsightCache,
    caller: Option<&CallerIdentity>,
) -> Result<InsightRecord, EngineError> {
    let caller = CallerIdentity::require(caller)?;
    let user = db
        .get_user(&caller.user_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", caller.user_id)))?;
    let industry = user.industry.ok_or(EngineError::NotOnboarded)?;
    cache.get_or_create(&industry).await
}
