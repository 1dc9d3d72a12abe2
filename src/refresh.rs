use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{GenerationError, StoreError};
use crate::generator::InsightGenerator;
use crate::models::{IndustryKey, InsightRecord};

/// How often the scheduled loop sweeps by default.
pub const DEFAULT_SCHEDULE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyOutcome {
    Refreshed { attempts: u32 },
    /// Someone else refreshed the key after it was listed.
    AlreadyFresh,
    Failed { error: String, kind: String, attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<(IndustryKey, KeyOutcome)>,
}

impl RefreshReport {
    pub fn refreshed(&self) -> Vec<&IndustryKey> {
        self.keys_where(|o| matches!(o, KeyOutcome::Refreshed { .. }))
    }

    pub fn failed(&self) -> Vec<&IndustryKey> {
        self.keys_where(|o| matches!(o, KeyOutcome::Failed { .. }))
    }

    fn keys_where(&self, pred: impl Fn(&KeyOutcome) -> bool) -> Vec<&IndustryKey> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(k, _)| k)
            .collect()
    }
}

/// Sweeps stale insight records and regenerates each one independently.
#[derive(Clone)]
pub struct RefreshJob {
    db: Database,
    generator: Arc<InsightGenerator>,
    config: Arc<EngineConfig>,
}

impl RefreshJob {
    pub fn new(db: Database, generator: Arc<InsightGenerator>, config: Arc<EngineConfig>) -> Self {
        Self {
            db,
            generator,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<RefreshReport, StoreError> {
        self.run_once_at(Utc::now()).await
    }

    /// One sweep over everything stale at `now`. Only failing to list the
    /// keys fails the run; per-key failures end up in the report.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RefreshReport, StoreError> {
        let started_at = Utc::now();
        let stale = self.db.list_stale(now).await?;
        info!(count = stale.len(), "refresh sweep started");

        let permits = Arc::new(Semaphore::new(self.config.refresh_concurrency));
        let mut tasks = JoinSet::new();
        let mut keys_by_task = HashMap::with_capacity(stale.len());
        for industry in stale.iter().cloned() {
            let job = self.clone();
            let permits = Arc::clone(&permits);
            let key = industry.clone();
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = job.refresh_key(&industry, now).await;
                (industry, outcome)
            });
            keys_by_task.insert(handle.id(), key);
        }

        let mut outcomes = Vec::with_capacity(stale.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => match keys_by_task.remove(&e.id()) {
                    Some(industry) => {
                        error!(%industry, error = %e, "refresh task panicked");
                        outcomes.push((
                            industry,
                            KeyOutcome::Failed {
                                error: e.to_string(),
                                kind: "panic".to_string(),
                                attempts: 0,
                            },
                        ));
                    }
                    None => error!(error = %e, "refresh task for unknown key panicked"),
                },
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let report = RefreshReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            listed = stale.len(),
            refreshed = report.refreshed().len(),
            failed = report.failed().len(),
            "refresh sweep finished"
        );
        Ok(report)
    }

    async fn refresh_key(&self, industry: &IndustryKey, as_of: DateTime<Utc>) -> KeyOutcome {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.generator.generate(industry).await {
                Ok(payload) => {
                    let record = InsightRecord::new(
                        industry.clone(),
                        payload,
                        Utc::now(),
                        self.config.refresh_interval,
                    );
                    return match self.db.replace_insight_if_stale(&record, as_of).await {
                        Ok(true) => {
                            info!(%industry, attempts = attempt, next_update = %record.next_update, "insight refreshed");
                            KeyOutcome::Refreshed { attempts: attempt }
                        }
                        Ok(false) => {
                            info!(%industry, "insight already refreshed elsewhere");
                            KeyOutcome::AlreadyFresh
                        }
                        Err(e) => {
                            warn!(%industry, error = %e, "failed to store refreshed insight");
                            KeyOutcome::Failed {
                                error: e.to_string(),
                                kind: "store".to_string(),
                                attempts: attempt,
                            }
                        }
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(%industry, attempt, ?delay, error = %e, "generator unavailable, retrying");
                    time::sleep(delay).await;
                }
                Err(e) => return failure_outcome(industry, e, attempt),
            }
        }
    }

    /// Runs a sweep every `every` until a shutdown message arrives. The first
    /// sweep starts immediately.
    pub async fn run_scheduled(&self, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(every = ?every, "refresh scheduler started");
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("refresh scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "refresh sweep could not list stale insights");
                    }
                }
            }
        }
    }
}

fn failure_outcome(industry: &IndustryKey, e: GenerationError, attempts: u32) -> KeyOutcome {
    warn!(%industry, attempts, kind = e.kind(), error = %e, "insight refresh failed, will retry next run");
    KeyOutcome::Failed {
        error: e.to_string(),
        kind: e.kind().to_string(),
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generator_for, memory_db, sample_payload, test_config, ScriptedProvider, valid_payload_json};

    fn key(s: &str) -> IndustryKey {
        IndustryKey::parse(s).unwrap()
    }

    async fn seed(db: &Database, industry: &str, age_days: i64) -> InsightRecord {
        let record = InsightRecord::new(
            key(industry),
            sample_payload(0.5),
            Utc::now() - chrono::Duration::days(age_days),
            chrono::Duration::days(7),
        );
        db.create_insight(&record).await.unwrap();
        record
    }

    fn job(db: &Database, provider: &Arc<ScriptedProvider>) -> RefreshJob {
        RefreshJob::new(db.clone(), generator_for(provider), test_config())
    }

    #[tokio::test]
    async fn test_stale_sweep_replaces_only_stale_records() {
        let db = memory_db().await;
        let old_retail = seed(&db, "retail", 8).await;
        let fintech = seed(&db, "fintech", 1).await;
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_ok(valid_payload_json(6.0));

        let report = job(&db, &provider).run_once().await.unwrap();
        assert_eq!(report.refreshed(), vec![&key("retail")]);

        let retail = db.get_insight(&key("retail")).await.unwrap().unwrap();
        assert!(retail.generated_at > old_retail.generated_at);
        assert_eq!(retail.next_update, retail.generated_at + chrono::Duration::days(7));
        assert_eq!(retail.payload.growth_rate, 6.0);
        assert_eq!(db.get_insight(&key("fintech")).await.unwrap(), Some(fintech));
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let db = memory_db().await;
        seed(&db, "retail", 10).await;
        seed(&db, "logistics", 9).await;
        let provider = Arc::new(ScriptedProvider::always_valid());
        let job = job(&db, &provider);

        let first = job.run_once().await.unwrap();
        assert_eq!(first.refreshed().len(), 2);

        let second = job.run_once().await.unwrap();
        assert!(second.outcomes.is_empty());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_batch() {
        let db = memory_db().await;
        seed(&db, "agriculture", 9).await;
        seed(&db, "banking", 9).await;
        let provider = Arc::new(ScriptedProvider::new().with_fallback(|_| Ok(valid_payload_json(2.0))));
        // Not retried: the key is left stale for the next run.
        provider.push_ok("not json at all");
        let config = Arc::new(EngineConfig {
            refresh_concurrency: 1,
            ..(*test_config()).clone()
        });
        let job = RefreshJob::new(db.clone(), generator_for(&provider), config);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failed().len(), 1);
        assert_eq!(report.refreshed().len(), 1);
        assert_eq!(provider.calls(), 2);

        let failed_key = report.failed()[0].clone();
        assert!(db.list_stale(Utc::now()).await.unwrap().contains(&failed_key));
        let (_, outcome) = report.outcomes.iter().find(|(k, _)| *k == failed_key).unwrap();
        assert!(matches!(outcome, KeyOutcome::Failed { kind, attempts: 1, .. } if kind == "malformed"));
    }

    #[tokio::test]
    async fn test_unavailable_is_retried_with_bounded_attempts() {
        let db = memory_db().await;
        seed(&db, "retail", 8).await;
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_err("timeout");
        provider.push_err("timeout");
        provider.push_ok(valid_payload_json(4.0));

        let report = job(&db, &provider).run_once().await.unwrap();
        assert_eq!(report.outcomes[0].1, KeyOutcome::Refreshed { attempts: 3 });
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_gives_up_after_max_attempts() {
        let db = memory_db().await;
        seed(&db, "retail", 8).await;
        let provider = Arc::new(ScriptedProvider::new().with_fallback(|_| Err("503".to_string())));

        let report = job(&db, &provider).run_once().await.unwrap();
        assert!(matches!(
            &report.outcomes[0].1,
            KeyOutcome::Failed { kind, attempts: 3, .. } if kind == "unavailable"
        ));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_key_refreshed_concurrently_is_already_fresh() {
        let db = memory_db().await;
        seed(&db, "retail", 8).await;
        let provider = Arc::new(ScriptedProvider::always_valid());
        let job = job(&db, &provider);

        // As of two days ago the record was still fresh, which is what a
        // concurrent sweep that got there first looks like.
        let earlier = Utc::now() - chrono::Duration::days(2);
        let outcome = job.refresh_key(&key("retail"), earlier).await;
        assert_eq!(outcome, KeyOutcome::AlreadyFresh);
    }

    #[tokio::test]
    async fn test_panicking_key_is_reported_as_failed() {
        let db = memory_db().await;
        seed(&db, "agriculture", 9).await;
        seed(&db, "banking", 9).await;
        let provider = Arc::new(ScriptedProvider::new().with_fallback(|n| {
            if n == 1 {
                panic!("provider blew up");
            }
            Ok(valid_payload_json(2.0))
        }));
        let config = Arc::new(EngineConfig {
            refresh_concurrency: 1,
            ..(*test_config()).clone()
        });
        let job = RefreshJob::new(db.clone(), generator_for(&provider), config);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.refreshed().len(), 1);
        assert_eq!(report.failed().len(), 1);

        let failed_key = report.failed()[0].clone();
        let (_, outcome) = report.outcomes.iter().find(|(k, _)| *k == failed_key).unwrap();
        assert!(matches!(outcome, KeyOutcome::Failed { kind, .. } if kind == "panic"));
        assert!(db.list_stale(Utc::now()).await.unwrap().contains(&failed_key));
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let db = memory_db().await;
        seed(&db, "retail", 8).await;
        let provider = Arc::new(ScriptedProvider::always_valid());
        let job = job(&db, &provider);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { job.run_scheduled(Duration::from_secs(3600), rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(db.list_stale(Utc::now()).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 1);
    }
}
