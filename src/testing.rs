//! Fakes and fixtures shared by the unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::AIProvider;
use crate::config::{EngineConfig, RetryPolicy};
use crate::db::Database;
use crate::generator::{parse_payload, InsightGenerator};
use crate::models::InsightPayload;

type Fallback = Box<dyn Fn(usize) -> Result<String, String> + Send + Sync>;

/// Provider that replays queued responses, then falls back to a closure of
/// the call number.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<Fallback>,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answers every unscripted call with a valid payload whose growth rate
    /// is the call number.
    pub fn always_valid() -> Self {
        Self::new().with_fallback(|n| Ok(valid_payload_json(n as f64)))
    }

    pub fn with_fallback(
        mut self,
        f: impl Fn(usize) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(f));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.script.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn push_err(&self, msg: impl Into<String>) {
        self.script.lock().unwrap().push_back(Err(msg.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AIProvider for ScriptedProvider {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let result = match (next, &self.fallback) {
            (Some(r), _) => r,
            (None, Some(f)) => f(n),
            (None, None) => Err("script exhausted".to_string()),
        };
        result.map_err(|e| anyhow!(e))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

pub fn valid_payload_json(growth_rate: f64) -> String {
    json!({
        "salaryRanges": [
            { "role": "Software Engineer", "min": 600000, "median": 900000, "max": 1200000, "location": "Bengaluru" },
            { "role": "Data Analyst", "min": 400000, "median": 650000, "max": 900000, "location": "Pune" },
            { "role": "Product Manager", "min": 1200000, "median": 1800000, "max": 2800000, "location": "Mumbai" },
            { "role": "DevOps Engineer", "min": 700000, "median": 1000000, "max": 1500000, "location": "Hyderabad" },
            { "role": "QA Engineer", "min": 350000, "median": 550000, "max": 800000, "location": "Chennai" }
        ],
        "growthRate": growth_rate,
        "demandLevel": "HIGH",
        "topSkills": ["Rust", "SQL", "Cloud", "Kubernetes", "Python"],
        "marketOutlook": "POSITIVE",
        "keyTrends": ["AI adoption", "Remote work", "Upskilling", "Automation", "Open banking"],
        "recommendedSkills": ["Machine Learning", "Security"]
    })
    .to_string()
}

pub fn sample_payload(growth_rate: f64) -> InsightPayload {
    parse_payload(&valid_payload_json(growth_rate)).unwrap()
}

/// Config with retries that don't slow tests down.
pub fn test_config() -> Arc<EngineConfig> {
    Arc::new(EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    })
}

pub async fn memory_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.init().await.unwrap();
    db
}

pub fn generator_for(provider: &Arc<ScriptedProvider>) -> Arc<InsightGenerator> {
    Arc::new(InsightGenerator::new(provider.clone(), 1024))
}
