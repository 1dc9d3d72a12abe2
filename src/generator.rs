//! Turns one provider call into a validated [`InsightPayload`].
//!
//! The provider is told to answer with bare JSON, but its output is treated as
//! untrusted text: fences and surrounding prose are stripped, the JSON is
//! parsed, and every field is checked before anything reaches the store.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::ai::AIProvider;
use crate::error::GenerationError;
use crate::models::{DemandLevel, IndustryKey, InsightPayload, MarketOutlook, SalaryRange};

pub const MIN_TOP_SKILLS: usize = 5;
pub const MIN_KEY_TRENDS: usize = 5;
pub const CURRENCY: &str = "INR";

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*(.*?)\s*```$").expect("fence regex is valid")
});

pub struct InsightGenerator {
    provider: Arc<dyn AIProvider>,
    max_tokens: u32,
}

impl InsightGenerator {
    pub fn new(provider: Arc<dyn AIProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Single provider call, no retry.
    pub async fn generate(&self, industry: &IndustryKey) -> Result<InsightPayload, GenerationError> {
        let prompt = build_prompt(industry);
        debug!(%industry, model = self.provider.model_name(), "requesting insights");

        let raw = self
            .provider
            .complete(&prompt, self.max_tokens)
            .await
            .map_err(|e| GenerationError::Unavailable(format!("{:#}", e)))?;

        parse_payload(&raw).inspect_err(|e| {
            warn!(%industry, kind = e.kind(), error = %e, "rejected generator output");
        })
    }
}

pub fn build_prompt(industry: &IndustryKey) -> String {
    format!(
        r#"Analyze the current state of the {industry} industry and provide insights in ONLY the following JSON format.

All salary figures MUST be in {CURRENCY} as full numerical values (e.g. 600000), without words like 'Lakh' or 'Crore'.

{{
  "salaryRanges": [
    {{ "role": "string", "min": number, "median": number, "max": number, "location": "string" }}
  ],
  "growthRate": number,
  "demandLevel": "HIGH" | "MEDIUM" | "LOW",
  "topSkills": ["skill1", "skill2"],
  "marketOutlook": "POSITIVE" | "NEUTRAL" | "NEGATIVE",
  "keyTrends": ["trend1", "trend2"],
  "recommendedSkills": ["skill1", "skill2"]
}}

IMPORTANT:
- Return ONLY pure JSON output
- No markdown, no comments, no extra notes
- Include at least 5 roles, {MIN_TOP_SKILLS} top skills and {MIN_KEY_TRENDS} key trends"#
    )
}

/// Removes code fences and any prose around the outermost JSON object.
pub fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(inner) = FENCE.captures(text).and_then(|c| c.get(1)) {
        text = inner.as_str();
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

pub fn parse_payload(raw: &str) -> Result<InsightPayload, GenerationError> {
    let body = strip_fences(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GenerationError::Malformed("top-level value is not an object".to_string()))?;

    let salary_ranges = array_field(obj, "salaryRanges")?
        .iter()
        .enumerate()
        .map(|(i, entry)| salary_range(i, entry))
        .collect::<Result<Vec<_>, _>>()?;
    if salary_ranges.is_empty() {
        return Err(violation("salaryRanges must not be empty"));
    }

    let growth_rate = obj
        .get("growthRate")
        .ok_or_else(|| violation("missing field 'growthRate'"))?
        .as_f64()
        .filter(|g| g.is_finite())
        .ok_or_else(|| violation("'growthRate' must be a number"))?;

    let demand = str_field(obj, "demandLevel")?;
    let demand_level = DemandLevel::parse(demand)
        .ok_or_else(|| violation(format!("'demandLevel' has invalid value {:?}", demand)))?;

    let outlook = str_field(obj, "marketOutlook")?;
    let market_outlook = MarketOutlook::parse(outlook)
        .ok_or_else(|| violation(format!("'marketOutlook' has invalid value {:?}", outlook)))?;

    let top_skills = string_set(obj, "topSkills", MIN_TOP_SKILLS)?;
    let key_trends = string_set(obj, "keyTrends", MIN_KEY_TRENDS)?;
    let recommended_skills = string_set(obj, "recommendedSkills", 0)?;

    Ok(InsightPayload {
        salary_ranges,
        growth_rate,
        demand_level,
        top_skills,
        market_outlook,
        key_trends,
        recommended_skills,
    })
}

fn violation(msg: impl Into<String>) -> GenerationError {
    GenerationError::SchemaViolation(msg.into())
}

fn array_field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Vec<Value>, GenerationError> {
    obj.get(name)
        .ok_or_else(|| violation(format!("missing field '{}'", name)))?
        .as_array()
        .ok_or_else(|| violation(format!("'{}' must be an array", name)))
}

fn str_field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a str, GenerationError> {
    obj.get(name)
        .ok_or_else(|| violation(format!("missing field '{}'", name)))?
        .as_str()
        .map(str::trim)
        .ok_or_else(|| violation(format!("'{}' must be a string", name)))
}

/// Trimmed, de-duplicated strings in original order; must hold at least `min`.
fn string_set(
    obj: &Map<String, Value>,
    name: &str,
    min: usize,
) -> Result<Vec<String>, GenerationError> {
    let mut out: Vec<String> = Vec::new();
    for item in array_field(obj, name)? {
        let s = item
            .as_str()
            .ok_or_else(|| violation(format!("'{}' must contain only strings", name)))?
            .trim();
        if !s.is_empty() && !out.iter().any(|existing| existing.eq_ignore_ascii_case(s)) {
            out.push(s.to_string());
        }
    }
    if out.len() < min {
        return Err(violation(format!(
            "'{}' needs at least {} distinct entries, got {}",
            name,
            min,
            out.len()
        )));
    }
    Ok(out)
}

fn salary_range(index: usize, entry: &Value) -> Result<SalaryRange, GenerationError> {
    let obj = entry
        .as_object()
        .ok_or_else(|| violation(format!("salaryRanges[{}] must be an object", index)))?;

    let text = |name: &str| -> Result<String, GenerationError> {
        let s = obj.get(name).and_then(Value::as_str).map(str::trim).ok_or_else(|| {
            violation(format!("salaryRanges[{}].{} must be a string", index, name))
        })?;
        if s.is_empty() {
            return Err(violation(format!("salaryRanges[{}].{} is empty", index, name)));
        }
        Ok(s.to_string())
    };
    let amount = |name: &str| -> Result<i64, GenerationError> {
        let v = obj
            .get(name)
            .ok_or_else(|| violation(format!("salaryRanges[{}] missing '{}'", index, name)))?;
        let n = v
            .as_i64()
            .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
            .ok_or_else(|| {
                violation(format!("salaryRanges[{}].{} must be a whole number", index, name))
            })?;
        if n < 0 {
            return Err(violation(format!("salaryRanges[{}].{} is negative", index, name)));
        }
        Ok(n)
    };

    let range = SalaryRange {
        role: text("role")?,
        min: amount("min")?,
        median: amount("median")?,
        max: amount("max")?,
        location: text("location")?,
    };
    if !(range.min <= range.median && range.median <= range.max) {
        return Err(violation(format!(
            "salaryRanges[{}] must satisfy min <= median <= max",
            index
        )));
    }
    Ok(range)
}
