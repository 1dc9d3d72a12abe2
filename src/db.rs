use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StoreError;
use crate::models::{
    CallerIdentity, DemandLevel, IndustryKey, InsightPayload, InsightRecord, MarketOutlook,
    PreparedInsight, ProfileUpdate, UserProfile,
};

const INSIGHT_COLUMNS: &str = "industry, salary_ranges, growth_rate, demand_level, top_skills, \
     market_outlook, key_trends, recommended_skills, generated_at, next_update";

const USER_COLUMNS: &str =
    "id, external_id, email, name, industry, experience, bio, skills, created_at, updated_at";

/// Outcome of the commit phase of a profile update.
#[derive(Debug, Clone)]
pub struct CommittedProfile {
    pub profile: UserProfile,
    pub insight: InsightRecord,
    /// False when the candidate lost a race and the existing record was used.
    pub created_insight: bool,
}

/// SQLite-backed insight store and profile table.
///
/// One connection behind a mutex; every call runs on the blocking pool.
/// The mutex is never held across a generator call.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::default_path())
    }

    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn configure(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "insights") {
            proj_dirs.data_dir().join("insights.db")
        } else {
            PathBuf::from("insights.db")
        }
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // A poisoned lock still guards a usable connection.
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS insights (
                    industry TEXT PRIMARY KEY NOT NULL,
                    salary_ranges TEXT NOT NULL,
                    growth_rate REAL NOT NULL,
                    demand_level TEXT NOT NULL CHECK (demand_level IN ('HIGH', 'MEDIUM', 'LOW')),
                    top_skills TEXT NOT NULL,
                    market_outlook TEXT NOT NULL CHECK (market_outlook IN ('POSITIVE', 'NEUTRAL', 'NEGATIVE')),
                    key_trends TEXT NOT NULL,
                    recommended_skills TEXT NOT NULL,
                    generated_at INTEGER NOT NULL,
                    next_update INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    external_id TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL DEFAULT '',
                    name TEXT NOT NULL DEFAULT '',
                    industry TEXT REFERENCES insights(industry),
                    experience INTEGER,
                    bio TEXT,
                    skills TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_insights_next_update ON insights(next_update);
                CREATE INDEX IF NOT EXISTS idx_users_industry ON users(industry);
                "#,
            )?;
            Ok(())
        })
        .await
    }

    pub async fn ensure_initialized(&self) -> Result<(), StoreError> {
        let tables: i64 = self
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('insights', 'users')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await?;
        if tables < 2 {
            return Err(StoreError::NotInitialized);
        }
        Ok(())
    }

    // --- Insight operations ---

    pub async fn get_insight(&self, industry: &IndustryKey) -> Result<Option<InsightRecord>, StoreError> {
        let industry = industry.clone();
        self.with_conn(move |conn| select_insight(conn, &industry)).await
    }

    /// Creates the record, failing with `Conflict` if the key already exists.
    pub async fn create_insight(&self, record: &InsightRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| insert_insight(conn, &record)).await
    }

    /// Replaces the whole record, but only if it is still stale at `as_of`.
    /// Returns false when the key is missing or was already refreshed.
    pub async fn replace_insight_if_stale(
        &self,
        record: &InsightRecord,
        as_of: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let p = &record.payload;
            let changed = conn.execute(
                "UPDATE insights
                 SET salary_ranges = ?2, growth_rate = ?3, demand_level = ?4, top_skills = ?5,
                     market_outlook = ?6, key_trends = ?7, recommended_skills = ?8,
                     generated_at = ?9, next_update = ?10
                 WHERE industry = ?1 AND next_update <= ?11",
                params![
                    record.industry.as_str(),
                    to_json(&p.salary_ranges)?,
                    p.growth_rate,
                    p.demand_level.as_str(),
                    to_json(&p.top_skills)?,
                    p.market_outlook.as_str(),
                    to_json(&p.key_trends)?,
                    to_json(&p.recommended_skills)?,
                    record.generated_at.timestamp_millis(),
                    record.next_update.timestamp_millis(),
                    as_of.timestamp_millis(),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Keys whose next refresh is at or before `now`, oldest first.
    pub async fn list_stale(&self, now: DateTime<Utc>) -> Result<Vec<IndustryKey>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT industry FROM insights WHERE next_update <= ?1 ORDER BY next_update, industry",
            )?;
            let rows = stmt.query_map([now.timestamp_millis()], |row| {
                let raw: String = row.get(0)?;
                IndustryKey::parse(&raw).map_err(|e| conversion_err(0, e))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn list_insights(&self) -> Result<Vec<InsightRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM insights ORDER BY industry", INSIGHT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_insight)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // --- User operations ---

    /// Idempotent: the claims are only used when the row is first created.
    pub async fn get_or_create_user(&self, caller: &CallerIdentity) -> Result<UserProfile, StoreError> {
        let caller = caller.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (external_id, email, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    caller.user_id,
                    caller.email.as_deref().unwrap_or(""),
                    caller.name.as_deref().unwrap_or(""),
                ],
            )?;
            select_user_by_external_id(conn, &caller.user_id)?
                .ok_or_else(|| StoreError::NotFound(format!("user {}", caller.user_id)))
        })
        .await
    }

    pub async fn get_user(&self, external_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let external_id = external_id.to_string();
        self.with_conn(move |conn| select_user_by_external_id(conn, &external_id))
            .await
    }

    /// Commit phase of a profile update: in one transaction, create the
    /// candidate insight (falling back to the existing row if another caller
    /// won the race) and write the profile. Nothing is written on error.
    pub async fn commit_profile_update(
        &self,
        user_id: i64,
        update: ProfileUpdate,
        prepared: PreparedInsight,
    ) -> Result<CommittedProfile, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (insight, created_insight) = match prepared {
                PreparedInsight::Existing(record) => (record, false),
                PreparedInsight::Candidate(record) => match insert_insight(&tx, &record) {
                    Ok(()) => (record, true),
                    Err(StoreError::Conflict(_)) => {
                        let existing = select_insight(&tx, &record.industry)?.ok_or_else(|| {
                            StoreError::NotFound(format!("insight {}", record.industry))
                        })?;
                        (existing, false)
                    }
                    Err(e) => return Err(e),
                },
            };

            let changed = tx.execute(
                "UPDATE users
                 SET industry = ?1, experience = ?2, bio = ?3, skills = ?4, updated_at = datetime('now')
                 WHERE id = ?5",
                params![
                    update.industry.as_str(),
                    update.experience,
                    update.bio,
                    to_json(&update.skills)?,
                    user_id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user #{}", user_id)));
            }

            let profile = select_user_by_id(&tx, user_id)?
                .ok_or_else(|| StoreError::NotFound(format!("user #{}", user_id)))?;
            tx.commit()?;

            Ok(CommittedProfile {
                profile,
                insight,
                created_insight,
            })
        })
        .await
    }
}

// --- Row helpers (shared by plain connections and transactions) ---

fn insert_insight(conn: &Connection, record: &InsightRecord) -> Result<(), StoreError> {
    let p = &record.payload;
    let sql = format!(
        "INSERT INTO insights ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        INSIGHT_COLUMNS
    );
    let result = conn.execute(
        &sql,
        params![
            record.industry.as_str(),
            to_json(&p.salary_ranges)?,
            p.growth_rate,
            p.demand_level.as_str(),
            to_json(&p.top_skills)?,
            p.market_outlook.as_str(),
            to_json(&p.key_trends)?,
            to_json(&p.recommended_skills)?,
            record.generated_at.timestamp_millis(),
            record.next_update.timestamp_millis(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) =>
        {
            Err(StoreError::Conflict(record.industry.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn select_insight(conn: &Connection, industry: &IndustryKey) -> Result<Option<InsightRecord>, StoreError> {
    let sql = format!("SELECT {} FROM insights WHERE industry = ?1", INSIGHT_COLUMNS);
    Ok(conn
        .query_row(&sql, [industry.as_str()], row_to_insight)
        .optional()?)
}

fn select_user_by_external_id(conn: &Connection, external_id: &str) -> Result<Option<UserProfile>, StoreError> {
    let sql = format!("SELECT {} FROM users WHERE external_id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [external_id], row_to_user).optional()?)
}

fn select_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserProfile>, StoreError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_user).optional()?)
}

fn row_to_insight(row: &rusqlite::Row) -> rusqlite::Result<InsightRecord> {
    let industry: String = row.get(0)?;
    let demand: String = row.get(3)?;
    let outlook: String = row.get(5)?;

    let payload = InsightPayload {
        salary_ranges: from_json_column(row, 1)?,
        growth_rate: row.get(2)?,
        demand_level: DemandLevel::parse(&demand)
            .ok_or_else(|| conversion_err(3, StoreError::Corrupt(format!("demand level {:?}", demand))))?,
        top_skills: from_json_column(row, 4)?,
        market_outlook: MarketOutlook::parse(&outlook)
            .ok_or_else(|| conversion_err(5, StoreError::Corrupt(format!("market outlook {:?}", outlook))))?,
        key_trends: from_json_column(row, 6)?,
        recommended_skills: from_json_column(row, 7)?,
    };

    Ok(InsightRecord {
        industry: IndustryKey::parse(&industry).map_err(|e| conversion_err(0, e))?,
        payload,
        generated_at: millis_column(row, 8)?,
        next_update: millis_column(row, 9)?,
    })
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
    let industry: Option<String> = row.get(4)?;
    Ok(UserProfile {
        id: row.get(0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        industry: industry
            .map(|s| IndustryKey::parse(&s))
            .transpose()
            .map_err(|e| conversion_err(4, e))?,
        experience: row.get(5)?,
        bio: row.get(6)?,
        skills: from_json_column(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json_column<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn millis_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_err(idx, StoreError::Corrupt(format!("timestamp {} out of range", ms))))
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, sample_payload};

    fn key(s: &str) -> IndustryKey {
        IndustryKey::parse(s).unwrap()
    }

    fn record(industry: &str, growth: f64, generated_at: DateTime<Utc>) -> InsightRecord {
        InsightRecord::new(key(industry), sample_payload(growth), generated_at, chrono::Duration::days(7))
    }

    fn update(industry: &str) -> ProfileUpdate {
        ProfileUpdate {
            industry: key(industry),
            experience: Some(4),
            bio: Some("Backend engineer".to_string()),
            skills: vec!["Rust".to_string(), "SQL".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_and_get_insight() {
        let db = memory_db().await;
        let rec = record("fintech", 3.5, Utc::now());
        db.create_insight(&rec).await.unwrap();

        let loaded = db.get_insight(&key("fintech")).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.next_update - loaded.generated_at, chrono::Duration::days(7));
        assert!(db.get_insight(&key("retail")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let db = memory_db().await;
        db.create_insight(&record("fintech", 1.0, Utc::now())).await.unwrap();

        let err = db
            .create_insight(&record("fintech", 2.0, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref k) if k == "fintech"));

        let loaded = db.get_insight(&key("fintech")).await.unwrap().unwrap();
        assert_eq!(loaded.payload.growth_rate, 1.0);
    }

    #[tokio::test]
    async fn test_list_stale_and_conditional_replace() {
        let db = memory_db().await;
        let now = Utc::now();
        db.create_insight(&record("retail", 1.0, now - chrono::Duration::days(8)))
            .await
            .unwrap();
        db.create_insight(&record("fintech", 1.0, now)).await.unwrap();

        assert_eq!(db.list_stale(now).await.unwrap(), vec![key("retail")]);

        let fresh = record("retail", 9.0, now);
        assert!(db.replace_insight_if_stale(&fresh, now).await.unwrap());
        // Second replacement sees a fresh row and does nothing.
        assert!(!db.replace_insight_if_stale(&record("retail", 5.0, now), now).await.unwrap());

        let loaded = db.get_insight(&key("retail")).await.unwrap().unwrap();
        assert_eq!(loaded.payload.growth_rate, 9.0);
        assert!(db.list_stale(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_create_user_is_idempotent() {
        let db = memory_db().await;
        let caller = CallerIdentity {
            user_id: "u1".to_string(),
            email: Some("u1@example.com".to_string()),
            name: Some("Asha".to_string()),
        };
        let first = db.get_or_create_user(&caller).await.unwrap();
        let second = db
            .get_or_create_user(&CallerIdentity::new("u1"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.email, "u1@example.com");
        assert!(second.industry.is_none());
        assert!(second.skills.is_empty());
    }

    #[tokio::test]
    async fn test_commit_creates_insight_and_profile_together() {
        let db = memory_db().await;
        let user = db.get_or_create_user(&CallerIdentity::new("u1")).await.unwrap();

        let committed = db
            .commit_profile_update(
                user.id,
                update("fintech"),
                PreparedInsight::Candidate(record("fintech", 2.0, Utc::now())),
            )
            .await
            .unwrap();

        assert!(committed.created_insight);
        assert_eq!(committed.profile.industry, Some(key("fintech")));
        assert_eq!(committed.profile.experience, Some(4));
        assert_eq!(committed.profile.skills, vec!["Rust", "SQL"]);
        assert!(db.get_insight(&key("fintech")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_falls_back_to_existing_on_conflict() {
        let db = memory_db().await;
        let winner = record("fintech", 1.0, Utc::now());
        db.create_insight(&winner).await.unwrap();
        let user = db.get_or_create_user(&CallerIdentity::new("u2")).await.unwrap();

        let committed = db
            .commit_profile_update(
                user.id,
                update("fintech"),
                PreparedInsight::Candidate(record("fintech", 99.0, Utc::now())),
            )
            .await
            .unwrap();

        assert!(!committed.created_insight);
        assert_eq!(committed.insight, winner);
        assert_eq!(committed.profile.industry, Some(key("fintech")));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_insight() {
        let db = memory_db().await;

        let err = db
            .commit_profile_update(
                404,
                update("fintech"),
                PreparedInsight::Candidate(record("fintech", 2.0, Utc::now())),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(db.get_insight(&key("fintech")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backed_database_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("insights.db");
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));

        assert!(matches!(
            db.ensure_initialized().await,
            Err(StoreError::NotInitialized)
        ));
        db.init().await.unwrap();
        db.ensure_initialized().await.unwrap();

        db.create_insight(&record("retail", 1.0, Utc::now())).await.unwrap();
        drop(db);

        let reopened = Database::open_at(&path).unwrap();
        assert_eq!(reopened.list_insights().await.unwrap().len(), 1);
    }
}
