//! SQLite database with Diesel ORM
//!
//! Stores the plant catalog, personalities, users and their plants, care
//! schedules, the care ledger, recent conversation and SMS traffic.
//! Tables are created on open with `CREATE ... IF NOT EXISTS`.

use crate::care::{self, CareTask};
use crate::catalog::{CareRequirements, CatalogRecord};
use crate::personality;
use crate::schema::*;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use tracing::{debug, info};

/// Messages kept per plant in the rolling conversation window
pub const CONVERSATION_LIMIT: i64 = 10;

/// Accepted values for `care_history.method`
pub const CARE_METHODS: [&str; 3] = ["manual", "sms", "api"];

/// Current schema version for planttexts
pub const CURRENT_SCHEMA: StoreSchema = StoreSchema {
    major: 1,
    minor: 3,
    patch: 0,
    name: "plant-care",
    features: &[
        "plants_catalog",
        "personality_types",
        "users",
        "user_plants",
        "care_schedules",
        "care_history",
        "conversation_messages",
        "sms_log",
        "seed_runs",
        "phone_verification",
    ],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct StoreSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl StoreSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::fmt::Display for StoreSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

fn now_string() -> String {
    care::format_timestamp(Utc::now())
}

/// Serialize a JSON-in-text column as the JSON value itself
fn json_text<S: Serializer>(text: &str, s: S) -> std::result::Result<S::Ok, S::Error> {
    let value: serde_json::Value = serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
    value.serialize(s)
}

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub features: &'a str,
    pub introduced_at: &'a str,
}

/// Queryable schema version
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = schema_versions)]
pub struct StoredSchema {
    pub id: i32,
    pub version: String,
    pub name: String,
    pub features: String,
    pub introduced_at: String,
}

// ============================================================================
// Reference Data Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = plants_catalog)]
pub struct NewCatalogEntry<'a> {
    pub name: &'a str,
    pub species: &'a str,
    pub category: &'a str,
    pub care_requirements: &'a str,
    pub difficulty_level: &'a str,
    pub description: Option<&'a str>,
    pub created_at: &'a str,
}

/// A species in the plant catalog
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = plants_catalog)]
pub struct CatalogEntry {
    pub id: i32,
    pub name: String,
    pub species: String,
    pub category: String,
    #[serde(serialize_with = "json_text")]
    pub care_requirements: String,
    pub difficulty_level: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl CatalogEntry {
    /// Decoded care requirements; malformed JSON yields defaults
    pub fn requirements(&self) -> CareRequirements {
        serde_json::from_str(&self.care_requirements).unwrap_or_default()
    }
}

#[derive(Insertable)]
#[diesel(table_name = personality_types)]
pub struct NewPersonality<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub prompt_template: &'a str,
    pub voice_traits: &'a str,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = personality_types)]
pub struct PersonalityRow {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub prompt_template: String,
    #[serde(serialize_with = "json_text")]
    pub voice_traits: String,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = seed_runs)]
pub struct NewSeedRun<'a> {
    pub source: &'a str,
    pub content_hash: &'a str,
    pub entries: i32,
    pub seeded_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = seed_runs)]
pub struct SeedRun {
    pub id: i32,
    pub source: String,
    pub content_hash: String,
    pub entries: i32,
    pub seeded_at: String,
}

// ============================================================================
// User and Plant Models
// ============================================================================

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}

/// Onboarding input for a new user. `phone` must already be canonical.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSignup {
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_tier")]
    pub subscription_tier: String,
}

impl UserSignup {
    pub fn with_phone(phone: &str) -> Self {
        Self {
            phone: phone.to_string(),
            email: None,
            timezone: default_timezone(),
            location: None,
            subscription_tier: default_tier(),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub phone: &'a str,
    pub email: Option<&'a str>,
    pub subscription_tier: &'a str,
    pub timezone: &'a str,
    pub location: Option<&'a str>,
    pub is_active: bool,
    pub created_at: &'a str,
    pub phone_verified: bool,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub phone: String,
    pub email: Option<String>,
    pub subscription_tier: String,
    pub timezone: String,
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub deleted_at: Option<String>,
    /// Set once the user answers the welcome text
    pub phone_verified: bool,
    pub verified_at: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = user_plants)]
pub struct NewUserPlant<'a> {
    pub user_id: i32,
    pub plant_catalog_id: i32,
    pub personality_type_id: i32,
    pub nickname: &'a str,
    pub is_active: bool,
    pub created_at: &'a str,
}

/// A user's named plant, bound to one personality for life
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = user_plants)]
pub struct UserPlant {
    pub id: i32,
    pub user_id: i32,
    pub plant_catalog_id: i32,
    pub personality_type_id: i32,
    pub nickname: String,
    pub is_active: bool,
    pub last_watered: Option<String>,
    pub last_fertilized: Option<String>,
    pub created_at: String,
    pub removed_at: Option<String>,
}

/// A plant with its catalog entry and personality
#[derive(Debug, Clone, Serialize)]
pub struct PlantDetails {
    #[serde(flatten)]
    pub plant: UserPlant,
    pub catalog: CatalogEntry,
    pub personality: PersonalityRow,
}

// ============================================================================
// Care Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = care_schedules)]
pub struct NewCareSchedule<'a> {
    pub user_plant_id: i32,
    pub task_type: &'a str,
    pub frequency_days: i32,
    pub next_due: &'a str,
    pub is_active: bool,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = care_schedules)]
pub struct CareSchedule {
    pub id: i32,
    pub user_plant_id: i32,
    pub task_type: String,
    pub frequency_days: i32,
    pub next_due: String,
    pub last_reminded_at: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl CareSchedule {
    pub fn task(&self) -> Option<CareTask> {
        CareTask::parse(&self.task_type)
    }
}

/// A due schedule together with the plant and user it belongs to
#[derive(Debug, Clone, Serialize)]
pub struct DueSchedule {
    pub schedule: CareSchedule,
    pub plant: UserPlant,
    pub user: User,
}

#[derive(Insertable)]
#[diesel(table_name = care_history)]
pub struct NewCareEvent<'a> {
    pub user_plant_id: i32,
    pub task_type: &'a str,
    pub completed_at: &'a str,
    pub method: &'a str,
    pub notes: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = care_history)]
pub struct CareEvent {
    pub id: i32,
    pub user_plant_id: i32,
    pub task_type: String,
    pub completed_at: String,
    pub method: String,
    pub notes: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Conversation and SMS Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = conversation_messages)]
pub struct NewMessage<'a> {
    pub user_plant_id: i32,
    pub role: &'a str,
    pub content: &'a str,
    pub created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = conversation_messages)]
pub struct ConversationMessage {
    pub id: i32,
    pub user_plant_id: i32,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Insertable SMS log row; `created_at` is filled in by [`Database::record_sms`]
#[derive(Debug, Clone)]
pub struct SmsRecord<'a> {
    pub direction: &'a str,
    pub phone: &'a str,
    pub body: &'a str,
    pub status: &'a str,
    pub provider: Option<&'a str>,
    pub provider_message_id: Option<&'a str>,
    pub error: Option<&'a str>,
}

#[derive(Insertable)]
#[diesel(table_name = sms_log)]
struct NewSmsLog<'a> {
    direction: &'a str,
    phone: &'a str,
    body: &'a str,
    status: &'a str,
    provider: Option<&'a str>,
    provider_message_id: Option<&'a str>,
    error: Option<&'a str>,
    created_at: &'a str,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = sms_log)]
pub struct SmsLogEntry {
    pub id: i32,
    pub direction: String,
    pub phone: String,
    pub body: String,
    pub status: String,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

/// Row of `PRAGMA table_info`, for column migrations
#[derive(QueryableByName, Debug)]
struct PragmaTableInfo {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas applied on every checkout
#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug)]
pub enum DbError {
    Connection(String),
    Query(diesel::result::Error),
    Pool(diesel::r2d2::Error),
    Validation(String),
    NotFound(String),
    Conflict(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connection(msg) => write!(f, "Connection error: {}", msg),
            DbError::Query(e) => write!(f, "Query error: {}", e),
            DbError::Pool(e) => write!(f, "Pool error: {}", e),
            DbError::Validation(msg) => write!(f, "{}", msg),
            DbError::NotFound(what) => write!(f, "{} not found", what),
            DbError::Conflict(msg) => write!(f, "Conflict: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DbError::Conflict(info.message().to_string())
            }
            diesel::result::Error::NotFound => DbError::NotFound("Record".to_string()),
            other => DbError::Query(other),
        }
    }
}

impl From<diesel::r2d2::Error> for DbError {
    fn from(e: diesel::r2d2::Error) -> Self {
        DbError::Pool(e)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32> {
    let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)?;
    Ok(id)
}

impl Database {
    /// Open database at specified path with default pool settings
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, 5, 5000)
    }

    /// Open database with explicit pool size and busy timeout
    pub fn open_with<P: AsRef<Path>>(path: P, pool_size: u32, busy_timeout_ms: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::Connection(e.to_string()))?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms }))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        debug!(path = %path_str, "database opened");
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        // WAL lets the webhook and the reminder worker write concurrently
        conn.batch_execute("PRAGMA journal_mode = WAL;")?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                features TEXT NOT NULL,
                introduced_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS plants_catalog (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                name TEXT NOT NULL,
                species TEXT NOT NULL UNIQUE,
                category TEXT NOT NULL DEFAULT '',
                care_requirements TEXT NOT NULL,
                difficulty_level TEXT NOT NULL DEFAULT 'medium',
                description TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS personality_types (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                prompt_template TEXT NOT NULL,
                voice_traits TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS seed_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                source TEXT NOT NULL,
                content_hash TEXT NOT NULL UNIQUE,
                entries INTEGER NOT NULL,
                seeded_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                phone TEXT NOT NULL UNIQUE,
                email TEXT,
                subscription_tier TEXT NOT NULL DEFAULT 'free',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                location TEXT,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                deleted_at TEXT,
                phone_verified BOOLEAN NOT NULL DEFAULT 0,
                verified_at TEXT
            )
        "#).execute(&mut conn)?;

        // Databases from before phone verification: existing users count as verified
        let user_columns: Vec<PragmaTableInfo> = diesel::sql_query("PRAGMA table_info(users)")
            .load(&mut conn)?;
        if !user_columns.iter().any(|c| c.name == "phone_verified") {
            diesel::sql_query("ALTER TABLE users ADD COLUMN phone_verified BOOLEAN NOT NULL DEFAULT 1")
                .execute(&mut conn)?;
            diesel::sql_query("ALTER TABLE users ADD COLUMN verified_at TEXT").execute(&mut conn)?;
            info!("added phone verification columns to users");
        }

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS user_plants (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id),
                plant_catalog_id INTEGER NOT NULL REFERENCES plants_catalog(id),
                personality_type_id INTEGER NOT NULL REFERENCES personality_types(id),
                nickname TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                last_watered TEXT,
                last_fertilized TEXT,
                created_at TEXT NOT NULL,
                removed_at TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS care_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_plant_id INTEGER NOT NULL REFERENCES user_plants(id),
                task_type TEXT NOT NULL,
                frequency_days INTEGER NOT NULL,
                next_due TEXT NOT NULL,
                last_reminded_at TEXT,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_plant_id, task_type)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS care_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_plant_id INTEGER NOT NULL REFERENCES user_plants(id),
                task_type TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT 'manual',
                notes TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_plant_id INTEGER NOT NULL REFERENCES user_plants(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS sms_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                direction TEXT NOT NULL,
                phone TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                provider TEXT,
                provider_message_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        // One active plant per (user, nickname)
        diesel::sql_query("CREATE UNIQUE INDEX IF NOT EXISTS idx_user_plants_nickname ON user_plants(user_id, nickname) WHERE is_active = 1").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_user_plants_user ON user_plants(user_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_schedules_due ON care_schedules(is_active, next_due)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_history_plant ON care_history(user_plant_id, completed_at)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_messages_plant ON conversation_messages(user_plant_id, id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_sms_log_created ON sms_log(created_at)").execute(&mut conn)?;

        // Register current schema
        self.register_schema(&CURRENT_SCHEMA)?;
        Ok(())
    }

    fn register_schema(&self, schema: &StoreSchema) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_string();
        let features_json = serde_json::to_string(&schema.features).unwrap_or_default();

        let new_schema = NewSchemaVersion {
            version: &schema.version_string(),
            name: schema.name,
            features: &features_json,
            introduced_at: &now,
        };

        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&new_schema)
            .execute(&mut conn)?;

        Ok(())
    }

    /// Most recently registered schema
    pub fn stored_schema(&self) -> Result<Option<StoredSchema>> {
        let mut conn = self.get_conn()?;
        let schema = schema_versions::table
            .order(schema_versions::id.desc())
            .first::<StoredSchema>(&mut conn)
            .optional()?;
        Ok(schema)
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Insert a catalog entry unless the species already exists.
    /// Returns the row id and whether a new row was written.
    pub fn insert_catalog_entry(&self, record: &CatalogRecord) -> Result<(i32, bool)> {
        let mut conn = self.get_conn()?;

        let existing = plants_catalog::table
            .filter(plants_catalog::species.eq(&record.species))
            .select(plants_catalog::id)
            .first::<i32>(&mut conn)
            .optional()?;
        if let Some(id) = existing {
            return Ok((id, false));
        }

        let now = now_string();
        let requirements = serde_json::to_string(&record.requirements)
            .map_err(|e| DbError::Validation(format!("Invalid care requirements: {}", e)))?;

        let entry = NewCatalogEntry {
            name: &record.name,
            species: &record.species,
            category: &record.category,
            care_requirements: &requirements,
            difficulty_level: record.difficulty,
            description: record.description.as_deref(),
            created_at: &now,
        };

        diesel::insert_into(plants_catalog::table)
            .values(&entry)
            .execute(&mut conn)?;

        Ok((last_insert_id(&mut conn)?, true))
    }

    /// Catalog listing, optionally filtered by name, species or category
    pub fn list_catalog(&self, search: Option<&str>, limit: i64) -> Result<Vec<CatalogEntry>> {
        let mut conn = self.get_conn()?;
        let mut query = plants_catalog::table.into_boxed();

        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", term);
            query = query.filter(
                plants_catalog::name
                    .like(pattern.clone())
                    .or(plants_catalog::species.like(pattern.clone()))
                    .or(plants_catalog::category.like(pattern)),
            );
        }

        let entries = query
            .order(plants_catalog::name.asc())
            .limit(limit.max(1))
            .load::<CatalogEntry>(&mut conn)?;
        Ok(entries)
    }

    pub fn get_catalog_entry(&self, id: i32) -> Result<CatalogEntry> {
        let mut conn = self.get_conn()?;
        plants_catalog::table
            .filter(plants_catalog::id.eq(id))
            .first::<CatalogEntry>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Catalog entry {}", id)))
    }

    pub fn catalog_count(&self) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let count = plants_catalog::table.count().get_result(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Personalities
    // ========================================================================

    pub fn upsert_personality(
        &self,
        name: &str,
        description: &str,
        prompt_template: &str,
        voice_traits: &str,
    ) -> Result<i32> {
        let mut conn = self.get_conn()?;

        let existing = personality_types::table
            .filter(personality_types::name.eq(name))
            .select(personality_types::id)
            .first::<i32>(&mut conn)
            .optional()?;

        if let Some(id) = existing {
            diesel::update(personality_types::table.filter(personality_types::id.eq(id)))
                .set((
                    personality_types::description.eq(description),
                    personality_types::prompt_template.eq(prompt_template),
                    personality_types::voice_traits.eq(voice_traits),
                ))
                .execute(&mut conn)?;
            return Ok(id);
        }

        let now = now_string();
        diesel::insert_into(personality_types::table)
            .values(&NewPersonality {
                name,
                description,
                prompt_template,
                voice_traits,
                created_at: &now,
            })
            .execute(&mut conn)?;
        last_insert_id(&mut conn)
    }

    pub fn list_personalities(&self) -> Result<Vec<PersonalityRow>> {
        let mut conn = self.get_conn()?;
        let rows = personality_types::table
            .order(personality_types::id.asc())
            .load::<PersonalityRow>(&mut conn)?;
        Ok(rows)
    }

    pub fn get_personality(&self, id: i32) -> Result<PersonalityRow> {
        let mut conn = self.get_conn()?;
        personality_types::table
            .filter(personality_types::id.eq(id))
            .first::<PersonalityRow>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Personality {}", id)))
    }

    pub fn get_personality_by_name(&self, name: &str) -> Result<PersonalityRow> {
        let mut conn = self.get_conn()?;
        personality_types::table
            .filter(personality_types::name.eq(name))
            .first::<PersonalityRow>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Personality '{}'", name)))
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user; a phone number already on file is a `Conflict`
    pub fn create_user(&self, signup: &UserSignup) -> Result<User> {
        if signup.phone.trim().is_empty() {
            return Err(DbError::Validation("Phone number is required".to_string()));
        }
        let mut conn = self.get_conn()?;
        let now = now_string();

        let new_user = NewUser {
            phone: signup.phone.trim(),
            email: signup.email.as_deref().filter(|e| !e.trim().is_empty()),
            subscription_tier: &signup.subscription_tier,
            timezone: &signup.timezone,
            location: signup.location.as_deref(),
            is_active: true,
            created_at: &now,
            phone_verified: false,
        };

        diesel::insert_into(users::table)
            .values(&new_user)
            .execute(&mut conn)
            .map_err(|e| match DbError::from(e) {
                DbError::Conflict(_) => {
                    DbError::Conflict(format!("Phone number {} is already registered", signup.phone))
                }
                other => other,
            })?;

        let id = last_insert_id(&mut conn)?;
        info!(user_id = id, "user created");
        drop(conn);
        self.get_user(id)
    }

    /// Return the user for this phone, creating (or reactivating) as needed.
    /// The boolean is true when a new row was created.
    pub fn find_or_create_user(&self, signup: &UserSignup) -> Result<(User, bool)> {
        let mut conn = self.get_conn()?;
        let existing = users::table
            .filter(users::phone.eq(signup.phone.trim()))
            .first::<User>(&mut conn)
            .optional()?;

        match existing {
            Some(user) if user.is_active && user.deleted_at.is_none() => Ok((user, false)),
            Some(user) => {
                diesel::update(users::table.filter(users::id.eq(user.id)))
                    .set((
                        users::is_active.eq(true),
                        users::deleted_at.eq(None::<String>),
                    ))
                    .execute(&mut conn)?;
                info!(user_id = user.id, "user reactivated");
                drop(conn);
                Ok((self.get_user(user.id)?, false))
            }
            None => {
                drop(conn);
                match self.create_user(signup) {
                    Ok(user) => Ok((user, true)),
                    // Lost a race with a concurrent signup
                    Err(DbError::Conflict(_)) => {
                        let mut conn = self.get_conn()?;
                        let user = users::table
                            .filter(users::phone.eq(signup.phone.trim()))
                            .first::<User>(&mut conn)?;
                        Ok((user, false))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub fn get_user(&self, id: i32) -> Result<User> {
        let mut conn = self.get_conn()?;
        users::table
            .filter(users::id.eq(id))
            .first::<User>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("User {}", id)))
    }

    /// Look up a non-deleted user by any canonical variant of `raw`.
    /// `default_cc` is the country code numbers were normalized with.
    pub fn find_user_by_phone(&self, raw: &str, default_cc: &str) -> Result<Option<User>> {
        let variants = crate::sms::phone_variants(raw, default_cc);
        if variants.is_empty() {
            return Ok(None);
        }
        let mut conn = self.get_conn()?;
        let user = users::table
            .filter(users::phone.eq_any(&variants))
            .filter(users::deleted_at.is_null())
            .order(users::id.asc())
            .first::<User>(&mut conn)
            .optional()?;
        Ok(user)
    }

    /// Record that the user answered from this phone. Returns false when
    /// the phone was already verified.
    pub fn mark_phone_verified(&self, id: i32) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let now = now_string();
        let updated = diesel::update(
            users::table
                .filter(users::id.eq(id))
                .filter(users::phone_verified.eq(false)),
        )
        .set((users::phone_verified.eq(true), users::verified_at.eq(Some(now.as_str()))))
        .execute(&mut conn)?;
        if updated == 0 {
            drop(conn);
            // Distinguish "already verified" from a missing user
            self.get_user(id)?;
            return Ok(false);
        }
        info!(user_id = id, "phone verified");
        Ok(true)
    }

    /// Opt a user in or out of reminders without deleting anything
    pub fn set_user_active(&self, id: i32, active: bool) -> Result<()> {
        let mut conn = self.get_conn()?;
        let updated = diesel::update(users::table.filter(users::id.eq(id)))
            .set(users::is_active.eq(active))
            .execute(&mut conn)?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("User {}", id)));
        }
        Ok(())
    }

    /// Soft delete: the user, their plants and schedules are deactivated
    pub fn deactivate_user(&self, id: i32) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_string();

        conn.immediate_transaction::<_, DbError, _>(|conn| {
            let updated = diesel::update(users::table.filter(users::id.eq(id)))
                .set((users::is_active.eq(false), users::deleted_at.eq(Some(now.as_str()))))
                .execute(conn)?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("User {}", id)));
            }

            let plant_ids: Vec<i32> = user_plants::table
                .filter(user_plants::user_id.eq(id))
                .filter(user_plants::is_active.eq(true))
                .select(user_plants::id)
                .load(conn)?;

            diesel::update(user_plants::table.filter(user_plants::id.eq_any(&plant_ids)))
                .set((user_plants::is_active.eq(false), user_plants::removed_at.eq(Some(now.as_str()))))
                .execute(conn)?;
            diesel::update(care_schedules::table.filter(care_schedules::user_plant_id.eq_any(&plant_ids)))
                .set((care_schedules::is_active.eq(false), care_schedules::updated_at.eq(&now)))
                .execute(conn)?;
            Ok(())
        })?;

        info!(user_id = id, "user deactivated");
        Ok(())
    }

    pub fn list_active_users(&self) -> Result<Vec<User>> {
        let mut conn = self.get_conn()?;
        let rows = users::table
            .filter(users::is_active.eq(true))
            .filter(users::deleted_at.is_null())
            .order(users::id.asc())
            .load::<User>(&mut conn)?;
        Ok(rows)
    }

    // ========================================================================
    // Plants
    // ========================================================================

    /// Add a plant to a user's collection.
    ///
    /// Idempotent per (user, nickname): if an active plant with this
    /// nickname exists it is returned unchanged and the boolean is false.
    /// Otherwise the personality is resolved from the catalog category and
    /// the initial care schedules are created.
    pub fn add_user_plant(&self, user_id: i32, catalog_id: i32, nickname: &str) -> Result<(UserPlant, bool)> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(DbError::Validation("Nickname is required".to_string()));
        }

        let user = self.get_user(user_id)?;
        if !user.is_active || user.deleted_at.is_some() {
            return Err(DbError::Validation(format!("User {} is not active", user_id)));
        }
        let entry = self.get_catalog_entry(catalog_id)?;
        let requirements = entry.requirements();

        let kind = personality::personality_for_category(&entry.category, &requirements.climate);
        let personality = match self.get_personality_by_name(kind.name()) {
            Ok(row) => row,
            Err(DbError::NotFound(_)) => {
                personality::seed_personalities(self)?;
                self.get_personality_by_name(kind.name())?
            }
            Err(e) => return Err(e),
        };

        let mut conn = self.get_conn()?;
        let now = Utc::now();
        let now_str = care::format_timestamp(now);

        let (plant_id, created) = conn.immediate_transaction::<_, DbError, _>(|conn| {
            let existing = user_plants::table
                .filter(user_plants::user_id.eq(user_id))
                .filter(user_plants::nickname.eq(nickname))
                .filter(user_plants::is_active.eq(true))
                .select(user_plants::id)
                .first::<i32>(conn)
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }

            diesel::insert_into(user_plants::table)
                .values(&NewUserPlant {
                    user_id,
                    plant_catalog_id: catalog_id,
                    personality_type_id: personality.id,
                    nickname,
                    is_active: true,
                    created_at: &now_str,
                })
                .execute(conn)?;
            let plant_id = last_insert_id(conn)?;

            for (task, days) in care::initial_schedules(&requirements) {
                let due = care::format_timestamp(care::next_due(now, days));
                diesel::insert_into(care_schedules::table)
                    .values(&NewCareSchedule {
                        user_plant_id: plant_id,
                        task_type: task.as_str(),
                        frequency_days: days,
                        next_due: &due,
                        is_active: true,
                        created_at: &now_str,
                        updated_at: &now_str,
                    })
                    .execute(conn)?;
            }
            Ok((plant_id, true))
        })?;

        if created {
            info!(plant_id, user_id, personality = kind.name(), nickname, "plant added");
        } else {
            debug!(plant_id, user_id, nickname, "plant already exists");
        }
        drop(conn);
        Ok((self.get_user_plant(plant_id)?, created))
    }

    pub fn get_user_plant(&self, id: i32) -> Result<UserPlant> {
        let mut conn = self.get_conn()?;
        user_plants::table
            .filter(user_plants::id.eq(id))
            .first::<UserPlant>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Plant {}", id)))
    }

    /// Active plants of a user, oldest first
    pub fn list_user_plants(&self, user_id: i32) -> Result<Vec<UserPlant>> {
        let mut conn = self.get_conn()?;
        let rows = user_plants::table
            .filter(user_plants::user_id.eq(user_id))
            .filter(user_plants::is_active.eq(true))
            .order(user_plants::id.asc())
            .load::<UserPlant>(&mut conn)?;
        Ok(rows)
    }

    pub fn remove_user_plant(&self, id: i32) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_string();

        conn.immediate_transaction::<_, DbError, _>(|conn| {
            let updated = diesel::update(user_plants::table.filter(user_plants::id.eq(id)))
                .set((user_plants::is_active.eq(false), user_plants::removed_at.eq(Some(now.as_str()))))
                .execute(conn)?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("Plant {}", id)));
            }
            diesel::update(care_schedules::table.filter(care_schedules::user_plant_id.eq(id)))
                .set((care_schedules::is_active.eq(false), care_schedules::updated_at.eq(&now)))
                .execute(conn)?;
            Ok(())
        })?;

        info!(plant_id = id, "plant removed");
        Ok(())
    }

    pub fn plant_details(&self, id: i32) -> Result<PlantDetails> {
        let plant = self.get_user_plant(id)?;
        let catalog = self.get_catalog_entry(plant.plant_catalog_id)?;
        let personality = self.get_personality(plant.personality_type_id)?;
        Ok(PlantDetails { plant, catalog, personality })
    }

    /// Active plants of a user with catalog entry and personality attached
    pub fn list_plant_details(&self, user_id: i32) -> Result<Vec<PlantDetails>> {
        let plants = self.list_user_plants(user_id)?;
        let mut conn = self.get_conn()?;

        let catalog_ids: Vec<i32> = plants.iter().map(|p| p.plant_catalog_id).collect();
        let personality_ids: Vec<i32> = plants.iter().map(|p| p.personality_type_id).collect();

        let entries = plants_catalog::table
            .filter(plants_catalog::id.eq_any(&catalog_ids))
            .load::<CatalogEntry>(&mut conn)?;
        let personalities = personality_types::table
            .filter(personality_types::id.eq_any(&personality_ids))
            .load::<PersonalityRow>(&mut conn)?;

        let mut details = Vec::with_capacity(plants.len());
        for plant in plants {
            let catalog = entries
                .iter()
                .find(|e| e.id == plant.plant_catalog_id)
                .cloned()
                .ok_or_else(|| DbError::NotFound(format!("Catalog entry {}", plant.plant_catalog_id)))?;
            let personality = personalities
                .iter()
                .find(|p| p.id == plant.personality_type_id)
                .cloned()
                .ok_or_else(|| DbError::NotFound(format!("Personality {}", plant.personality_type_id)))?;
            details.push(PlantDetails { plant, catalog, personality });
        }
        Ok(details)
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    pub fn get_schedule(&self, id: i32) -> Result<CareSchedule> {
        let mut conn = self.get_conn()?;
        care_schedules::table
            .filter(care_schedules::id.eq(id))
            .first::<CareSchedule>(&mut conn)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("Schedule {}", id)))
    }

    /// Active schedules for one plant, soonest first
    pub fn list_schedules_for_plant(&self, plant_id: i32) -> Result<Vec<CareSchedule>> {
        let mut conn = self.get_conn()?;
        let rows = care_schedules::table
            .filter(care_schedules::user_plant_id.eq(plant_id))
            .filter(care_schedules::is_active.eq(true))
            .order((care_schedules::next_due.asc(), care_schedules::id.asc()))
            .load::<CareSchedule>(&mut conn)?;
        Ok(rows)
    }

    /// Active schedules across a user's active plants, soonest first
    pub fn list_schedules_for_user(&self, user_id: i32) -> Result<Vec<CareSchedule>> {
        let mut conn = self.get_conn()?;
        let plant_ids: Vec<i32> = user_plants::table
            .filter(user_plants::user_id.eq(user_id))
            .filter(user_plants::is_active.eq(true))
            .select(user_plants::id)
            .load(&mut conn)?;

        let rows = care_schedules::table
            .filter(care_schedules::user_plant_id.eq_any(&plant_ids))
            .filter(care_schedules::is_active.eq(true))
            .order((care_schedules::next_due.asc(), care_schedules::id.asc()))
            .load::<CareSchedule>(&mut conn)?;
        Ok(rows)
    }

    /// Schedules due at `now` that were not reminded since `repeat_cutoff`,
    /// restricted to active plants of active users, ordered by `next_due`
    pub fn due_schedules(&self, now: DateTime<Utc>, repeat_cutoff: DateTime<Utc>) -> Result<Vec<DueSchedule>> {
        let mut conn = self.get_conn()?;
        let now = care::format_timestamp(now);
        let cutoff = care::format_timestamp(repeat_cutoff);

        let schedules = care_schedules::table
            .filter(care_schedules::is_active.eq(true))
            .filter(care_schedules::next_due.le(&now))
            .filter(
                care_schedules::last_reminded_at
                    .is_null()
                    .or(care_schedules::last_reminded_at.lt(&cutoff)),
            )
            .order((care_schedules::next_due.asc(), care_schedules::id.asc()))
            .load::<CareSchedule>(&mut conn)?;

        let plant_ids: Vec<i32> = schedules.iter().map(|s| s.user_plant_id).collect();
        let plants = user_plants::table
            .filter(user_plants::id.eq_any(&plant_ids))
            .filter(user_plants::is_active.eq(true))
            .load::<UserPlant>(&mut conn)?;

        let user_ids: Vec<i32> = plants.iter().map(|p| p.user_id).collect();
        let owners = users::table
            .filter(users::id.eq_any(&user_ids))
            .filter(users::is_active.eq(true))
            .filter(users::deleted_at.is_null())
            .filter(users::phone_verified.eq(true))
            .load::<User>(&mut conn)?;

        let due = schedules
            .into_iter()
            .filter_map(|schedule| {
                let plant = plants.iter().find(|p| p.id == schedule.user_plant_id)?.clone();
                let user = owners.iter().find(|u| u.id == plant.user_id)?.clone();
                Some(DueSchedule { schedule, plant, user })
            })
            .collect();
        Ok(due)
    }

    pub fn mark_reminded(&self, schedule_id: i32, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let at = care::format_timestamp(at);
        let updated = diesel::update(care_schedules::table.filter(care_schedules::id.eq(schedule_id)))
            .set((
                care_schedules::last_reminded_at.eq(Some(at.as_str())),
                care_schedules::updated_at.eq(&at),
            ))
            .execute(&mut conn)?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("Schedule {}", schedule_id)));
        }
        Ok(())
    }

    /// Push a schedule's due date to `until` and make it eligible again
    pub fn snooze_schedule(&self, schedule_id: i32, until: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let until = care::format_timestamp(until);
        let updated = diesel::update(care_schedules::table.filter(care_schedules::id.eq(schedule_id)))
            .set((
                care_schedules::next_due.eq(&until),
                care_schedules::last_reminded_at.eq(None::<String>),
                care_schedules::updated_at.eq(now_string()),
            ))
            .execute(&mut conn)?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("Schedule {}", schedule_id)));
        }
        Ok(())
    }

    /// The plant's schedule that was reminded most recently, if any
    pub fn last_reminded_schedule(&self, plant_id: i32) -> Result<Option<CareSchedule>> {
        let mut conn = self.get_conn()?;
        let row = care_schedules::table
            .filter(care_schedules::user_plant_id.eq(plant_id))
            .filter(care_schedules::is_active.eq(true))
            .filter(care_schedules::last_reminded_at.is_not_null())
            .order(care_schedules::last_reminded_at.desc())
            .first::<CareSchedule>(&mut conn)
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // Care Ledger
    // ========================================================================

    /// Append a care event and move the matching schedule forward.
    ///
    /// `completed_at` defaults to now. The schedule's next due date becomes
    /// `completed_at + frequency_days`.
    pub fn log_care_event(
        &self,
        plant_id: i32,
        task: CareTask,
        method: &str,
        notes: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<CareEvent> {
        if !CARE_METHODS.contains(&method) {
            return Err(DbError::Validation(format!(
                "Invalid care method '{}'. Must be one of: {}",
                method,
                CARE_METHODS.join(", ")
            )));
        }

        let plant = self.get_user_plant(plant_id)?;
        if !plant.is_active {
            return Err(DbError::Validation(format!("Plant {} has been removed", plant_id)));
        }

        let completed = completed_at.unwrap_or_else(Utc::now);
        let completed_str = care::format_timestamp(completed);
        let now = now_string();
        let mut conn = self.get_conn()?;

        let event_id = conn.immediate_transaction::<_, DbError, _>(|conn| {
            diesel::insert_into(care_history::table)
                .values(&NewCareEvent {
                    user_plant_id: plant_id,
                    task_type: task.as_str(),
                    completed_at: &completed_str,
                    method,
                    notes,
                    created_at: &now,
                })
                .execute(conn)?;
            let event_id = last_insert_id(conn)?;

            match task {
                CareTask::Watering => {
                    diesel::update(user_plants::table.filter(user_plants::id.eq(plant_id)))
                        .set(user_plants::last_watered.eq(Some(completed_str.as_str())))
                        .execute(conn)?;
                }
                CareTask::Fertilizing => {
                    diesel::update(user_plants::table.filter(user_plants::id.eq(plant_id)))
                        .set(user_plants::last_fertilized.eq(Some(completed_str.as_str())))
                        .execute(conn)?;
                }
                _ => {}
            }

            let schedule = care_schedules::table
                .filter(care_schedules::user_plant_id.eq(plant_id))
                .filter(care_schedules::task_type.eq(task.as_str()))
                .filter(care_schedules::is_active.eq(true))
                .first::<CareSchedule>(conn)
                .optional()?;
            if let Some(schedule) = schedule {
                let due = care::format_timestamp(care::next_due(completed, schedule.frequency_days));
                diesel::update(care_schedules::table.filter(care_schedules::id.eq(schedule.id)))
                    .set((
                        care_schedules::next_due.eq(&due),
                        care_schedules::last_reminded_at.eq(None::<String>),
                        care_schedules::updated_at.eq(&now),
                    ))
                    .execute(conn)?;
            }
            Ok(event_id)
        })?;

        info!(plant_id, task = %task, method, "care logged");

        let event = care_history::table
            .filter(care_history::id.eq(event_id))
            .first::<CareEvent>(&mut conn)?;
        Ok(event)
    }

    /// Newest care events first
    pub fn recent_care(&self, plant_id: i32, limit: i64) -> Result<Vec<CareEvent>> {
        let mut conn = self.get_conn()?;
        let rows = care_history::table
            .filter(care_history::user_plant_id.eq(plant_id))
            .order((care_history::completed_at.desc(), care_history::id.desc()))
            .limit(limit)
            .load::<CareEvent>(&mut conn)?;
        Ok(rows)
    }

    pub fn last_care_event(&self, plant_id: i32, task: CareTask) -> Result<Option<CareEvent>> {
        let mut conn = self.get_conn()?;
        let row = care_history::table
            .filter(care_history::user_plant_id.eq(plant_id))
            .filter(care_history::task_type.eq(task.as_str()))
            .order((care_history::completed_at.desc(), care_history::id.desc()))
            .first::<CareEvent>(&mut conn)
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // Conversation
    // ========================================================================

    /// Append a message, keeping only the most recent [`CONVERSATION_LIMIT`]
    pub fn append_message(&self, plant_id: i32, role: &str, content: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_string();

        conn.immediate_transaction::<_, DbError, _>(|conn| {
            diesel::insert_into(conversation_messages::table)
                .values(&NewMessage {
                    user_plant_id: plant_id,
                    role,
                    content,
                    created_at: &now,
                })
                .execute(conn)?;

            let keep: Vec<i32> = conversation_messages::table
                .filter(conversation_messages::user_plant_id.eq(plant_id))
                .order(conversation_messages::id.desc())
                .limit(CONVERSATION_LIMIT)
                .select(conversation_messages::id)
                .load(conn)?;

            diesel::delete(
                conversation_messages::table
                    .filter(conversation_messages::user_plant_id.eq(plant_id))
                    .filter(conversation_messages::id.ne_all(&keep)),
            )
            .execute(conn)?;
            Ok(())
        })
    }

    /// The last `limit` messages, oldest first
    pub fn recent_messages(&self, plant_id: i32, limit: i64) -> Result<Vec<ConversationMessage>> {
        let mut conn = self.get_conn()?;
        let mut rows = conversation_messages::table
            .filter(conversation_messages::user_plant_id.eq(plant_id))
            .order(conversation_messages::id.desc())
            .limit(limit)
            .load::<ConversationMessage>(&mut conn)?;
        rows.reverse();
        Ok(rows)
    }

    // ========================================================================
    // SMS Log
    // ========================================================================

    pub fn record_sms(&self, record: &SmsRecord<'_>) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let now = now_string();

        diesel::insert_into(sms_log::table)
            .values(&NewSmsLog {
                direction: record.direction,
                phone: record.phone,
                body: record.body,
                status: record.status,
                provider: record.provider,
                provider_message_id: record.provider_message_id,
                error: record.error,
                created_at: &now,
            })
            .execute(&mut conn)?;

        last_insert_id(&mut conn)
    }

    /// Newest first
    pub fn recent_sms(&self, limit: i64) -> Result<Vec<SmsLogEntry>> {
        let mut conn = self.get_conn()?;
        let rows = sms_log::table
            .order(sms_log::id.desc())
            .limit(limit)
            .load::<SmsLogEntry>(&mut conn)?;
        Ok(rows)
    }

    // ========================================================================
    // Seed Runs
    // ========================================================================

    pub fn seed_run_exists(&self, content_hash: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count: i64 = seed_runs::table
            .filter(seed_runs::content_hash.eq(content_hash))
            .count()
            .get_result(&mut conn)?;
        Ok(count > 0)
    }

    pub fn record_seed_run(&self, source: &str, content_hash: &str, entries: i32) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = now_string();
        diesel::insert_or_ignore_into(seed_runs::table)
            .values(&NewSeedRun {
                source,
                content_hash,
                entries,
                seeded_at: &now,
            })
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn list_seed_runs(&self) -> Result<Vec<SeedRun>> {
        let mut conn = self.get_conn()?;
        let rows = seed_runs::table
            .order(seed_runs::id.asc())
            .load::<SeedRun>(&mut conn)?;
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{bundled_seed, seed_catalog, BUNDLED_SOURCE};
    use chrono::Duration;
    use tempfile::TempDir;

    /// Seeded database in a temp dir; keep the TempDir alive for the test
    pub(crate) fn seeded_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        personality::seed_personalities(&db).unwrap();
        seed_catalog(&db, BUNDLED_SOURCE, bundled_seed()).unwrap();
        (dir, db)
    }

    pub(crate) fn catalog_id(db: &Database, species: &str) -> i32 {
        db.list_catalog(Some(species), 5).unwrap()[0].id
    }

    #[test]
    fn test_open_registers_schema() {
        let (_dir, db) = seeded_db();
        let schema = db.stored_schema().unwrap().unwrap();
        assert_eq!(schema.version, CURRENT_SCHEMA.version_string());
        assert_eq!(db.list_personalities().unwrap().len(), 7);
    }

    #[test]
    fn test_create_user_duplicate_phone_conflicts() {
        let (_dir, db) = seeded_db();
        db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let err = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn test_find_user_by_phone_variants() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();

        for raw in ["+15551234567", "15551234567", "5551234567", "(555) 123-4567"] {
            let found = db.find_user_by_phone(raw, "+1").unwrap();
            assert_eq!(found.map(|u| u.id), Some(user.id), "lookup by {}", raw);
        }
        assert!(db.find_user_by_phone("+15550000000", "+1").unwrap().is_none());
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let (_dir, db) = seeded_db();
        let signup = UserSignup::with_phone("+15551112222");
        let (first, created) = db.find_or_create_user(&signup).unwrap();
        assert!(created);
        let (second, created) = db.find_or_create_user(&signup).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_add_plant_is_idempotent_per_nickname() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let fern = catalog_id(&db, "Nephrolepis exaltata");

        let (plant, created) = db.add_user_plant(user.id, fern, "Fernanda").unwrap();
        assert!(created);
        let (again, created) = db.add_user_plant(user.id, fern, "Fernanda").unwrap();
        assert!(!created);
        assert_eq!(plant.id, again.id);
        assert_eq!(db.list_user_plants(user.id).unwrap().len(), 1);

        let personality = db.get_personality(plant.personality_type_id).unwrap();
        assert_eq!(personality.name, "dramatic_communicator");
    }

    #[test]
    fn test_add_plant_creates_schedules() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let fern = catalog_id(&db, "Nephrolepis exaltata");
        let (plant, _) = db.add_user_plant(user.id, fern, "Fernanda").unwrap();

        let tasks: Vec<String> = db
            .list_schedules_for_plant(plant.id)
            .unwrap()
            .into_iter()
            .map(|s| s.task_type)
            .collect();
        assert!(tasks.contains(&"watering".to_string()));
        assert!(tasks.contains(&"fertilizing".to_string()));
        // ferns are high humidity
        assert!(tasks.contains(&"misting".to_string()));
    }

    #[test]
    fn test_add_plant_unknown_catalog_is_not_found() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let err = db.add_user_plant(user.id, 99_999, "Ghost").unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        let err = db.add_user_plant(user.id, 1, "   ").unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn test_log_care_moves_schedule() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let aloe = catalog_id(&db, "Aloe vera");
        let (plant, _) = db.add_user_plant(user.id, aloe, "Spike").unwrap();

        let when = Utc::now() - Duration::days(1);
        let event = db
            .log_care_event(plant.id, CareTask::Watering, "manual", Some("deep soak"), Some(when))
            .unwrap();
        assert_eq!(event.method, "manual");

        let schedule = db
            .list_schedules_for_plant(plant.id)
            .unwrap()
            .into_iter()
            .find(|s| s.task_type == "watering")
            .unwrap();
        let expected = care::next_due(
            care::parse_timestamp(&event.completed_at).unwrap(),
            schedule.frequency_days,
        );
        assert_eq!(schedule.next_due, care::format_timestamp(expected));

        let plant = db.get_user_plant(plant.id).unwrap();
        assert_eq!(plant.last_watered.as_deref(), Some(event.completed_at.as_str()));
        assert_eq!(
            db.last_care_event(plant.id, CareTask::Watering).unwrap().map(|e| e.id),
            Some(event.id)
        );
    }

    #[test]
    fn test_log_care_rejects_bad_method() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let (plant, _) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();
        let err = db
            .log_care_event(plant.id, CareTask::Watering, "telepathy", None, None)
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn test_due_schedules_skip_deleted_users() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        db.mark_phone_verified(user.id).unwrap();
        let (plant, _) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        let later = Utc::now() + Duration::days(400);
        let due = db.due_schedules(later, later - Duration::hours(24)).unwrap();
        assert!(due.iter().any(|d| d.plant.id == plant.id));

        db.deactivate_user(user.id).unwrap();
        let due = db.due_schedules(later, later - Duration::hours(24)).unwrap();
        assert!(due.is_empty());
        assert!(db.find_user_by_phone("+15551234567", "+1").unwrap().is_none());
        assert!(db.list_user_plants(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_mark_reminded_suppresses_repeat() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        db.mark_phone_verified(user.id).unwrap();
        db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        let later = Utc::now() + Duration::days(400);
        let cutoff = later - Duration::hours(24);
        let due = db.due_schedules(later, cutoff).unwrap();
        let first = due[0].schedule.id;

        db.mark_reminded(first, later - Duration::hours(1)).unwrap();
        let due = db.due_schedules(later, cutoff).unwrap();
        assert!(due.iter().all(|d| d.schedule.id != first));

        let reminded = db.last_reminded_schedule(due_plant(&db, first)).unwrap().unwrap();
        assert_eq!(reminded.id, first);

        db.snooze_schedule(first, later + Duration::hours(4)).unwrap();
        let snoozed = db.get_schedule(first).unwrap();
        assert!(snoozed.last_reminded_at.is_none());
        assert!(snoozed.next_due > care::format_timestamp(later));
    }

    fn due_plant(db: &Database, schedule_id: i32) -> i32 {
        db.get_schedule(schedule_id).unwrap().user_plant_id
    }

    #[test]
    fn test_conversation_keeps_last_ten() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let (plant, _) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        for i in 0..15 {
            db.append_message(plant.id, "user", &format!("message {}", i)).unwrap();
        }
        let all = db.recent_messages(plant.id, 100).unwrap();
        assert_eq!(all.len(), CONVERSATION_LIMIT as usize);
        assert_eq!(all.first().unwrap().content, "message 5");
        assert_eq!(all.last().unwrap().content, "message 14");
    }

    #[test]
    fn test_remove_plant_deactivates_schedules() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let (plant, _) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        db.remove_user_plant(plant.id).unwrap();
        assert!(db.list_schedules_for_plant(plant.id).unwrap().is_empty());
        assert!(matches!(db.remove_user_plant(424242), Err(DbError::NotFound(_))));

        // nickname is free again once the plant is removed
        let (replacement, created) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();
        assert!(created);
        assert_ne!(replacement.id, plant.id);
    }

    #[test]
    fn test_concurrent_writes_do_not_lock_out() {
        use std::sync::{Arc, Barrier};

        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        let aloe = catalog_id(&db, "Aloe vera");

        for round in 0..20 {
            let nickname = format!("Spike{}", round);
            let barrier = Arc::new(Barrier::new(4));
            let results: Vec<Result<(UserPlant, bool)>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let db = db.clone();
                        let barrier = Arc::clone(&barrier);
                        let nickname = nickname.as_str();
                        scope.spawn(move || {
                            barrier.wait();
                            db.add_user_plant(user.id, aloe, nickname)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let errors: Vec<String> = results
                .iter()
                .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
                .collect();
            assert!(errors.is_empty(), "round {}: {:?}", round, errors);
            let created = results.iter().filter(|r| matches!(r, Ok((_, true)))).count();
            assert_eq!(created, 1, "round {}: exactly one add creates the plant", round);
        }
        assert_eq!(db.list_user_plants(user.id).unwrap().len(), 20);

        // concurrent care logging on one plant
        let plant = db.list_user_plants(user.id).unwrap().remove(0);
        let barrier = Arc::new(Barrier::new(4));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    db.log_care_event(plant.id, CareTask::Watering, "api", None, None).unwrap();
                });
            }
        });
        assert_eq!(db.recent_care(plant.id, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_mark_phone_verified() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        assert!(!user.phone_verified);
        assert!(user.verified_at.is_none());

        assert!(db.mark_phone_verified(user.id).unwrap());
        let user = db.get_user(user.id).unwrap();
        assert!(user.phone_verified);
        assert!(user.verified_at.is_some());

        assert!(!db.mark_phone_verified(user.id).unwrap());
        assert!(matches!(db.mark_phone_verified(424242), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_due_schedules_skip_unverified_users() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        let later = Utc::now() + Duration::days(400);
        assert!(db.due_schedules(later, later - Duration::hours(24)).unwrap().is_empty());

        db.mark_phone_verified(user.id).unwrap();
        assert!(!db.due_schedules(later, later - Duration::hours(24)).unwrap().is_empty());
    }

    #[test]
    fn test_open_adds_verification_columns_to_old_users_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.db");
        {
            let mut conn = SqliteConnection::establish(&path.to_string_lossy()).unwrap();
            conn.batch_execute(
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                    phone TEXT NOT NULL UNIQUE,
                    email TEXT,
                    subscription_tier TEXT NOT NULL DEFAULT 'free',
                    timezone TEXT NOT NULL DEFAULT 'UTC',
                    location TEXT,
                    is_active BOOLEAN NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    deleted_at TEXT
                );
                INSERT INTO users (phone, created_at) VALUES ('+15551234567', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let user = db.find_user_by_phone("+15551234567", "+1").unwrap().unwrap();
        assert!(user.phone_verified, "existing users are grandfathered in");

        let fresh = db.create_user(&UserSignup::with_phone("+15559876543")).unwrap();
        assert!(!fresh.phone_verified);
    }

    #[test]
    fn test_sms_log_roundtrip() {
        let (_dir, db) = seeded_db();
        db.record_sms(&SmsRecord {
            direction: "inbound",
            phone: "+15551234567",
            body: "watered Spike",
            status: "received",
            provider: None,
            provider_message_id: None,
            error: None,
        })
        .unwrap();
        let rows = db.recent_sms(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body, "watered Spike");
    }
}
