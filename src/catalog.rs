//! Plant catalog: care requirements, seed records and seeding
//!
//! The catalog is reference data imported from a house-plant dataset. Each
//! raw record is reduced to a [`CareRequirements`] blob using a handful of
//! keyword rules over its free-text watering and light descriptions.

use crate::db::{Database, DbError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

const BUNDLED_SEED: &str = include_str!("../data/house_plants.json");

/// Source label recorded for the dataset compiled into the binary
pub const BUNDLED_SOURCE: &str = "bundled:house_plants.json";

/// Care needs stored as JSON on each catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CareRequirements {
    pub watering_frequency_days: i32,
    pub fertilizing_frequency_days: Option<i32>,
    pub light_level: String,
    pub humidity_level: String,
    pub ideal_temp_min: Option<f64>,
    pub ideal_temp_max: Option<f64>,
    pub climate: String,
    pub original_watering_text: Option<String>,
    pub original_light_text: Option<String>,
}

impl Default for CareRequirements {
    fn default() -> Self {
        Self {
            watering_frequency_days: 7,
            fertilizing_frequency_days: Some(30),
            light_level: "medium".to_string(),
            humidity_level: "medium".to_string(),
            ideal_temp_min: None,
            ideal_temp_max: None,
            climate: String::new(),
            original_watering_text: None,
            original_light_text: None,
        }
    }
}

impl CareRequirements {
    /// One-line summary used in prompts ("water every 7 days, bright light")
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("water every {} days", self.watering_frequency_days)];
        if let Some(days) = self.fertilizing_frequency_days {
            parts.push(format!("fertilize every {} days", days));
        }
        parts.push(format!("{} light", self.light_level));
        parts.push(format!("{} humidity", self.humidity_level));
        if let (Some(min), Some(max)) = (self.ideal_temp_min, self.ideal_temp_max) {
            parts.push(format!("{}-{}°C", min, max));
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Temperature {
    #[serde(default)]
    pub celsius: f64,
}

/// One raw record of the house-plant dataset
#[derive(Debug, Clone, Deserialize)]
pub struct SeedPlant {
    pub latin: String,
    #[serde(default)]
    pub common: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub climate: String,
    #[serde(default)]
    pub ideallight: String,
    #[serde(default)]
    pub toleratedlight: String,
    #[serde(default)]
    pub watering: String,
    #[serde(default)]
    pub tempmin: Temperature,
    #[serde(default)]
    pub tempmax: Temperature,
}

/// A catalog row ready to insert
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub name: String,
    pub species: String,
    pub category: String,
    pub requirements: CareRequirements,
    pub difficulty: &'static str,
    pub description: Option<String>,
}

impl SeedPlant {
    pub fn display_name(&self) -> &str {
        self.common
            .first()
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.latin)
    }

    pub fn to_record(&self) -> CatalogRecord {
        let watering_days = parse_watering_frequency(&self.watering);
        let requirements = CareRequirements {
            watering_frequency_days: watering_days,
            fertilizing_frequency_days: Some(fertilizing_frequency(&self.category)),
            light_level: parse_light_level(&self.ideallight, &self.toleratedlight).to_string(),
            humidity_level: humidity_level(&self.category, &self.climate).to_string(),
            ideal_temp_min: Some(self.tempmin.celsius),
            ideal_temp_max: Some(self.tempmax.celsius),
            climate: self.climate.clone(),
            original_watering_text: Some(self.watering.clone()).filter(|s| !s.is_empty()),
            original_light_text: Some(self.ideallight.clone()).filter(|s| !s.is_empty()),
        };

        let description = if self.origin.is_empty() {
            format!("{} plant. {}", self.category, self.watering)
        } else {
            format!("{} plant from {}. {}", self.category, self.origin, self.watering)
        };

        CatalogRecord {
            name: self.display_name().to_string(),
            species: self.latin.clone(),
            category: self.category.clone(),
            requirements,
            difficulty: determine_difficulty(&self.category, &self.watering, &self.ideallight),
            description: Some(description.trim().to_string()),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Estimate a watering interval in days from free text
pub fn parse_watering_frequency(text: &str) -> i32 {
    let lower = text.to_lowercase();

    // "must not be dry" describes a thirsty plant, not a dry-loving one
    if lower.contains("not be dry") {
        return 3;
    }
    if contains_any(&lower, &["dry", "drought", "succulent", "cactus"]) {
        14
    } else if contains_any(&lower, &["moist", "wet", "water frequently"]) {
        3
    } else if lower.contains("week") {
        7
    } else if contains_any(&lower, &["regularly", "normal", "moderate"]) {
        5
    } else {
        7
    }
}

/// Reduce ideal and tolerated light descriptions to low, medium or bright
pub fn parse_light_level(ideal: &str, tolerated: &str) -> &'static str {
    let combined = format!("{} {}", ideal, tolerated).to_lowercase();

    if combined.contains("direct sunlight") || combined.contains("6 or more hours") {
        "bright"
    } else if combined.contains("bright") {
        "medium"
    } else if combined.contains("low") || combined.contains("shade") {
        "low"
    } else {
        "medium"
    }
}

pub fn determine_difficulty(category: &str, watering: &str, light: &str) -> &'static str {
    let category = category.to_lowercase();
    if matches!(category.as_str(), "cactus and succulent" | "succulent" | "cactus") {
        return "easy";
    }
    if matches!(category.as_str(), "fern" | "orchid" | "bonsai") {
        return "hard";
    }
    if light.to_lowercase().contains("direct sunlight") || watering.to_lowercase().contains("dry") {
        return "easy";
    }
    "medium"
}

pub fn humidity_level(category: &str, climate: &str) -> &'static str {
    let category = category.to_lowercase();
    if category.contains("fern") || climate.to_lowercase().contains("humid") {
        "high"
    } else if is_succulent(&category) {
        "low"
    } else {
        "medium"
    }
}

pub fn fertilizing_frequency(category: &str) -> i32 {
    if is_succulent(&category.to_lowercase()) {
        90
    } else {
        30
    }
}

fn is_succulent(category_lower: &str) -> bool {
    category_lower.contains("succulent") || category_lower.contains("cactus")
}

// ============================================================================
// Seeding
// ============================================================================

/// Error type for catalog seeding
#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Db(DbError),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "Failed to read seed file: {}", e),
            CatalogError::Parse(e) => write!(f, "Invalid seed data: {}", e),
            CatalogError::Db(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(e: std::io::Error) -> Self {
        CatalogError::Io(e)
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Parse(e)
    }
}

impl From<DbError> for CatalogError {
    fn from(e: DbError) -> Self {
        CatalogError::Db(e)
    }
}

/// Outcome of a seeding run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub source: String,
    pub content_hash: String,
    pub total: usize,
    pub inserted: usize,
    pub existing: usize,
    /// True when this exact content was imported before
    pub skipped: bool,
}

/// The dataset compiled into the binary
pub fn bundled_seed() -> &'static str {
    BUNDLED_SEED
}

pub fn parse_seed(contents: &str) -> Result<Vec<SeedPlant>, CatalogError> {
    Ok(serde_json::from_str(contents)?)
}

pub fn parse_seed_file<P: AsRef<Path>>(path: P) -> Result<(String, Vec<SeedPlant>), CatalogError> {
    let contents = std::fs::read_to_string(path)?;
    let plants = parse_seed(&contents)?;
    Ok((contents, plants))
}

pub fn content_hash(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Import a dataset into the catalog
///
/// Idempotent twice over: identical content (by SHA-256) is skipped
/// entirely, and species already present are left untouched.
pub fn seed_catalog(db: &Database, source: &str, contents: &str) -> Result<SeedReport, CatalogError> {
    let hash = content_hash(contents);
    let mut report = SeedReport {
        source: source.to_string(),
        content_hash: hash.clone(),
        ..Default::default()
    };

    if db.seed_run_exists(&hash)? {
        info!(source, hash = %&hash[..12], "seed content already imported");
        report.skipped = true;
        return Ok(report);
    }

    let plants = parse_seed(contents)?;
    report.total = plants.len();

    for plant in &plants {
        if plant.latin.trim().is_empty() {
            debug!("skipping seed record without a latin name");
            continue;
        }
        let (_, inserted) = db.insert_catalog_entry(&plant.to_record())?;
        if inserted {
            report.inserted += 1;
        } else {
            report.existing += 1;
        }
    }

    db.record_seed_run(source, &hash, report.inserted as i32)?;
    info!(
        source,
        inserted = report.inserted,
        existing = report.existing,
        "catalog seeded"
    );
    Ok(report)
}
