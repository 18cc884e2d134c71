//! Core record model shared by the resolution and enrichment stages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "reel-core";

/// Department label used for the cast table.
pub const CAST_DEPARTMENT: &str = "Cast";

/// Anything that carries the cross-run dedup key.
pub trait Keyed {
    fn uuid(&self) -> &str;
}

/// One catalog entry as produced by the upstream ETL step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub uuid: String,
    pub title: String,
    pub clean_title: String,
    pub runtime_seconds: u64,
    #[serde(default)]
    pub release_date: Option<String>,
    /// Raw source columns carried through untouched.
    #[serde(flatten)]
    pub source_fields: Map<String, JsonValue>,
}

impl CatalogRecord {
    pub fn new(uuid: impl Into<String>, title: impl Into<String>, runtime_seconds: u64) -> Self {
        let title = title.into();
        Self {
            uuid: uuid.into(),
            clean_title: title.clone(),
            title,
            runtime_seconds,
            release_date: None,
            source_fields: Map::new(),
        }
    }

    /// Year prefix of `release_date` (`"2021-03-04"` -> `"2021"`).
    pub fn release_year(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .and_then(|date| date.split('-').next())
            .map(str::trim)
            .filter(|year| !year.is_empty())
    }
}

impl Keyed for CatalogRecord {
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// A catalog record after one search attempt. `external_id` is `None` when the
/// search ran but produced no acceptable match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRecord {
    #[serde(flatten)]
    pub catalog: CatalogRecord,
    pub external_id: Option<String>,
}

impl ResolvedRecord {
    pub fn new(catalog: CatalogRecord, external_id: Option<String>) -> Self {
        Self {
            catalog,
            external_id,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.external_id.is_some()
    }
}

impl Keyed for ResolvedRecord {
    fn uuid(&self) -> &str {
        &self.catalog.uuid
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scores {
    pub popularity: Option<String>,
    pub avg_rating: Option<String>,
    pub num_ratings: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrewMember {
    pub name: String,
    pub id: String,
    pub role: String,
    /// Only populated for members of the cast department.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<Character>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub department: String,
    pub members: Vec<CrewMember>,
}

/// Credited people grouped by department, cast first when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crew {
    pub departments: Vec<Department>,
}

impl Crew {
    pub fn department(&self, name: &str) -> Option<&Department> {
        self.departments.iter().find(|d| d.department == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub id: String,
}

/// Company credits by category. A category with no extracted entries is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Companies {
    pub production: Option<Vec<Company>>,
    pub distribution: Option<Vec<Company>>,
    pub effects: Option<Vec<Company>>,
    pub other: Option<Vec<Company>>,
}

impl Companies {
    pub fn is_empty(&self) -> bool {
        self.production.is_none()
            && self.distribution.is_none()
            && self.effects.is_none()
            && self.other.is_none()
    }

    pub fn total(&self) -> usize {
        [
            &self.production,
            &self.distribution,
            &self.effects,
            &self.other,
        ]
        .into_iter()
        .flatten()
        .map(Vec::len)
        .sum()
    }
}

/// Descriptive data merged from the four detail pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
    pub scores: Scores,
    pub crew: Crew,
    pub companies: Companies,
}

// `enrichment` is declared first so its keys are claimed before the catalog's
// catch-all `source_fields` map sees the remaining entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub enrichment: Enrichment,
    #[serde(flatten)]
    pub resolved: ResolvedRecord,
}

impl EnrichedRecord {
    pub fn new(resolved: ResolvedRecord, enrichment: Enrichment) -> Self {
        Self {
            resolved,
            enrichment,
        }
    }
}

impl Keyed for EnrichedRecord {
    fn uuid(&self) -> &str {
        self.resolved.uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_record_keeps_source_fields() {
        let line = r#"{"uuid":"ttf000000001","title":"Glass Onion","cleanTitle":"Glass Onion","runtimeSeconds":8340,"releaseDate":"2022-12-23","hoursViewed":1000,"availGlobal":true}"#;
        let record: CatalogRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.release_year(), Some("2022"));
        assert_eq!(record.source_fields.get("hoursViewed"), Some(&JsonValue::from(1000)));
        assert!(!record.source_fields.contains_key("uuid"));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["availGlobal"], JsonValue::Bool(true));
    }

    #[test]
    fn resolved_record_serializes_null_external_id() {
        let resolved = ResolvedRecord::new(CatalogRecord::new("ttf1", "Nope", 60), None);
        let value = serde_json::to_value(&resolved).unwrap();
        assert_eq!(value["uuid"], "ttf1");
        assert!(value["externalId"].is_null());

        let parsed: ResolvedRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, resolved);
    }

    #[test]
    fn empty_company_categories_serialize_as_null() {
        let enriched = EnrichedRecord::new(
            ResolvedRecord::new(CatalogRecord::new("ttf2", "Heat", 10200), Some("tt0113277".into())),
            Enrichment::default(),
        );
        let value = serde_json::to_value(&enriched).unwrap();
        assert!(value["companies"]["production"].is_null());
        assert_eq!(value["genres"], serde_json::json!([]));
        assert_eq!(value["externalId"], "tt0113277");
        assert_eq!(enriched.uuid(), "ttf2");
    }

    #[test]
    fn enriched_record_reads_back_without_leaking_into_source_fields() {
        let mut enrichment = Enrichment::default();
        enrichment.genres = vec!["Crime".into(), "Drama".into()];
        enrichment.description = Some("A heist crew is hunted.".into());
        let enriched = EnrichedRecord::new(
            ResolvedRecord::new(CatalogRecord::new("ttf3", "Heat", 10200), Some("tt0113277".into())),
            enrichment,
        );
        let line = serde_json::to_string(&enriched).unwrap();
        let parsed: EnrichedRecord = serde_json::from_str(&line).unwrap();
        assert!(parsed.resolved.catalog.source_fields.is_empty());
        assert_eq!(parsed, enriched);
    }
}
