use std::sync::Arc;

use async_trait::async_trait;
use reel_adapters::{extract_search_candidate, SearchCandidate, SourceEndpoints};
use reel_core::{CatalogRecord, ResolvedRecord};
use reel_storage::PageFetcher;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::{MatchThresholds, UnresolvedPolicy};
use crate::scheduler::{ItemStatus, Processed, Stage, StageWorker};

/// Normalized edit similarity of two titles, case-insensitive, in `[0, 1]`.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - strsim::levenshtein(&a, &b) as f64 / longest as f64
}

/// `|a - b| / max(a, b)`; two zero runtimes are identical.
pub fn runtime_relative_difference(a: u64, b: u64) -> f64 {
    let longest = a.max(b);
    if longest == 0 {
        return 0.0;
    }
    a.abs_diff(b) as f64 / longest as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchAssessment {
    pub similarity: f64,
    pub runtime_difference: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    TitleMismatch { similarity: f64 },
    RuntimeMismatch { runtime_difference: f64 },
}

impl MatchAssessment {
    pub fn of(title: &str, runtime_seconds: u64, candidate: &SearchCandidate) -> Self {
        Self {
            similarity: title_similarity(title, &candidate.title),
            runtime_difference: runtime_relative_difference(runtime_seconds, candidate.runtime_seconds),
        }
    }

    /// Both checks must pass; title is reported first when both fail.
    pub fn verdict(&self, thresholds: &MatchThresholds) -> Result<(), RejectReason> {
        if self.similarity < thresholds.min_title_similarity {
            return Err(RejectReason::TitleMismatch {
                similarity: self.similarity,
            });
        }
        if self.runtime_difference > thresholds.max_runtime_difference {
            return Err(RejectReason::RuntimeMismatch {
                runtime_difference: self.runtime_difference,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Matched {
        candidate: SearchCandidate,
        assessment: MatchAssessment,
    },
    NoResult,
    Rejected {
        candidate: SearchCandidate,
        reason: RejectReason,
    },
    FetchFailed(String),
    ExtractFailed(String),
}

impl ResolveOutcome {
    pub fn external_id(&self) -> Option<&str> {
        match self {
            ResolveOutcome::Matched { candidate, .. } => Some(&candidate.external_id),
            _ => None,
        }
    }
}

/// Searches the reference database for a title and validates the first hit.
pub struct IdentityResolver {
    fetcher: Arc<dyn PageFetcher>,
    endpoints: SourceEndpoints,
    thresholds: MatchThresholds,
}

impl IdentityResolver {
    pub fn new(fetcher: Arc<dyn PageFetcher>, endpoints: SourceEndpoints, thresholds: MatchThresholds) -> Self {
        Self {
            fetcher,
            endpoints,
            thresholds,
        }
    }

    /// Never fails: every failure mode collapses into a non-matching outcome.
    /// The release year is carried for diagnostics and not used in validation.
    pub async fn resolve(&self, title: &str, runtime_seconds: u64, release_year: Option<&str>) -> ResolveOutcome {
        let url = self.endpoints.search_url(title);
        let html = match self.fetcher.fetch_html(&url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(title, error = %err, "search fetch failed");
                return ResolveOutcome::FetchFailed(err.to_string());
            }
        };

        let candidate = match extract_search_candidate(&html) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!(title, "search returned no results");
                return ResolveOutcome::NoResult;
            }
            Err(err) => {
                warn!(title, error = %err, "search page could not be parsed");
                return ResolveOutcome::ExtractFailed(err.to_string());
            }
        };

        let assessment = MatchAssessment::of(title, runtime_seconds, &candidate);
        match assessment.verdict(&self.thresholds) {
            Ok(()) => {
                debug!(
                    title,
                    external_id = %candidate.external_id,
                    similarity = assessment.similarity,
                    "search candidate accepted"
                );
                ResolveOutcome::Matched {
                    candidate,
                    assessment,
                }
            }
            Err(reason) => {
                debug!(
                    title,
                    candidate = %candidate.title,
                    candidate_year = candidate.release_year.as_deref().unwrap_or("-"),
                    catalog_year = release_year.unwrap_or("-"),
                    ?reason,
                    "search candidate rejected"
                );
                ResolveOutcome::Rejected { candidate, reason }
            }
        }
    }
}

/// Resolution stage: catalog record in, record with `externalId` (or null) out.
pub struct ResolutionWorker {
    resolver: IdentityResolver,
    policy: UnresolvedPolicy,
}

impl ResolutionWorker {
    pub fn new(resolver: IdentityResolver, policy: UnresolvedPolicy) -> Self {
        Self { resolver, policy }
    }
}

fn search_title(record: &CatalogRecord) -> &str {
    if record.clean_title.trim().is_empty() {
        &record.title
    } else {
        &record.clean_title
    }
}

#[async_trait]
impl StageWorker for ResolutionWorker {
    type Input = CatalogRecord;
    type Output = ResolvedRecord;

    fn stage(&self) -> Stage {
        Stage::Resolution
    }

    fn counts_as_done(&self, entry: &JsonValue) -> bool {
        match self.policy {
            UnresolvedPolicy::SkipPermanently => true,
            UnresolvedPolicy::Retry => entry
                .get("externalId")
                .is_some_and(|id| !id.is_null()),
        }
    }

    async fn process(&self, input: CatalogRecord) -> Processed<ResolvedRecord> {
        let span = info_span!("resolve", uuid = %input.uuid);
        let outcome = self
            .resolver
            .resolve(search_title(&input), input.runtime_seconds, input.release_year())
            .instrument(span)
            .await;
        let external_id = outcome.external_id().map(str::to_string);
        let status = if external_id.is_some() {
            ItemStatus::Succeeded
        } else {
            ItemStatus::Unresolved
        };
        Processed {
            record: ResolvedRecord::new(input, external_id),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureFetcher;

    const MATRIX_SEARCH: &str = include_str!("../../../fixtures/imdb/search_the_matrix.html");
    const EMPTY_SEARCH: &str = include_str!("../../../fixtures/imdb/search_empty.html");

    fn candidate(title: &str, runtime_seconds: u64) -> SearchCandidate {
        SearchCandidate {
            external_id: "tt0000001".into(),
            title: title.into(),
            release_year: None,
            runtime_text: String::new(),
            runtime_seconds,
        }
    }

    fn resolver(fetcher: FixtureFetcher) -> IdentityResolver {
        IdentityResolver::new(Arc::new(fetcher), SourceEndpoints::default(), MatchThresholds::default())
    }

    #[test]
    fn similarity_is_case_insensitive_and_bounded() {
        assert_eq!(title_similarity("The Matrix", "the matrix"), 1.0);
        assert_eq!(title_similarity("", ""), 1.0);
        assert_eq!(title_similarity("abc", ""), 0.0);
        let partial = title_similarity("The Matrix", "The Matrix Reloaded");
        assert!((partial - 10.0 / 19.0).abs() < 1e-9);
    }

    #[test]
    fn runtime_difference_is_relative_to_longer() {
        assert_eq!(runtime_relative_difference(0, 0), 0.0);
        assert_eq!(runtime_relative_difference(100, 0), 1.0);
        assert!((runtime_relative_difference(8160, 7200) - 960.0 / 8160.0).abs() < 1e-9);
    }

    #[test]
    fn runtime_check_passes_regardless_of_title() {
        let assessment = MatchAssessment::of("Zodiac", 7200, &candidate("Something Else Entirely", 6600));
        assert!((assessment.runtime_difference - 600.0 / 7200.0).abs() < 1e-9);
        assert!(assessment.runtime_difference <= MatchThresholds::default().max_runtime_difference);
        assert!(matches!(
            assessment.verdict(&MatchThresholds::default()),
            Err(RejectReason::TitleMismatch { .. })
        ));
    }

    #[test]
    fn verdict_requires_both_checks() {
        let thresholds = MatchThresholds::default();
        assert!(MatchAssessment::of("The Matrix", 8160, &candidate("The Matrix", 8160))
            .verdict(&thresholds)
            .is_ok());
        assert!(matches!(
            MatchAssessment::of("The Matrix", 8160, &candidate("The Matrix Reloaded", 8280))
                .verdict(&thresholds),
            Err(RejectReason::TitleMismatch { .. })
        ));
        assert!(matches!(
            MatchAssessment::of("The Matrix", 8160, &candidate("The Matrix", 5400))
                .verdict(&thresholds),
            Err(RejectReason::RuntimeMismatch { .. })
        ));
        // 20% exactly is still accepted
        assert!(MatchAssessment::of("Heat", 10000, &candidate("Heat", 8000))
            .verdict(&thresholds)
            .is_ok());
    }

    #[tokio::test]
    async fn resolves_first_result_when_close() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new().page(endpoints.search_url("The Matrix"), MATRIX_SEARCH);
        let outcome = resolver(fetcher).resolve("The Matrix", 8100, Some("1999")).await;
        assert_eq!(outcome.external_id(), Some("tt0133093"));
    }

    #[tokio::test]
    async fn rejects_first_result_with_distant_runtime() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new().page(endpoints.search_url("The Matrix"), MATRIX_SEARCH);
        let outcome = resolver(fetcher).resolve("The Matrix", 3600, None).await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Rejected {
                reason: RejectReason::RuntimeMismatch { .. },
                ..
            }
        ));
        assert_eq!(outcome.external_id(), None);
    }

    #[tokio::test]
    async fn empty_results_and_fetch_errors_are_unresolved() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new().page(endpoints.search_url("Nothing Here"), EMPTY_SEARCH);
        let resolver = resolver(fetcher);
        assert_eq!(resolver.resolve("Nothing Here", 5400, None).await, ResolveOutcome::NoResult);
        assert!(matches!(
            resolver.resolve("Offline", 5400, None).await,
            ResolveOutcome::FetchFailed(_)
        ));
    }

    #[tokio::test]
    async fn worker_marks_status_from_outcome() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new().page(endpoints.search_url("The Matrix"), MATRIX_SEARCH);
        let worker = ResolutionWorker::new(resolver(fetcher), UnresolvedPolicy::SkipPermanently);

        let hit = worker.process(CatalogRecord::new("ttf1", "The Matrix", 8160)).await;
        assert_eq!(hit.status, ItemStatus::Succeeded);
        assert_eq!(hit.record.external_id.as_deref(), Some("tt0133093"));

        let miss = worker.process(CatalogRecord::new("ttf2", "Unknown", 100)).await;
        assert_eq!(miss.status, ItemStatus::Unresolved);
        assert!(miss.record.external_id.is_none());
    }

    #[test]
    fn retry_policy_only_counts_resolved_entries_as_done() {
        let worker = ResolutionWorker::new(resolver(FixtureFetcher::new()), UnresolvedPolicy::Retry);
        assert!(worker.counts_as_done(&serde_json::json!({"uuid": "a", "externalId": "tt1"})));
        assert!(!worker.counts_as_done(&serde_json::json!({"uuid": "b", "externalId": null})));

        let strict = ResolutionWorker::new(resolver(FixtureFetcher::new()), UnresolvedPolicy::SkipPermanently);
        assert!(strict.counts_as_done(&serde_json::json!({"uuid": "b", "externalId": null})));
    }
}
