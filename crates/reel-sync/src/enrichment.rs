use std::sync::Arc;

use async_trait::async_trait;
use reel_adapters::{
    extract_companies, extract_crew, extract_details, extract_ratings, DetailPage, ExtractError,
    SourceEndpoints,
};
use reel_core::{EnrichedRecord, Enrichment, ResolvedRecord, Scores};
use reel_storage::PageFetcher;
use tracing::{info_span, warn, Instrument};

use crate::scheduler::{ItemStatus, Processed, Stage, StageWorker};

/// Result of one detail-page fetch. A degraded sub-fetch still yields a value
/// so the record can be assembled.
#[derive(Debug, Clone, PartialEq)]
pub enum SubFetchOutcome<T> {
    Complete(T),
    Degraded { fallback: T, reason: String },
}

impl<T> SubFetchOutcome<T> {
    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            SubFetchOutcome::Complete(_) => None,
            SubFetchOutcome::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn into_value(self) -> T {
        match self {
            SubFetchOutcome::Complete(value) => value,
            SubFetchOutcome::Degraded { fallback, .. } => fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentReport {
    pub enrichment: Enrichment,
    pub degraded: Vec<(DetailPage, String)>,
}

impl EnrichmentReport {
    pub fn is_complete(&self) -> bool {
        self.degraded.is_empty()
    }
}

/// Fetches the four detail pages of an identifier concurrently and merges them.
pub struct EnrichmentAggregator {
    fetcher: Arc<dyn PageFetcher>,
    endpoints: SourceEndpoints,
}

impl EnrichmentAggregator {
    pub fn new(fetcher: Arc<dyn PageFetcher>, endpoints: SourceEndpoints) -> Self {
        Self { fetcher, endpoints }
    }

    pub async fn enrich(&self, external_id: &str) -> EnrichmentReport {
        let (details, ratings, crew, companies) = tokio::join!(
            self.fetch_page(DetailPage::Details, external_id, extract_details),
            self.fetch_page(DetailPage::Ratings, external_id, extract_ratings),
            self.fetch_page(DetailPage::Crew, external_id, extract_crew),
            self.fetch_page(DetailPage::Companies, external_id, extract_companies),
        );

        let mut degraded = Vec::new();
        for (page, reason) in [
            (DetailPage::Details, details.degraded_reason()),
            (DetailPage::Ratings, ratings.degraded_reason()),
            (DetailPage::Crew, crew.degraded_reason()),
            (DetailPage::Companies, companies.degraded_reason()),
        ] {
            if let Some(reason) = reason {
                degraded.push((page, reason.to_string()));
            }
        }

        let details = details.into_value();
        let ratings = ratings.into_value();
        let enrichment = Enrichment {
            description: details.description,
            genres: details.genres,
            image_url: details.image_url,
            scores: Scores {
                popularity: details.popularity,
                avg_rating: ratings.avg_rating,
                num_ratings: ratings.num_ratings,
            },
            crew: crew.into_value(),
            companies: companies.into_value(),
        };
        EnrichmentReport {
            enrichment,
            degraded,
        }
    }

    async fn fetch_page<T: Default>(
        &self,
        page: DetailPage,
        external_id: &str,
        extract: fn(&str) -> Result<T, ExtractError>,
    ) -> SubFetchOutcome<T> {
        let url = self.endpoints.page_url(page, external_id);
        let reason = match self.fetcher.fetch_html(&url).await {
            Ok(html) => match extract(&html) {
                Ok(value) => return SubFetchOutcome::Complete(value),
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };
        warn!(external_id, page = %page, %reason, "detail page degraded to empty default");
        SubFetchOutcome::Degraded {
            fallback: T::default(),
            reason,
        }
    }
}

/// Enrichment stage: resolved record in, enriched record out.
pub struct EnrichmentWorker {
    aggregator: EnrichmentAggregator,
}

impl EnrichmentWorker {
    pub fn new(aggregator: EnrichmentAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl StageWorker for EnrichmentWorker {
    type Input = ResolvedRecord;
    type Output = EnrichedRecord;

    fn stage(&self) -> Stage {
        Stage::Enrichment
    }

    async fn process(&self, input: ResolvedRecord) -> Processed<EnrichedRecord> {
        let Some(external_id) = input.external_id.clone() else {
            warn!(uuid = %input.catalog.uuid, "record has no external id; writing empty enrichment");
            return Processed {
                record: EnrichedRecord::new(input, Enrichment::default()),
                status: ItemStatus::Unresolved,
            };
        };

        let span = info_span!("enrich", uuid = %input.catalog.uuid, %external_id);
        let report = self.aggregator.enrich(&external_id).instrument(span).await;
        let status = if report.is_complete() {
            ItemStatus::Succeeded
        } else {
            ItemStatus::Degraded
        };
        Processed {
            record: EnrichedRecord::new(input, report.enrichment),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureFetcher;
    use reel_core::{CatalogRecord, CAST_DEPARTMENT};

    const DETAILS: &str = include_str!("../../../fixtures/imdb/title_details.html");
    const RATINGS: &str = include_str!("../../../fixtures/imdb/ratings.html");
    const CREDITS: &str = include_str!("../../../fixtures/imdb/fullcredits.html");
    const COMPANIES: &str = include_str!("../../../fixtures/imdb/companycredits.html");

    const MATRIX: &str = "tt0133093";

    fn full_fetcher(endpoints: &SourceEndpoints) -> FixtureFetcher {
        FixtureFetcher::new()
            .page(endpoints.page_url(DetailPage::Details, MATRIX), DETAILS)
            .page(endpoints.page_url(DetailPage::Ratings, MATRIX), RATINGS)
            .page(endpoints.page_url(DetailPage::Crew, MATRIX), CREDITS)
            .page(endpoints.page_url(DetailPage::Companies, MATRIX), COMPANIES)
    }

    #[tokio::test]
    async fn merges_all_four_pages() {
        let endpoints = SourceEndpoints::default();
        let aggregator = EnrichmentAggregator::new(Arc::new(full_fetcher(&endpoints)), endpoints);
        let report = aggregator.enrich(MATRIX).await;

        assert!(report.is_complete());
        let enrichment = report.enrichment;
        assert_eq!(enrichment.genres, vec!["Action".to_string(), "Sci-Fi".to_string()]);
        assert!(enrichment
            .description
            .as_deref()
            .is_some_and(|d| d.starts_with("When a beautiful stranger")));
        assert_eq!(enrichment.scores.avg_rating.as_deref(), Some("8.7"));
        assert_eq!(enrichment.scores.num_ratings.as_deref(), Some("2.1M"));
        assert_eq!(enrichment.scores.popularity.as_deref(), Some("112"));
        assert_eq!(enrichment.crew.departments[0].department, CAST_DEPARTMENT);
        assert_eq!(enrichment.companies.total(), 4);
    }

    #[tokio::test]
    async fn failed_sub_fetch_keeps_the_others() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new()
            .page(endpoints.page_url(DetailPage::Details, MATRIX), DETAILS)
            .page(endpoints.page_url(DetailPage::Ratings, MATRIX), "<html><body></body></html>")
            .page(endpoints.page_url(DetailPage::Companies, MATRIX), COMPANIES);
        let aggregator = EnrichmentAggregator::new(Arc::new(fetcher), endpoints);
        let report = aggregator.enrich(MATRIX).await;

        let pages: Vec<DetailPage> = report.degraded.iter().map(|(page, _)| *page).collect();
        assert_eq!(pages, vec![DetailPage::Ratings, DetailPage::Crew]);
        assert!(report.enrichment.crew.departments.is_empty());
        assert_eq!(report.enrichment.scores.avg_rating, None);
        assert_eq!(report.enrichment.scores.popularity.as_deref(), Some("112"));
        assert_eq!(report.enrichment.companies.total(), 4);
    }

    #[tokio::test]
    async fn worker_reports_degraded_records() {
        let endpoints = SourceEndpoints::default();
        let fetcher = FixtureFetcher::new().page(endpoints.page_url(DetailPage::Details, MATRIX), DETAILS);
        let worker = EnrichmentWorker::new(EnrichmentAggregator::new(Arc::new(fetcher), endpoints));
        let resolved = ResolvedRecord::new(CatalogRecord::new("ttf1", "The Matrix", 8160), Some(MATRIX.into()));

        let processed = worker.process(resolved).await;
        assert_eq!(processed.status, ItemStatus::Degraded);
        assert_eq!(processed.record.enrichment.genres.len(), 2);
        assert!(processed.record.enrichment.companies.is_empty());
    }

    #[tokio::test]
    async fn worker_skips_fetches_without_external_id() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let worker = EnrichmentWorker::new(EnrichmentAggregator::new(fetcher.clone(), SourceEndpoints::default()));
        let processed = worker
            .process(ResolvedRecord::new(CatalogRecord::new("ttf9", "Lost", 60), None))
            .await;
        assert_eq!(processed.status, ItemStatus::Unresolved);
        assert!(fetcher.requested().is_empty());
    }
}
