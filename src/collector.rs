use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::CollectError;
use crate::filters::{FilterQuery, FilterState, ScopeConstraint};
use crate::models::{Completeness, EvaluationRecord, PartialReason};
use crate::service::{EvaluationService, PageRequest, RecordPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Bulk,
    Iterative { pages: usize },
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub records: Vec<EvaluationRecord>,
    pub completeness: Completeness,
    pub strategy: Strategy,
}

pub struct Collector {
    service: Arc<dyn EvaluationService>,
    scope: Option<ScopeConstraint>,
    config: PipelineConfig,
}

impl Collector {
    pub fn new(
        service: Arc<dyn EvaluationService>,
        scope: Option<ScopeConstraint>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            service,
            scope,
            config,
        }
    }

    pub fn scope(&self) -> Option<&ScopeConstraint> {
        self.scope.as_ref()
    }

    /// Query sent to the service: the facet selection plus the scope constraint.
    pub fn query_for(&self, filters: &FilterState) -> FilterQuery {
        let mut query = filters.to_query();
        if let Some(scope) = &self.scope {
            scope.apply(&mut query);
        }
        query
    }

    pub async fn collect(&self, filters: &FilterState) -> Result<Collection, CollectError> {
        let query = self.query_for(filters);

        match self.service.fetch_records(&query, None).await {
            Ok(page) if !page.records.is_empty() => {
                let mut accepted = Accepted::default();
                let kept = accepted.extend(self, filters, page.records);
                info!(kept, "bulk collection accepted");
                return Ok(Collection {
                    records: accepted.records,
                    completeness: Completeness::Complete,
                    strategy: Strategy::Bulk,
                });
            }
            Ok(_) => debug!("bulk collection returned no records, switching to pages"),
            Err(err) => warn!(error = %err, "bulk collection failed, switching to pages"),
        }

        self.collect_pages(filters, &query).await
    }

    async fn collect_pages(
        &self,
        filters: &FilterState,
        query: &FilterQuery,
    ) -> Result<Collection, CollectError> {
        let mut accepted = Accepted::default();
        let mut completeness = Completeness::Complete;
        let mut page_number = 1;

        loop {
            if page_number > 1 {
                tokio::time::sleep(self.config.page_delay).await;
            }

            let request = PageRequest {
                page: page_number,
                page_size: self.config.page_size,
            };
            let RecordPage { records, next, count } =
                match self.service.fetch_records(query, Some(request)).await {
                    Ok(page) => page,
                    Err(err) if page_number == 1 => return Err(CollectError::FirstPageFailed(err)),
                    Err(err) => {
                        warn!(page = page_number, error = %err, "page request failed, keeping earlier pages");
                        completeness = Completeness::Partial {
                            reason: PartialReason::PageFailed {
                                page: page_number,
                                error: err.to_string(),
                            },
                        };
                        page_number -= 1;
                        break;
                    }
                };

            let full_page = records.len() == self.config.page_size;
            let kept = accepted.extend(self, filters, records);
            debug!(page = page_number, kept, reported_total = ?count, "page collected");

            if next.is_none() || !full_page {
                break;
            }
            if page_number >= self.config.max_pages {
                warn!(pages = page_number, "page ceiling reached, treating collected records as final");
                completeness = Completeness::Partial {
                    reason: PartialReason::PageCeiling { pages: page_number },
                };
                break;
            }
            page_number += 1;
        }

        info!(
            pages = page_number,
            records = accepted.records.len(),
            %completeness,
            "iterative collection finished"
        );
        Ok(Collection {
            records: accepted.records,
            completeness,
            strategy: Strategy::Iterative { pages: page_number },
        })
    }

    fn admits(&self, filters: &FilterState, record: &EvaluationRecord) -> bool {
        self.scope.as_ref().map_or(true, |scope| scope.permits(record)) && filters.matches(record)
    }
}

/// Records kept so far, deduplicated on (household, evaluation month).
#[derive(Default)]
struct Accepted {
    records: Vec<EvaluationRecord>,
    seen: HashSet<(String, i32)>,
}

impl Accepted {
    fn extend(
        &mut self,
        collector: &Collector,
        filters: &FilterState,
        records: Vec<EvaluationRecord>,
    ) -> usize {
        let before = self.records.len();
        for record in records {
            if !collector.admits(filters, &record) {
                continue;
            }
            if self
                .seen
                .insert((record.household_id.clone(), record.evaluation_month))
            {
                self.records.push(record);
            }
        }
        self.records.len() - before
    }
}
