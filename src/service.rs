use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::ServiceError;
use crate::filters::{Facet, FilterQuery};
use crate::models::{EvaluationRecord, FilterOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<EvaluationRecord>,
    pub count: Option<u64>,
    /// Continuation marker; `None` means there is no following page.
    pub next: Option<String>,
}

#[async_trait]
pub trait EvaluationService: Send + Sync {
    /// `page = None` asks for everything in one response.
    async fn fetch_records(
        &self,
        query: &FilterQuery,
        page: Option<PageRequest>,
    ) -> Result<RecordPage, ServiceError>;

    async fn fetch_filter_options(&self, query: &FilterQuery) -> Result<FilterOptions, ServiceError>;
}

#[derive(Deserialize)]
struct RawPage {
    #[serde(default)]
    results: Option<Vec<EvaluationRecord>>,
    #[serde(default)]
    predictions: Option<Vec<EvaluationRecord>>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    next: Option<String>,
}

/// Decodes a records body. Bodies carrying neither `results` nor the legacy
/// `predictions` array yield zero records.
pub fn decode_page(url: &str, body: &[u8]) -> Result<RecordPage, ServiceError> {
    let raw: RawPage = serde_json::from_slice(body).map_err(|err| ServiceError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })?;

    let records = raw.results.or(raw.predictions).unwrap_or_default();
    Ok(RecordPage {
        records,
        count: raw.count,
        next: raw.next.filter(|next| !next.is_empty()),
    })
}

pub struct HttpEvaluationService {
    client: Client,
    base_url: String,
}

impl HttpEvaluationService {
    pub fn new(base_url: &str, config: &PipelineConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ServiceError::Transport {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Vec<u8>, ServiceError> {
        let url = format!("{}/{}/", self.base_url, path);
        debug!(%url, ?params, "requesting evaluation service");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ServiceError::Transport {
                url: url.clone(),
                source,
            })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl EvaluationService for HttpEvaluationService {
    async fn fetch_records(
        &self,
        query: &FilterQuery,
        page: Option<PageRequest>,
    ) -> Result<RecordPage, ServiceError> {
        let mut params = query.clone();
        if let Some(page) = page {
            params.push(("page".to_string(), page.page.to_string()));
            params.push(("page_size".to_string(), page.page_size.to_string()));
        }

        let body = self.get("standard-evaluations", &params).await?;
        decode_page(&format!("{}/standard-evaluations/", self.base_url), &body)
    }

    async fn fetch_filter_options(&self, query: &FilterQuery) -> Result<FilterOptions, ServiceError> {
        let url = format!("{}/filter-options/", self.base_url);
        let body = self.get("filter-options", query).await?;
        serde_json::from_slice(&body).map_err(|err| ServiceError::Decode {
            url,
            message: err.to_string(),
        })
    }
}

/// Serves an evaluation extract from a CSV file with the same column names as the API.
pub struct CsvEvaluationService {
    records: Vec<EvaluationRecord>,
}

impl CsvEvaluationService {
    pub fn from_path(csv_path: &Path) -> Result<Self, ServiceError> {
        let unavailable = |err: csv::Error| {
            ServiceError::Unavailable(format!("{}: {err}", csv_path.display()))
        };

        let mut reader = csv::Reader::from_path(csv_path).map_err(unavailable)?;
        let mut records = Vec::new();
        for result in reader.deserialize::<EvaluationRecord>() {
            records.push(result.map_err(unavailable)?);
        }

        debug!(count = records.len(), path = %csv_path.display(), "loaded evaluation extract");
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<EvaluationRecord>) -> Self {
        Self { records }
    }

    fn matching<'a>(&'a self, query: &'a FilterQuery) -> impl Iterator<Item = &'a EvaluationRecord> {
        let constraints: Vec<(Facet, BTreeSet<&str>)> = query
            .iter()
            .filter_map(|(name, values)| {
                let facet = name.parse::<Facet>().ok()?;
                Some((facet, values.split(',').map(str::trim).collect()))
            })
            .collect();

        self.records.iter().filter(move |record| {
            constraints
                .iter()
                .all(|(facet, values)| values.iter().any(|value| record.matches_facet(*facet, value)))
        })
    }
}

#[async_trait]
impl EvaluationService for CsvEvaluationService {
    async fn fetch_records(
        &self,
        query: &FilterQuery,
        page: Option<PageRequest>,
    ) -> Result<RecordPage, ServiceError> {
        let matching: Vec<EvaluationRecord> = self.matching(query).cloned().collect();
        let count = matching.len() as u64;

        let Some(page) = page else {
            return Ok(RecordPage {
                records: matching,
                count: Some(count),
                next: None,
            });
        };

        let start = page.page.saturating_sub(1).saturating_mul(page.page_size);
        let end = start.saturating_add(page.page_size).min(matching.len());
        let records = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < matching.len()).then(|| format!("page={}", page.page + 1));

        Ok(RecordPage {
            records,
            count: Some(count),
            next,
        })
    }

    async fn fetch_filter_options(&self, query: &FilterQuery) -> Result<FilterOptions, ServiceError> {
        let mut regions = BTreeSet::new();
        let mut districts = BTreeSet::new();
        let mut villages = BTreeSet::new();
        let mut clusters = BTreeSet::new();
        let mut cohorts = BTreeSet::new();
        let mut cycles = BTreeSet::new();
        let mut months = BTreeSet::new();

        for record in self.matching(query) {
            regions.insert(record.region.clone());
            districts.insert(record.district.clone());
            villages.insert(record.village.clone());
            clusters.insert(record.cluster.clone());
            cohorts.insert(record.cohort.clone());
            cycles.insert(record.cycle.clone());
            months.insert(record.evaluation_month);
        }

        Ok(FilterOptions {
            regions: regions.into_iter().collect(),
            districts: districts.into_iter().collect(),
            villages: villages.into_iter().collect(),
            clusters: clusters.into_iter().collect(),
            cohorts: cohorts.into_iter().collect(),
            cycles: cycles.into_iter().collect(),
            evaluation_months: months.into_iter().map(serde_json::Value::from).collect(),
        })
    }
}
