use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filters::{Facet, FilterState};

/// One household's evaluation outcome at one evaluation month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub household_id: String,
    pub cohort: String,
    pub cycle: String,
    pub region: String,
    pub district: String,
    pub cluster: String,
    pub village: String,
    pub evaluation_month: i32,
    pub achieved: u8,
    pub achievement_probability: f64,
    #[serde(default)]
    pub predicted_income: Option<f64>,
}

impl EvaluationRecord {
    /// Whether the record carries `value` on `facet`. Months compare by number, so `06` matches 6.
    pub fn matches_facet(&self, facet: Facet, value: &str) -> bool {
        let value = value.trim();
        match facet {
            Facet::Cohort => self.cohort == value,
            Facet::Cycle => self.cycle == value,
            Facet::EvaluationMonth => value
                .parse::<f64>()
                .is_ok_and(|month| month == f64::from(self.evaluation_month)),
            Facet::Region => self.region == value,
            Facet::District => self.district == value,
            Facet::Cluster => self.cluster == value,
            Facet::Village => self.village == value,
        }
    }

    pub fn income(&self) -> f64 {
        self.predicted_income.unwrap_or(0.0)
    }
}

/// Distinct facet values available under the current constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub districts: Vec<String>,
    #[serde(default)]
    pub villages: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub cohorts: Vec<String>,
    #[serde(default)]
    pub cycles: Vec<String>,
    #[serde(default)]
    pub evaluation_months: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub cluster: String,
    pub evaluation_month: i32,
    pub region: String,
    pub district: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub cluster: String,
    pub evaluation_month: i32,
    pub region: String,
    pub district: String,
    pub household_count: usize,
    pub avg_income: f64,
    pub achievement_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TrendSeries {
    Cluster(String),
    Overall,
}

impl TrendSeries {
    pub fn label(&self) -> &str {
        match self {
            TrendSeries::Cluster(name) => name,
            TrendSeries::Overall => "overall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendPoint {
    pub month: i32,
    pub value: f64,
}

/// Fitted line for one series. `start`/`end` span the observed month range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendModel {
    pub series: TrendSeries,
    pub slope: f64,
    pub intercept: f64,
    pub start: TrendPoint,
    pub end: TrendPoint,
    pub forecast: Option<TrendPoint>,
}

impl TrendModel {
    pub fn value_at(&self, month: i32) -> f64 {
        self.slope * f64::from(month) + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Partial { reason: PartialReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartialReason {
    PageCeiling { pages: usize },
    PageFailed { page: usize, error: String },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completeness::Complete => write!(f, "complete"),
            Completeness::Partial {
                reason: PartialReason::PageCeiling { pages },
            } => write!(f, "possibly incomplete (stopped at the {pages}-page ceiling)"),
            Completeness::Partial {
                reason: PartialReason::PageFailed { page, error },
            } => write!(f, "possibly incomplete (page {page} failed: {error})"),
        }
    }
}

/// Published result of one pipeline cycle. Never mutated after publication.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generation: u64,
    pub filters: FilterState,
    pub buckets: Vec<AggregateBucket>,
    pub trends: Vec<TrendModel>,
    pub record_count: usize,
    pub completeness: Completeness,
    pub filter_options: Option<FilterOptions>,
    pub published_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn trend_for(&self, series: &TrendSeries) -> Option<&TrendModel> {
        self.trends.iter().find(|trend| &trend.series == series)
    }

    /// Buckets grouped per cluster, each group sorted by month.
    pub fn buckets_by_cluster(&self) -> BTreeMap<&str, Vec<&AggregateBucket>> {
        let mut grouped: BTreeMap<&str, Vec<&AggregateBucket>> = BTreeMap::new();
        for bucket in &self.buckets {
            grouped.entry(bucket.cluster.as_str()).or_default().push(bucket);
        }
        for buckets in grouped.values_mut() {
            buckets.sort_by_key(|bucket| bucket.evaluation_month);
        }
        grouped
    }
}
