use std::collections::BTreeMap;

use crate::models::{AggregateBucket, BucketKey, EvaluationRecord};

#[derive(Default)]
struct Totals {
    households: usize,
    income: f64,
    achieved: u64,
}

/// Groups records by (cluster, evaluation month, region, district).
///
/// Buckets only exist for keys with at least one record. The output is
/// ordered by key so repeated runs over the same records are identical.
pub fn aggregate(records: &[EvaluationRecord]) -> Vec<AggregateBucket> {
    let mut totals: BTreeMap<BucketKey, Totals> = BTreeMap::new();

    for record in records {
        let key = BucketKey {
            cluster: record.cluster.clone(),
            evaluation_month: record.evaluation_month,
            region: record.region.clone(),
            district: record.district.clone(),
        };
        let entry = totals.entry(key).or_default();
        entry.households += 1;
        entry.income += record.income();
        entry.achieved += u64::from(record.achieved.min(1));
    }

    totals
        .into_iter()
        .map(|(key, totals)| {
            let households = totals.households as f64;
            AggregateBucket {
                cluster: key.cluster,
                evaluation_month: key.evaluation_month,
                region: key.region,
                district: key.district,
                household_count: totals.households,
                avg_income: totals.income / households,
                achievement_rate: 100.0 * totals.achieved as f64 / households,
            }
        })
        .collect()
}
