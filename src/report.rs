use std::fmt::Write;

use crate::filters::ScopeConstraint;
use crate::models::{Snapshot, TrendSeries};

pub fn build_report(snapshot: &Snapshot, scope: Option<&ScopeConstraint>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cluster Performance Report");
    let _ = writeln!(
        output,
        "Generated {} for {}",
        snapshot.published_at.format("%Y-%m-%d %H:%M UTC"),
        snapshot.filters
    );
    if let Some(scope) = scope {
        let _ = writeln!(output, "Restricted to {} = {}", scope.facet, scope.value);
    }
    let _ = writeln!(
        output,
        "{} households collected ({})",
        snapshot.record_count, snapshot.completeness
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cluster Buckets");

    if snapshot.buckets.is_empty() {
        let _ = writeln!(output, "No evaluation records match this selection.");
    } else {
        let _ = writeln!(
            output,
            "| Cluster | Month | Region | District | Households | Avg income | Achievement |"
        );
        let _ = writeln!(output, "|---|---:|---|---|---:|---:|---:|");
        for buckets in snapshot.buckets_by_cluster().values() {
            for bucket in buckets {
                let _ = writeln!(
                    output,
                    "| {} | {} | {} | {} | {} | {:.2} | {:.1}% |",
                    bucket.cluster,
                    bucket.evaluation_month,
                    bucket.region,
                    bucket.district,
                    bucket.household_count,
                    bucket.avg_income,
                    bucket.achievement_rate
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Income Trends");

    if snapshot.trends.is_empty() {
        let _ = writeln!(output, "Not enough evaluation months to fit a trend.");
    } else {
        for trend in &snapshot.trends {
            let forecast = match (&trend.series, trend.forecast) {
                (TrendSeries::Overall, _) => String::new(),
                (_, Some(point)) => format!(", forecast {:.2} at month {}", point.value, point.month),
                (_, None) => ", no forecast".to_string(),
            };
            let _ = writeln!(
                output,
                "- {}: slope {:.2}/month, {:.2} at month {} to {:.2} at month {}{}",
                trend.series.label(),
                trend.slope,
                trend.start.value,
                trend.start.month,
                trend.end.value,
                trend.end.month,
                forecast
            );
        }
    }

    output
}
