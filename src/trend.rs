use std::collections::BTreeMap;

use crate::models::{AggregateBucket, TrendModel, TrendPoint, TrendSeries};

/// Step used when a series shows fewer than two gaps between its months.
pub const DEFAULT_MONTH_INTERVAL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    pub fn at(&self, month: i32) -> f64 {
        self.slope * f64::from(month) + self.intercept
    }
}

/// Ordinary least squares. `None` for fewer than two points or when every
/// month is identical.
pub fn fit_line(points: &[(i32, f64)]) -> Option<LineFit> {
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for &(month, value) in points {
        let x = f64::from(month);
        sum_x += x;
        sum_y += value;
        sum_xy += x * value;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() <= f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Some(LineFit { slope, intercept })
}

/// Smallest positive gap between consecutive sorted months.
pub fn month_interval(sorted_months: &[i32]) -> i32 {
    let gaps: Vec<i32> = sorted_months
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|gap| *gap > 0)
        .collect();

    if gaps.len() < 2 {
        return DEFAULT_MONTH_INTERVAL;
    }
    gaps.into_iter().min().unwrap_or(DEFAULT_MONTH_INTERVAL)
}

pub fn forecast(buckets: &[AggregateBucket]) -> Vec<TrendModel> {
    let mut by_cluster: BTreeMap<&str, Vec<(i32, f64)>> = BTreeMap::new();
    for bucket in buckets {
        by_cluster
            .entry(bucket.cluster.as_str())
            .or_default()
            .push((bucket.evaluation_month, bucket.avg_income));
    }

    let mut trends: Vec<TrendModel> = by_cluster
        .into_iter()
        .filter_map(|(cluster, mut points)| {
            sort_points(&mut points);
            cluster_trend(cluster, &points)
        })
        .collect();

    let mut pooled: Vec<(i32, f64)> = buckets
        .iter()
        .map(|bucket| (bucket.evaluation_month, bucket.avg_income))
        .collect();
    sort_points(&mut pooled);
    if let Some(overall) = overall_trend(&pooled) {
        trends.push(overall);
    }

    trends
}

fn sort_points(points: &mut [(i32, f64)]) {
    points.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
}

fn span(points: &[(i32, f64)]) -> Option<(i32, i32)> {
    Some((points.first()?.0, points.last()?.0))
}

fn cluster_trend(cluster: &str, points: &[(i32, f64)]) -> Option<TrendModel> {
    let fit = fit_line(points)?;
    let (first_month, last_month) = span(points)?;

    let months: Vec<i32> = points.iter().map(|(month, _)| *month).collect();
    let forecast_month = last_month + month_interval(&months);
    let forecast_value = fit.at(forecast_month);

    Some(TrendModel {
        series: TrendSeries::Cluster(cluster.to_string()),
        slope: fit.slope,
        intercept: fit.intercept,
        start: TrendPoint {
            month: first_month,
            value: fit.at(first_month),
        },
        end: TrendPoint {
            month: last_month,
            value: fit.at(last_month),
        },
        forecast: (forecast_value > 0.0).then_some(TrendPoint {
            month: forecast_month,
            value: forecast_value,
        }),
    })
}

/// Pooled line across every bucket. When all buckets share one month the
/// line is flat at the pooled mean.
fn overall_trend(points: &[(i32, f64)]) -> Option<TrendModel> {
    let (min_month, max_month) = span(points)?;
    let fit = fit_line(points).unwrap_or_else(|| LineFit {
        slope: 0.0,
        intercept: points.iter().map(|(_, value)| value).sum::<f64>() / points.len() as f64,
    });

    Some(TrendModel {
        series: TrendSeries::Overall,
        slope: fit.slope,
        intercept: fit.intercept,
        start: TrendPoint {
            month: min_month,
            value: fit.at(min_month),
        },
        end: TrendPoint {
            month: max_month,
            value: fit.at(max_month),
        },
        forecast: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(cluster: &str, month: i32, avg_income: f64) -> AggregateBucket {
        AggregateBucket {
            cluster: cluster.to_string(),
            evaluation_month: month,
            region: "Western".to_string(),
            district: "Busia".to_string(),
            household_count: 10,
            avg_income,
            achievement_rate: 50.0,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn exact_line_is_recovered() {
        let trends = forecast(&[bucket("C1", 3, 30.0), bucket("C1", 1, 10.0), bucket("C1", 2, 20.0)]);
        let c1 = trends
            .iter()
            .find(|t| t.series == TrendSeries::Cluster("C1".to_string()))
            .unwrap();

        assert_close(c1.slope, 10.0);
        assert_close(c1.intercept, 0.0);
        let forecast = c1.forecast.unwrap();
        assert_eq!(forecast.month, 4);
        assert_close(forecast.value, 40.0);
        assert_eq!(c1.start.month, 1);
        assert_eq!(c1.end.month, 3);
    }

    #[test]
    fn non_positive_forecast_is_suppressed() {
        let trends = forecast(&[bucket("C1", 1, 10.0), bucket("C1", 2, 1.0)]);
        let c1 = &trends[0];
        assert_close(c1.slope, -9.0);
        assert!(c1.forecast.is_none());
    }

    #[test]
    fn single_point_series_has_no_line() {
        let trends = forecast(&[bucket("C1", 3, 10.0), bucket("C2", 3, 20.0), bucket("C2", 6, 30.0)]);
        assert!(trends
            .iter()
            .all(|t| t.series != TrendSeries::Cluster("C1".to_string())));
        assert!(trends
            .iter()
            .any(|t| t.series == TrendSeries::Cluster("C2".to_string())));
    }

    #[test]
    fn forecast_step_uses_smallest_gap() {
        assert_eq!(month_interval(&[3, 6, 12]), 3);
        assert_eq!(month_interval(&[6, 8, 12, 18]), 2);
        assert_eq!(month_interval(&[6, 12]), DEFAULT_MONTH_INTERVAL);
        assert_eq!(month_interval(&[6, 6, 6]), DEFAULT_MONTH_INTERVAL);

        let trends = forecast(&[bucket("C1", 6, 10.0), bucket("C1", 12, 20.0)]);
        assert_eq!(trends[0].forecast.unwrap().month, 15);
    }

    #[test]
    fn identical_months_leave_a_flat_overall_line() {
        assert!(fit_line(&[(6, 10.0), (6, 30.0)]).is_none());
        let trends = forecast(&[bucket("C1", 6, 10.0), {
            let mut other = bucket("C1", 6, 30.0);
            other.district = "Teso".to_string();
            other
        }]);

        assert_eq!(trends.len(), 1);
        let overall = &trends[0];
        assert_eq!(overall.series, TrendSeries::Overall);
        assert_close(overall.slope, 0.0);
        assert_close(overall.intercept, 20.0);
        assert_eq!((overall.start.month, overall.end.month), (6, 6));
        assert_close(overall.start.value, 20.0);
        assert!(overall.forecast.is_none());
    }

    #[test]
    fn empty_input_has_no_trends() {
        assert!(forecast(&[]).is_empty());
    }

    #[test]
    fn overall_line_spans_pooled_months() {
        let trends = forecast(&[
            bucket("C1", 3, 10.0),
            bucket("C1", 6, 20.0),
            bucket("C2", 9, 30.0),
        ]);
        let overall = trends.last().unwrap();

        assert_eq!(overall.series, TrendSeries::Overall);
        assert!(overall.forecast.is_none());
        assert_eq!(overall.start.month, 3);
        assert_eq!(overall.end.month, 9);
        assert_close(overall.start.value, 10.0);
        assert_close(overall.end.value, 30.0);
        assert_close(overall.value_at(6), 20.0);
    }

    #[test]
    fn rerunning_gives_identical_output() {
        let buckets = vec![
            bucket("C2", 3, 12.5),
            bucket("C1", 6, 20.0),
            bucket("C1", 3, 11.0),
            bucket("C2", 9, 14.0),
        ];
        assert_eq!(forecast(&buckets), forecast(&buckets));
    }
}
