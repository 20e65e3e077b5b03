use crate::models::EvaluationRecord;

pub(crate) fn record(
    household_id: &str,
    cluster: &str,
    region: &str,
    evaluation_month: i32,
    achieved: u8,
    income: f64,
) -> EvaluationRecord {
    EvaluationRecord {
        household_id: household_id.to_string(),
        cohort: "2023".to_string(),
        cycle: "A".to_string(),
        region: region.to_string(),
        district: format!("{region}-district"),
        cluster: cluster.to_string(),
        village: format!("{cluster}-village"),
        evaluation_month,
        achieved,
        achievement_probability: if achieved > 0 { 0.8 } else { 0.3 },
        predicted_income: Some(income),
    }
}
