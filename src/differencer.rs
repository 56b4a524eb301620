use crate::config::StalenessPolicy;
use crate::models::{CoverageStatus, Record, TargetState};
use serde_json::Value;

/// Classifies a record against the target's current state for its key.
///
/// Pure: the result depends only on the arguments.
pub fn classify(
    record: &Record,
    existing: Option<&TargetState>,
    policy: &StalenessPolicy,
) -> CoverageStatus {
    let Some(state) = existing else {
        return CoverageStatus::Absent;
    };

    if stale_reason(record, state, policy).is_some() {
        CoverageStatus::Stale
    } else {
        CoverageStatus::Present
    }
}

/// First policy rule that marks the target row stale, if any.
pub fn stale_reason(
    record: &Record,
    state: &TargetState,
    policy: &StalenessPolicy,
) -> Option<String> {
    if let Some(min_points) = policy.min_price_points {
        if state.price_points < min_points && state.price_points < record.prices.len() {
            return Some(format!(
                "{} price point(s) stored, {} required",
                state.price_points, min_points
            ));
        }
    }

    if let (Some(max_age), Some(as_of)) = (policy.max_price_age_days, policy.as_of) {
        match state.last_price_date {
            Some(last) if (as_of - last).num_days() <= max_age => {}
            Some(last) => {
                let newer_available = record
                    .last_price()
                    .map(|point| point.date > last)
                    .unwrap_or(false);
                if newer_available {
                    return Some(format!("last price {} older than {} day(s)", last, max_age));
                }
            }
            None if !record.prices.is_empty() => {
                return Some("no stored prices".to_string());
            }
            None => {}
        }
    }

    for field in &policy.required_fields {
        let missing = matches!(state.fields.get(field), None | Some(Value::Null));
        let available = !matches!(record.fields.get(field), None | Some(Value::Null));
        if missing && available {
            return Some(format!("required field {} is empty", field));
        }
    }

    if policy.compare_fields {
        for (name, value) in &record.fields {
            if state.fields.get(name) != Some(value) {
                return Some(format!("field {} differs", name));
            }
        }
    }

    if policy.require_dividends && state.dividend_count == 0 && !record.dividends.is_empty() {
        return Some("no stored dividends".to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DividendEntry, PricePoint};
    use chrono::NaiveDate;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn prices(count: usize, last: NaiveDate) -> Vec<PricePoint> {
        (0..count)
            .map(|idx| PricePoint {
                date: last - chrono::Duration::days((count - 1 - idx) as i64),
                close: 100.0 + idx as f64,
                volume: None,
            })
            .collect()
    }

    fn record() -> Record {
        Record::new("spy")
            .expect("valid key")
            .with_field("name", json!("SPDR S&P 500"))
            .with_prices(prices(30, date(2024, 3, 1)))
    }

    fn matching_state() -> TargetState {
        let mut state = TargetState {
            price_points: 30,
            first_price_date: Some(date(2024, 1, 31)),
            last_price_date: Some(date(2024, 3, 1)),
            ..TargetState::default()
        };
        state
            .fields
            .insert("name".to_string(), json!("SPDR S&P 500"));
        state
    }

    #[test]
    fn missing_target_row_is_absent() {
        let policy = StalenessPolicy::default();
        assert_eq!(classify(&record(), None, &policy), CoverageStatus::Absent);
    }

    #[test]
    fn identical_target_row_is_present() {
        let policy = StalenessPolicy {
            compare_fields: true,
            min_price_points: Some(20),
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        assert_eq!(
            classify(&record(), Some(&state), &policy),
            CoverageStatus::Present
        );
    }

    #[test]
    fn short_history_is_stale() {
        let policy = StalenessPolicy {
            min_price_points: Some(250),
            ..StalenessPolicy::default()
        };
        let mut state = matching_state();
        state.price_points = 5;
        assert_eq!(
            classify(&record(), Some(&state), &policy),
            CoverageStatus::Stale
        );
    }

    #[test]
    fn short_history_is_present_when_source_has_nothing_more() {
        let policy = StalenessPolicy {
            min_price_points: Some(250),
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        assert_eq!(
            classify(&record(), Some(&state), &policy),
            CoverageStatus::Present
        );
    }

    #[test]
    fn old_prices_are_stale_only_when_newer_exist() {
        let policy = StalenessPolicy {
            max_price_age_days: Some(5),
            as_of: Some(date(2024, 3, 20)),
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        assert_eq!(
            classify(&record(), Some(&state), &policy),
            CoverageStatus::Present
        );

        let newer = record().with_prices(prices(40, date(2024, 3, 19)));
        assert_eq!(
            classify(&newer, Some(&state), &policy),
            CoverageStatus::Stale
        );
    }

    #[test]
    fn null_required_field_is_stale() {
        let policy = StalenessPolicy {
            required_fields: vec!["expense_ratio".to_string()],
            ..StalenessPolicy::default()
        };
        let mut state = matching_state();
        state
            .fields
            .insert("expense_ratio".to_string(), Value::Null);
        let enriched = record().with_field("expense_ratio", json!(0.0945));
        assert_eq!(
            classify(&enriched, Some(&state), &policy),
            CoverageStatus::Stale
        );
    }

    #[test]
    fn changed_field_is_stale_when_comparing() {
        let policy = StalenessPolicy {
            compare_fields: true,
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        let renamed = record().with_field("name", json!("SPDR S&P 500 ETF Trust"));
        assert_eq!(
            classify(&renamed, Some(&state), &policy),
            CoverageStatus::Stale
        );
    }

    #[test]
    fn missing_dividends_are_stale_when_required() {
        let policy = StalenessPolicy {
            require_dividends: true,
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        let with_dividends = record().with_dividends(vec![DividendEntry {
            ex_date: date(2024, 2, 15),
            amount: 1.59,
        }]);
        assert_eq!(
            classify(&with_dividends, Some(&state), &policy),
            CoverageStatus::Stale
        );
        assert_eq!(
            classify(&record(), Some(&state), &policy),
            CoverageStatus::Present
        );
    }

    #[test]
    fn classification_is_repeatable() {
        let policy = StalenessPolicy {
            compare_fields: true,
            min_price_points: Some(10),
            ..StalenessPolicy::default()
        };
        let state = matching_state();
        let candidate = record().with_field("name", json!("changed"));
        let first = classify(&candidate, Some(&state), &policy);
        for _ in 0..10 {
            assert_eq!(classify(&candidate, Some(&state), &policy), first);
        }
    }
}
