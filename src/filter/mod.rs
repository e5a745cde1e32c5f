use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::config::{seconds, FilterConfig};
use crate::models::Measurement;

/// Splits a comma separated list of idents, dropping blanks
pub fn to_filter_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ident| ident.trim())
        .filter(|ident| !ident.is_empty())
        .map(|ident| ident.to_string())
        .collect()
}

/// An empty filter lets everything pass
pub fn is_relevant(ident: &str, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|f| f == ident)
}

struct Published {
    value: String,
    at: DateTime<Utc>,
}

/// Decides which measurements go out: the ident filter first, then unchanged values are
/// held back until `resend_after` has passed since they were last published.
pub struct MeasurementFilter {
    idents: Vec<String>,
    resend_after: TimeDelta,
    memo: HashMap<String, Published>,
}

impl MeasurementFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            idents: config.idents.clone(),
            // out of range values are rejected on config load, here they mean never
            resend_after: seconds(config.resend_after_secs).unwrap_or(TimeDelta::MAX),
            memo: HashMap::new(),
        }
    }

    pub fn should_publish(&mut self, measurement: &Measurement, now: DateTime<Utc>) -> bool {
        if !is_relevant(&measurement.ident, &self.idents) {
            debug!("Filtered {}", measurement.key());
            return false;
        }

        let key = measurement.key();
        let publish = match self.memo.get(&key) {
            None => true,
            Some(previous) => {
                previous.value != measurement.value || now.signed_duration_since(previous.at) > self.resend_after
            }
        };

        if publish {
            debug!("Memorized {} = {}", key, measurement.value);
            self.memo.insert(
                key,
                Published {
                    value: measurement.value.clone(),
                    at: now,
                },
            );
        } else {
            debug!("Skipped {}, value unchanged", key);
        }

        publish
    }
}
