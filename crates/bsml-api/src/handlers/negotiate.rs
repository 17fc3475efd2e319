//! Accept-header and query-string parsing for GET.

use axum::http::{header, HeaderMap};

use bsml_core::TimeInterval;

use super::ApiError;

/// Media ranges a client accepts, parameters stripped. Matching is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept(Vec<String>);

impl Accept {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut ranges: Vec<String> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|range| range.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|range| !range.is_empty())
            .collect();
        if ranges.is_empty() {
            ranges.push("*/*".to_string());
        }
        Self(ranges)
    }

    pub fn accepts(&self, mimetype: &str) -> bool {
        self.0.iter().any(|r| r.eq_ignore_ascii_case(mimetype))
    }
}

/// Parsed GET query: `interval;interval;rate=<hz>;maxsize=<n>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamQuery {
    pub intervals: Vec<TimeInterval>,
    pub rate: Option<f64>,
    pub maxsize: Option<usize>,
}

impl StreamQuery {
    pub fn parse(query: Option<&str>) -> Result<Self, ApiError> {
        let mut parsed = StreamQuery::default();
        let items = query
            .unwrap_or("")
            .split(';')
            .map(str::trim)
            .filter(|item| !item.is_empty());
        for item in items {
            if let Some(v) = item.strip_prefix("rate=") {
                let rate: f64 = v
                    .parse()
                    .ok()
                    .filter(|r: &f64| r.is_finite() && *r > 0.0)
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid rate '{v}'")))?;
                parsed.rate = Some(rate);
            } else if let Some(v) = item.strip_prefix("maxsize=") {
                let n: usize = v
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid maxsize '{v}'")))?;
                parsed.maxsize = (n > 0).then_some(n);
            } else {
                let interval =
                    TimeInterval::parse(item).map_err(|e| ApiError::BadRequest(e.to_string()))?;
                parsed.intervals.push(interval);
            }
        }
        Ok(parsed)
    }
}
