use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer};

use crate::model::FetchMode;

/// Top-level provider payload. Exactly one of the notice fields or the
/// mode's time-series key is expected to be present.
#[derive(Debug, Deserialize)]
pub struct TimeSeriesPayload {
    #[serde(rename = "Error Message")]
    pub error_message: Option<String>,
    #[serde(rename = "Note")]
    pub note: Option<String>,
    #[serde(rename = "Information")]
    pub information: Option<String>,
    #[serde(rename = "Meta Data", default)]
    pub meta: HashMap<String, String>,
    #[serde(flatten)]
    pub series: HashMap<String, serde_json::Value>,
}

/// One bar as the provider sends it. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BarFields {
    #[serde(rename = "1. open", default, deserialize_with = "lenient_string")]
    pub open: Option<String>,
    #[serde(rename = "2. high", default, deserialize_with = "lenient_string")]
    pub high: Option<String>,
    #[serde(rename = "3. low", default, deserialize_with = "lenient_string")]
    pub low: Option<String>,
    #[serde(rename = "4. close", default, deserialize_with = "lenient_string")]
    pub close: Option<String>,
    #[serde(rename = "5. volume", default, deserialize_with = "lenient_string")]
    pub volume: Option<String>,
}

/// A raw entry keyed by its provider timestamp string.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub timestamp: String,
    pub fields: BarFields,
}

/// Entries for one symbol in ascending timestamp order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSeries {
    pub time_zone: Option<String>,
    pub entries: Vec<RawEntry>,
}

/// Key under which the provider nests bars for `mode`.
pub fn series_key(mode: FetchMode) -> String {
    match mode {
        FetchMode::Daily => "Time Series (Daily)".to_string(),
        FetchMode::Intraday(interval) => format!("Time Series ({interval})"),
    }
}

impl TimeSeriesPayload {
    /// Time zone declared in the metadata block ("5. Time Zone" or "6. Time Zone").
    pub fn time_zone(&self) -> Option<String> {
        self.meta
            .iter()
            .find(|(k, _)| k.ends_with("Time Zone"))
            .map(|(_, v)| v.clone())
    }

    /// Takes the bars for `mode` out of the payload. `Err` carries a
    /// description of what was wrong with the shape.
    pub fn into_series(mut self, mode: FetchMode) -> Result<RawSeries, String> {
        let key = series_key(mode);
        let time_zone = self.time_zone();
        let value = self
            .series
            .remove(&key)
            .ok_or_else(|| format!("missing '{key}' in response"))?;
        let bars: BTreeMap<String, BarFields> =
            serde_json::from_value(value).map_err(|e| format!("malformed '{key}': {e}"))?;

        Ok(RawSeries {
            time_zone,
            entries: bars
                .into_iter()
                .map(|(timestamp, fields)| RawEntry { timestamp, fields })
                .collect(),
        })
    }
}

// Accepts "12.5", 12.5 or null.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
