//! Turns raw provider entries into [`QuoteRecord`]s, rejecting anything that
//! breaks the record invariants.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::{
    constants,
    marketdata::response::RawEntry,
    model::{FetchMode, QuoteRecord},
};

const PRICE_SCALE: u32 = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("unknown time zone '{0}'")]
    UnknownTimeZone(String),
    #[error("{field} is not a number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("{field} is negative: {value}")]
    Negative { field: &'static str, value: Decimal },
    #[error("price range violated: {0}")]
    PriceRange(String),
    #[error("no usable prices")]
    NoPrices,
    #[error("timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),
}

/// Normalizes a ticker: trimmed, upper-case, 1-10 of `[A-Z0-9.-]`.
pub fn normalize_symbol(raw: &str) -> Result<String, ValidationError> {
    let symbol = raw.trim().to_uppercase();
    let ok = !symbol.is_empty()
        && symbol.len() <= constants::MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if ok {
        Ok(symbol)
    } else {
        Err(ValidationError::InvalidSymbol(raw.to_string()))
    }
}

/// Validates one entry. `now` bounds the timestamp from above.
pub fn validate_entry(
    symbol: &str,
    mode: FetchMode,
    time_zone: Option<&str>,
    entry: &RawEntry,
    now: DateTime<Utc>,
) -> Result<QuoteRecord, ValidationError> {
    let symbol = normalize_symbol(symbol)?;
    let timestamp = parse_timestamp(mode, &entry.timestamp, time_zone)?;
    if timestamp > now {
        return Err(ValidationError::FutureTimestamp(timestamp));
    }

    let fields = &entry.fields;
    let record = QuoteRecord {
        symbol,
        timestamp,
        open_price: parse_price("open", fields.open.as_deref())?,
        high_price: parse_price("high", fields.high.as_deref())?,
        low_price: parse_price("low", fields.low.as_deref())?,
        close_price: parse_price("close", fields.close.as_deref())?,
        volume: parse_volume(fields.volume.as_deref())?,
    };

    let prices = [
        record.open_price,
        record.high_price,
        record.low_price,
        record.close_price,
    ];
    if prices.iter().all(|p| p.is_none_or(|p| p.is_zero())) {
        return Err(ValidationError::NoPrices);
    }
    check_ranges(&record)?;
    Ok(record)
}

fn check_ranges(record: &QuoteRecord) -> Result<(), ValidationError> {
    let (low, high) = (record.low_price, record.high_price);
    if let (Some(low), Some(high)) = (low, high) {
        if low > high {
            return Err(ValidationError::PriceRange(format!("low {low} > high {high}")));
        }
    }
    for (name, price) in [("open", record.open_price), ("close", record.close_price)] {
        let Some(price) = price else { continue };
        if let Some(low) = low {
            if price < low {
                return Err(ValidationError::PriceRange(format!("{name} {price} < low {low}")));
            }
        }
        if let Some(high) = high {
            if price > high {
                return Err(ValidationError::PriceRange(format!("{name} {price} > high {high}")));
            }
        }
    }
    Ok(())
}

fn parse_timestamp(mode: FetchMode, raw: &str, time_zone: Option<&str>) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = || ValidationError::InvalidTimestamp(raw.to_string());
    match mode {
        // daily bars sit on the UTC date boundary
        FetchMode::Daily => {
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
            Ok(date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?.and_utc())
        }
        FetchMode::Intraday(_) => {
            let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M"))
                .map_err(|_| invalid())?;
            let tz_name = time_zone.unwrap_or(constants::DEFAULT_PROVIDER_TZ);
            let tz: Tz = tz_name
                .parse()
                .map_err(|_| ValidationError::UnknownTimeZone(tz_name.to_string()))?;
            // ambiguous wall-clock times (DST fall-back) resolve to the earlier instant
            let local = tz.from_local_datetime(&naive).earliest().ok_or_else(invalid)?;
            Ok(local.with_timezone(&Utc))
        }
    }
}

fn parse_price(field: &'static str, raw: Option<&str>) -> Result<Option<Decimal>, ValidationError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let mut value = Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| ValidationError::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::Negative { field, value });
    }
    value = value.round_dp(PRICE_SCALE);
    value.rescale(PRICE_SCALE);
    Ok(Some(value))
}

fn parse_volume(raw: Option<&str>) -> Result<Option<u64>, ValidationError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let invalid = || ValidationError::InvalidNumber {
        field: "volume",
        value: raw.to_string(),
    };
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(Some(v));
    }
    // some feeds send "1200.0"
    let d = Decimal::from_str(raw).map_err(|_| invalid())?;
    if d.is_sign_negative() && !d.is_zero() {
        return Err(invalid());
    }
    if !d.fract().is_zero() {
        return Err(invalid());
    }
    u64::try_from(d).map(Some).map_err(|_| invalid())
}
