use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const MARKET_SLUG_PREFIX: &str = "btc-updown-";
const SERIES_SLUG_PREFIX: &str = "btc-up-or-down-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    /// Canonical order. Also the default set.
    pub const ALL: [Timeframe; 4] = [Timeframe::M5, Timeframe::M15, Timeframe::H1, Timeframe::H4];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    /// Accepts the canonical names plus the aliases seen in slugs and configs.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "1h" | "60m" | "hourly" => Some(Timeframe::H1),
            "4h" | "4hour" | "240m" => Some(Timeframe::H4),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// De-duplicated and returned in canonical order. Empty input means every timeframe.
pub fn parse_timeframes_csv(raw: Option<&str>) -> Result<Vec<Timeframe>> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(Timeframe::ALL.to_vec());
    };

    let mut picked = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let tf = Timeframe::parse(item).ok_or_else(|| {
            AppError::Config(format!(
                "Unsupported timeframe '{item}'. Supported: 5m, 15m, 1h, 4h"
            ))
        })?;
        if !picked.contains(&tf) {
            picked.push(tf);
        }
    }
    if picked.is_empty() {
        return Err(AppError::Config("At least one timeframe is required".to_string()));
    }
    picked.sort();
    Ok(picked)
}

/// `btc-updown-5m-1771211700` → `(5m, 1771211700)`.
pub fn parse_market_slug(slug: &str) -> Option<(Timeframe, u64)> {
    let rest = slug.strip_prefix(MARKET_SLUG_PREFIX)?;
    let (tf, ts) = rest.split_once('-')?;
    if !is_slug_token(tf) || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((Timeframe::parse(tf)?, ts.parse().ok()?))
}

/// `btc-up-or-down-15m` → `15m`.
pub fn parse_series_slug(series_slug: &str) -> Option<Timeframe> {
    let tf = series_slug.strip_prefix(SERIES_SLUG_PREFIX)?;
    if !is_slug_token(tf) {
        return None;
    }
    Timeframe::parse(tf)
}

fn is_slug_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Matches a Gamma market object against the enabled timeframes.
///
/// The slug timeframe must be enabled and at least one attached event must carry a
/// series slug of the same timeframe. Markets with a disagreeing or missing series are
/// rejected.
pub fn match_updown_market(
    market: &serde_json::Value,
    enabled: &[Timeframe],
) -> Option<(Timeframe, u64)> {
    let slug = market.get("slug")?.as_str()?.to_ascii_lowercase();
    let (slug_tf, window_start_ts) = parse_market_slug(&slug)?;
    if !enabled.contains(&slug_tf) {
        return None;
    }

    let series_agrees = market
        .get("events")
        .and_then(|e| e.as_array())
        .map(|events| {
            events.iter().any(|event| {
                event
                    .get("seriesSlug")
                    .and_then(|s| s.as_str())
                    .and_then(|s| parse_series_slug(&s.to_ascii_lowercase()))
                    == Some(slug_tf)
            })
        })
        .unwrap_or(false);

    series_agrees.then_some((slug_tf, window_start_ts))
}

/// File-name suffix for a timeframe selection.
pub fn file_suffix(enabled: &[Timeframe]) -> String {
    let ordered: Vec<Timeframe> = Timeframe::ALL
        .iter()
        .copied()
        .filter(|tf| enabled.contains(tf))
        .collect();
    if ordered == [Timeframe::M5] {
        return "5m".to_string();
    }
    if ordered == Timeframe::ALL {
        return "all_timeframes".to_string();
    }
    ordered.iter().map(|tf| tf.as_str()).collect::<Vec<_>>().join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gamma_market(slug: &str, series: &str) -> serde_json::Value {
        json!({ "slug": slug, "events": [{ "id": "1", "seriesSlug": series }] })
    }

    #[test]
    fn aliases_normalize() {
        assert_eq!(Timeframe::parse("60m"), Some(Timeframe::H1));
        assert_eq!(Timeframe::parse(" Hourly "), Some(Timeframe::H1));
        assert_eq!(Timeframe::parse("240m"), Some(Timeframe::H4));
        assert_eq!(Timeframe::parse("4hour"), Some(Timeframe::H4));
        assert_eq!(Timeframe::parse("1d"), None);
    }

    #[test]
    fn csv_dedupes_and_orders() {
        let tfs = parse_timeframes_csv(Some("4h, 5m,60m,1h")).unwrap();
        assert_eq!(tfs, vec![Timeframe::M5, Timeframe::H1, Timeframe::H4]);
        assert_eq!(parse_timeframes_csv(None).unwrap(), Timeframe::ALL.to_vec());
        assert_eq!(parse_timeframes_csv(Some("  ")).unwrap(), Timeframe::ALL.to_vec());
        assert!(parse_timeframes_csv(Some("5m,2m")).is_err());
        assert!(parse_timeframes_csv(Some(",")).is_err());
    }

    #[test]
    fn matches_when_slug_and_series_agree() {
        let m = gamma_market("btc-updown-15m-1771211700", "btc-up-or-down-15m");
        assert_eq!(
            match_updown_market(&m, &Timeframe::ALL),
            Some((Timeframe::M15, 1771211700))
        );
    }

    #[test]
    fn rejects_series_timeframe_mismatch() {
        let m = gamma_market("btc-updown-5m-1771211700", "btc-up-or-down-15m");
        assert_eq!(match_updown_market(&m, &Timeframe::ALL), None);
    }

    #[test]
    fn rejects_missing_series_and_disabled_timeframe() {
        let m = json!({ "slug": "btc-updown-5m-1771211700", "events": [] });
        assert_eq!(match_updown_market(&m, &Timeframe::ALL), None);

        let m = gamma_market("btc-updown-1h-1771210800", "btc-up-or-down-1h");
        assert_eq!(match_updown_market(&m, &[Timeframe::M5]), None);
    }

    #[test]
    fn rejects_malformed_slugs() {
        assert_eq!(parse_market_slug("btc-updown-5m-"), None);
        assert_eq!(parse_market_slug("btc-updown-5m-12a"), None);
        assert_eq!(parse_market_slug("eth-updown-5m-1771211700"), None);
        assert_eq!(parse_market_slug("btc-updown-5m-17-71"), None);
    }

    #[test]
    fn file_suffixes() {
        assert_eq!(file_suffix(&[Timeframe::M5]), "5m");
        assert_eq!(file_suffix(&Timeframe::ALL), "all_timeframes");
        assert_eq!(file_suffix(&[Timeframe::H1, Timeframe::M5]), "5m_1h");
    }
}
