//! Currency quote feed (`quote-fetch`).
//!
//! USD-BRL is read from the central bank's PTAX service first (today, then
//! yesterday, since PTAX has no value before the first bulletin of the
//! day). Every other pair, and USD-BRL when PTAX has nothing, comes from
//! AwesomeAPI. Successful answers are cached for five minutes; when both
//! providers fail, the last good value for the symbol is served instead.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};
use crate::traits::{ActionOutput, ActionRequest, Capability, HealthStatus, Integration, Quote};

const BCB_PTAX_URL: &str = "https://olinda.bcb.gov.br/olinda/servico/PTAX/versao/v1/odata/CotacaoDolarDia(dataCotacao=@dataCotacao)";

const AWESOME_API_URL: &str = "https://economia.awesomeapi.com.br/json/last";

const CACHE_TTL: Duration = Duration::from_secs(300);

const NAME: &str = "quote";

/// Quote client with provider fallback and caching.
pub struct QuoteFeed {
    http: reqwest::Client,
    cache: Cache<String, Quote>,
    last_good: RwLock<HashMap<String, Quote>>,
}

impl Default for QuoteFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteFeed {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Flowsmith/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            http,
            cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(CACHE_TTL)
                .build(),
            last_good: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the current quote for `symbol` (`USD-BRL`, `usdbrl`, `EUR`...).
    pub async fn fetch(&self, symbol: &str) -> Result<Quote> {
        let symbol = normalize_symbol(symbol).ok_or_else(|| AdapterError::InvalidParams {
            integration: NAME.into(),
            reason: format!("unrecognized quote symbol `{symbol}`"),
        })?;

        if let Some(hit) = self.cache.get(&symbol).await {
            debug!(symbol = %symbol, "quote served from cache");
            return Ok(hit);
        }

        match self.fetch_fresh(&symbol).await {
            Ok(quote) => {
                self.cache.insert(symbol.clone(), quote.clone()).await;
                if let Ok(mut last) = self.last_good.write() {
                    last.insert(symbol, quote.clone());
                }
                Ok(quote)
            }
            Err(err) => {
                let stale = self
                    .last_good
                    .read()
                    .ok()
                    .and_then(|last| last.get(&symbol).cloned());
                match stale {
                    Some(quote) => {
                        warn!(symbol = %symbol, error = %err, "quote providers failed, serving last good value");
                        Ok(quote)
                    }
                    None => Err(err),
                }
            }
        }
    }

    async fn fetch_fresh(&self, symbol: &str) -> Result<Quote> {
        if symbol == "USD-BRL" {
            let today = Utc::now().with_timezone(&brasilia()).date_naive();
            for day in [Some(today), today.pred_opt()].into_iter().flatten() {
                match self.fetch_ptax(day).await {
                    Ok(Some(quote)) => return Ok(quote),
                    Ok(None) => debug!(date = %day, "no PTAX bulletin for date"),
                    Err(e) => {
                        warn!(error = %e, "PTAX request failed");
                        break;
                    }
                }
            }
        }
        self.fetch_awesome(symbol).await
    }

    async fn fetch_ptax(&self, day: NaiveDate) -> Result<Option<Quote>> {
        let url = url::Url::parse_with_params(
            BCB_PTAX_URL,
            &[
                ("@dataCotacao", format!("'{}'", day.format("%m-%d-%Y"))),
                ("$format", "json".to_string()),
            ],
        )
        .map_err(|e| AdapterError::Config(format!("invalid PTAX url: {e}")))?;

        let body = self.get_json(url.as_str()).await?;
        Ok(parse_ptax_response(&body))
    }

    async fn fetch_awesome(&self, symbol: &str) -> Result<Quote> {
        let body = self
            .get_json(&format!("{AWESOME_API_URL}/{symbol}"))
            .await?;
        parse_awesome_response(&body, symbol)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(failed(format!("provider returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| failed(format!("invalid JSON: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn brasilia() -> FixedOffset {
    FixedOffset::west_opt(3 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Currency and coin codes accepted in an unseparated six-letter pair.
const KNOWN_CODES: &[&str] = &[
    "ARS", "AUD", "BRL", "BTC", "CAD", "CHF", "CLP", "CNY", "COP", "ETH", "EUR",
    "GBP", "HKD", "ILS", "INR", "JPY", "LTC", "MXN", "NOK", "NZD", "PEN", "PYG", "RUB",
    "SEK", "SGD", "TRY", "USD", "UYU", "XRP", "ZAR",
];

fn is_known_code(code: &str) -> bool {
    KNOWN_CODES.contains(&code)
}

/// Normalize user input to `XXX-YYY`. Bare three-letter codes quote
/// against BRL. Six letters without a separator only count as a pair when
/// both halves are known codes, so words like "dollar" are rejected.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let parts: Vec<String> = raw
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_uppercase)
        .collect();

    match parts.as_slice() {
        [code] if code.len() == 3 => Some(format!("{code}-BRL")),
        [pair] if pair.len() == 6 => {
            let (base, quote) = pair.split_at(3);
            (is_known_code(base) && is_known_code(quote)).then(|| format!("{base}-{quote}"))
        }
        [base, quote] if base.len() == 3 && quote.len() == 3 => Some(format!("{base}-{quote}")),
        _ => None,
    }
}

/// Read the last bulletin of a PTAX `CotacaoDolarDia` response.
pub fn parse_ptax_response(body: &Value) -> Option<Quote> {
    let last = body["value"].as_array()?.last()?;
    let buy = last["cotacaoCompra"].as_f64()?;
    let sell = last["cotacaoVenda"].as_f64();
    let timestamp = last["dataHoraCotacao"]
        .as_str()
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
        .and_then(|naive| brasilia().from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Quote {
        symbol: "USD-BRL".into(),
        name: "Dólar Americano/Real Brasileiro".into(),
        value: buy,
        change_pct: 0.0,
        high: sell,
        low: Some(buy),
        timestamp,
        provider: "bcb-ptax".into(),
    })
}

/// Read one pair out of an AwesomeAPI `/json/last/{pair}` response.
///
/// AwesomeAPI keys the object by the pair without the dash and encodes
/// numbers as strings.
pub fn parse_awesome_response(body: &Value, symbol: &str) -> Result<Quote> {
    let key = symbol.replace('-', "");
    let entry = body
        .get(&key)
        .ok_or_else(|| failed(format!("response has no `{key}` entry")))?;

    let number = |field: &str| -> Option<f64> {
        match &entry[field] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };

    let value = number("bid").ok_or_else(|| failed(format!("`{key}` has no bid")))?;
    let timestamp = entry["timestamp"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(Quote {
        symbol: symbol.to_string(),
        name: entry["name"].as_str().unwrap_or(symbol).to_string(),
        value,
        change_pct: number("pctChange").unwrap_or(0.0),
        high: number("high"),
        low: number("low"),
        timestamp,
        provider: "awesomeapi".into(),
    })
}

fn failed(reason: String) -> AdapterError {
    AdapterError::ExecutionFailed {
        integration: NAME.into(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

#[async_trait]
impl Integration for QuoteFeed {
    fn name(&self) -> &str {
        NAME
    }

    fn capability(&self) -> Capability {
        Capability::QuoteFetch
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(match self.fetch("USD-BRL").await {
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        })
    }

    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput> {
        match request {
            ActionRequest::QuoteFetch { symbol } => self.fetch(&symbol).await.map(ActionOutput::Quote),
            other => Err(AdapterError::Unsupported {
                integration: NAME.into(),
                capability: other.capability().to_string(),
            }),
        }
    }
}
