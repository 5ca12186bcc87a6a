//! Typed wrapper over an Esplora-style REST API, with timeouts, retry, and per-network
//! inter-call pacing (spec §4.1).

use bitcoin::Txid;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MIN_GAP: Duration = Duration::from_millis(300);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain client call to {0} timed out")]
    Timeout(String),
    #[error("chain client call to {0} failed: {1}")]
    Transient(String, String),
    #[error("chain client returned malformed data for {0}: {1}")]
    Malformed(String, String),
}

/// `{confirmed: bool, block_height?, block_hash?}` (spec §4.1), modeled as a discriminated
/// variant rather than an all-optional struct so callers can't observe `confirmed: false` with a
/// `block_height` set (spec §9 redesign flag on untyped JSON bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Absent,
    Unconfirmed,
    Confirmed {
        block_height: i64,
        #[allow(dead_code)]
        block_hash: String,
    },
}

#[derive(Debug, Clone)]
pub struct TxDetails {
    pub vin: Vec<Txid>,
}

#[derive(serde::Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<i64>,
    block_hash: Option<String>,
}

#[derive(serde::Deserialize)]
struct EsploraVin {
    txid: String,
}

#[derive(serde::Deserialize)]
struct EsploraTx {
    vin: Vec<EsploraVin>,
}

/// Per-network HTTP client plus rate-limiter state. One instance per network, owned by that
/// network's [`crate::monitor::Monitor`] (never shared across networks, spec §9).
pub struct ChainClient {
    base_url: String,
    http: reqwest::blocking::Client,
    min_gap: Duration,
    earliest_next_call: Mutex<Instant>,
}

impl ChainClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("building the reqwest client cannot fail with a static config");
        ChainClient {
            base_url,
            http,
            min_gap: DEFAULT_MIN_GAP,
            earliest_next_call: Mutex::new(Instant::now()),
        }
    }

    #[cfg(test)]
    pub fn with_min_gap(base_url: String, min_gap: Duration) -> Self {
        let mut client = Self::new(base_url);
        client.min_gap = min_gap;
        client
    }

    /// Blocks until the earliest instant the rate limiter allows another call to start.
    fn wait_for_slot(&self) {
        let wait_until = *self.earliest_next_call.lock().unwrap();
        let now = Instant::now();
        if wait_until > now {
            std::thread::sleep(wait_until - now);
        }
    }

    /// Records that a call just finished (successfully or not): the next call may not start
    /// before `now + min_gap` (spec §4.1: "after each call ... the timestamp is set to
    /// `now + minGap`", measured from completion, not from when the call started).
    fn record_call_completed(&self) {
        let mut earliest = self.earliest_next_call.lock().unwrap();
        *earliest = Instant::now() + self.min_gap;
    }

    /// Performs one call, honoring the rate limiter and retrying transient failures up to
    /// `MAX_ATTEMPTS` times with a backoff of `attempt * min_gap` (spec §4.1).
    fn call(
        &self,
        label: &str,
        mut f: impl FnMut(&reqwest::blocking::Client, &str) -> Result<reqwest::blocking::Response, reqwest::Error>,
    ) -> Result<reqwest::blocking::Response, ChainError> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            self.wait_for_slot();
            let outcome = f(&self.http, &self.base_url);
            self.record_call_completed();
            match outcome {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(ChainError::Transient(
                        label.to_string(),
                        format!("server error: {}", resp.status()),
                    ));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if e.is_timeout() {
                        last_err = Some(ChainError::Timeout(label.to_string()));
                    } else {
                        last_err = Some(ChainError::Transient(label.to_string(), e.to_string()));
                    }
                }
            }
            if attempt < MAX_ATTEMPTS {
                std::thread::sleep(self.min_gap * attempt);
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    pub fn tip_height(&self) -> Result<i64, ChainError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.call("tip_height", |http, _| http.get(&url).send())?;
        let text = resp
            .text()
            .map_err(|e| ChainError::Transient("tip_height".into(), e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| ChainError::Malformed("tip_height".into(), text))
    }

    pub fn block_hash(&self, height: i64) -> Result<String, ChainError> {
        let url = format!("{}/block-height/{}", self.base_url, height);
        let resp = self.call("block_hash", |http, _| http.get(&url).send())?;
        resp.text()
            .map(|s| s.trim().to_string())
            .map_err(|e| ChainError::Transient("block_hash".into(), e.to_string()))
    }

    pub fn block_txids(&self, hash: &str) -> Result<Vec<Txid>, ChainError> {
        let url = format!("{}/block/{}/txids", self.base_url, hash);
        let resp = self.call("block_txids", |http, _| http.get(&url).send())?;
        let ids: Vec<String> = resp
            .json()
            .map_err(|e| ChainError::Malformed("block_txids".into(), e.to_string()))?;
        ids.into_iter()
            .map(|s| {
                Txid::from_str(&s).map_err(|_| ChainError::Malformed("block_txids".into(), s))
            })
            .collect()
    }

    pub fn mempool_txids(&self) -> Result<HashSet<Txid>, ChainError> {
        let url = format!("{}/mempool/txids", self.base_url);
        let resp = self.call("mempool_txids", |http, _| http.get(&url).send())?;
        let ids: Vec<String> = resp
            .json()
            .map_err(|e| ChainError::Malformed("mempool_txids".into(), e.to_string()))?;
        ids.into_iter()
            .map(|s| {
                Txid::from_str(&s).map_err(|_| ChainError::Malformed("mempool_txids".into(), s))
            })
            .collect()
    }

    pub fn tx_status(&self, txid: Txid) -> Result<TxStatus, ChainError> {
        let url = format!("{}/tx/{}/status", self.base_url, txid);
        let resp = self.call("tx_status", |http, _| http.get(&url).send())?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TxStatus::Absent);
        }
        let status: EsploraTxStatus = resp
            .json()
            .map_err(|e| ChainError::Malformed("tx_status".into(), e.to_string()))?;
        Ok(match (status.confirmed, status.block_height, status.block_hash) {
            (true, Some(block_height), Some(block_hash)) => TxStatus::Confirmed {
                block_height,
                block_hash,
            },
            _ => TxStatus::Unconfirmed,
        })
    }

    pub fn tx_details(&self, txid: Txid) -> Result<Option<TxDetails>, ChainError> {
        let url = format!("{}/tx/{}", self.base_url, txid);
        let resp = self.call("tx_details", |http, _| http.get(&url).send())?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let tx: EsploraTx = resp
            .json()
            .map_err(|e| ChainError::Malformed("tx_details".into(), e.to_string()))?;
        let vin = tx
            .vin
            .into_iter()
            .map(|v| {
                Txid::from_str(&v.txid).map_err(|_| ChainError::Malformed("tx_details".into(), v.txid))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(TxDetails { vin }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_spaces_out_calls() {
        let client = ChainClient::with_min_gap("http://example.invalid".into(), Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..3 {
            client.wait_for_slot();
            client.record_call_completed();
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn gap_is_measured_from_call_completion_not_start() {
        let client = ChainClient::with_min_gap("http://example.invalid".into(), Duration::from_millis(20));
        client.wait_for_slot();
        std::thread::sleep(Duration::from_millis(30));
        client.record_call_completed();

        let start = Instant::now();
        client.wait_for_slot();
        // The simulated call above took 30ms, already past the 20ms gap, so the next slot
        // should be available immediately rather than waiting an additional 20ms from start.
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
