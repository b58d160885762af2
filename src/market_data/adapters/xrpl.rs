// XRP Ledger JSON-RPC adapter: one-shot transport + retrying client

use std::time::Duration;

use itertools::Itertools;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::retry::{retry, ErrorClassifier, RetryPolicy};
use super::xrpl_types::{
    ripple_time_to_utc, split_entry, AccountTxResult, LedgerResult, ValidatedLedgerResult,
};
use super::{FetchError, LedgerBatch, LedgerSource, RawTransaction};

/// A single JSON-RPC round trip. Implementations classify their own failures;
/// retrying is the caller's business.
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, FetchError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    classifier: ErrorClassifier,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration, classifier: ErrorClassifier) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::PermanentProtocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url: url.to_string(), classifier })
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_decode() {
        FetchError::PermanentProtocol(format!("malformed response: {}", e))
    } else if e.is_builder() {
        FetchError::PermanentProtocol(format!("invalid request: {}", e))
    } else {
        // timeouts, refused/reset connections, truncated bodies
        FetchError::TransientNetwork(e.to_string())
    }
}

#[async_trait::async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, FetchError> {
        let body = json!({ "method": method, "params": [params] });
        let response = self.client.post(&self.url).json(&body).send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.classifier.classify_status(status.as_u16(), &text));
        }

        let envelope: Value = response.json().await.map_err(classify_reqwest)?;
        self.classifier.extract_result(envelope)
    }
}

pub struct XrplClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: RpcTransport> XrplClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Page through `account_tx` for one account, oldest first.
    #[instrument(skip(self))]
    pub async fn account_transactions(
        &self,
        account: &str,
        min_ledger: Option<u32>,
        max_ledger: Option<u32>,
        page_limit: u32,
    ) -> Result<Vec<RawTransaction>, FetchError> {
        let mut marker: Option<Value> = None;
        let mut out = Vec::new();

        loop {
            let mut params = json!({
                "account": account,
                "ledger_index_min": min_ledger.map_or(-1, i64::from),
                "ledger_index_max": max_ledger.map_or(-1, i64::from),
                "limit": page_limit,
                "forward": true,
            });
            if let Some(m) = &marker {
                params["marker"] = m.clone();
            }

            let page: AccountTxResult = retry(&self.policy, "account_tx", || {
                let params = params.clone();
                async move {
                    let result = self.transport.call("account_tx", params).await?;
                    serde_json::from_value(result)
                        .map_err(|e| FetchError::PermanentProtocol(format!("malformed account_tx result: {}", e)))
                }
            })
            .await?;

            let fetched = page.transactions.len();
            out.extend(page.transactions.into_iter().map(|entry| split_entry(entry, 0, None)));
            debug!(account, fetched, total = out.len(), "Fetched account_tx page");

            match page.marker {
                Some(next) if !next.is_null() => marker = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }
}

fn parse_ledger(index: u32, result: Value) -> Result<LedgerBatch, FetchError> {
    let parsed: LedgerResult = serde_json::from_value(result)
        .map_err(|e| FetchError::PermanentProtocol(format!("malformed ledger {}: {}", index, e)))?;

    if !parsed.validated {
        return Err(FetchError::TransientNetwork(format!("ledger {} not validated yet", index)));
    }
    let header = parsed.ledger;
    if header.ledger_index.value() != Some(index) {
        return Err(FetchError::PermanentProtocol(format!(
            "asked for ledger {}, node returned {:?}",
            index, header.ledger_index
        )));
    }
    let close_time = ripple_time_to_utc(header.close_time)
        .ok_or_else(|| FetchError::PermanentProtocol(format!("ledger {} has invalid close_time", index)))?;

    let transactions = header
        .transactions
        .into_iter()
        .map(|entry| split_entry(entry, index, Some(close_time)))
        .sorted_by_key(|tx| tx.transaction_index().unwrap_or(u64::MAX))
        .collect();

    Ok(LedgerBatch {
        index,
        hash: header.ledger_hash,
        parent_hash: header.parent_hash,
        close_time,
        transactions,
    })
}

#[async_trait::async_trait]
impl<T: RpcTransport> LedgerSource for XrplClient<T> {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_ledger(&self, index: u32) -> Result<LedgerBatch, FetchError> {
        let params = json!({
            "ledger_index": index,
            "transactions": true,
            "expand": true,
            "binary": false,
        });
        let batch = retry(&self.policy, "ledger", || {
            let params = params.clone();
            async move {
                let result = self.transport.call("ledger", params).await?;
                parse_ledger(index, result)
            }
        })
        .await?;
        debug!(index, txs = batch.transactions.len(), "Fetched ledger");
        Ok(batch)
    }

    async fn latest_validated_index(&self) -> Result<u32, FetchError> {
        retry(&self.policy, "ledger(validated)", || async move {
            let result = self.transport.call("ledger", json!({ "ledger_index": "validated" })).await?;
            let parsed: ValidatedLedgerResult = serde_json::from_value(result)
                .map_err(|e| FetchError::PermanentProtocol(format!("malformed ledger result: {}", e)))?;
            parsed
                .ledger_index
                .or(parsed.ledger.map(|l| l.ledger_index))
                .and_then(|i| i.value())
                .ok_or_else(|| FetchError::PermanentProtocol("validated ledger has no index".into()))
        })
        .await
    }
}
