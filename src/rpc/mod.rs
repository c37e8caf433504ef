pub mod zmq_sub;

use std::time::Duration;

use bitcoin::Amount;
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::TxRecord;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(Value),
    #[error("unexpected RPC response: {0}")]
    Malformed(String),
}

/// Minimal node JSON-RPC client.
pub struct NodeRpc {
    url: String,
    client: Client,
    auth: String, // base64 encoded user:pass
}

impl NodeRpc {
    pub fn new(host: &str, port: u16, user: &str, pass: &str, timeout: Duration) -> Result<Self, RpcError> {
        Self::with_url(format!("http://{host}:{port}"), user, pass, timeout)
    }

    pub fn with_url(url: impl Into<String>, user: &str, pass: &str, timeout: Duration) -> Result<Self, RpcError> {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = STANDARD.encode(format!("{user}:{pass}"));
        Ok(Self {
            url: url.into(),
            client: Client::builder().timeout(timeout).build()?,
            auth,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Basic {}", self.auth))
            .json(&body)
            .send()
            .await?;

        // Nodes answer RPC errors with a non-2xx status and a JSON body.
        let json: Value = resp.json().await?;

        match json.get("error") {
            Some(err) if !err.is_null() => Err(RpcError::Rpc(err.clone())),
            _ => Ok(json["result"].clone()),
        }
    }

    /// Get blockchain info (chain, blocks, headers, etc.).
    pub async fn getblockchaininfo(&self) -> Result<Value, RpcError> {
        self.call("getblockchaininfo", vec![]).await
    }

    /// Get a block with fully decoded transactions.
    pub async fn getblock(&self, hash: &str) -> Result<Value, RpcError> {
        self.call("getblock", vec![json!(hash), json!(2)]).await
    }
}

/// Extract transaction records from a verbosity-2 `getblock` result.
///
/// Fee is taken from the node when reported and is zero otherwise.
pub fn block_transactions(block: &Value) -> Result<Vec<TxRecord>, RpcError> {
    let height = block["height"]
        .as_u64()
        .ok_or_else(|| RpcError::Malformed("block without height".into()))?;
    let txs = block["tx"]
        .as_array()
        .ok_or_else(|| RpcError::Malformed("block without decoded transactions".into()))?;

    txs.iter().map(|tx| parse_tx(tx, height)).collect()
}

fn parse_tx(tx: &Value, height: u64) -> Result<TxRecord, RpcError> {
    let hash = tx["txid"]
        .as_str()
        .ok_or_else(|| RpcError::Malformed("transaction without txid".into()))?
        .to_string();

    let is_coinbase = tx["vin"]
        .as_array()
        .and_then(|vin| vin.first())
        .is_some_and(|input| input.get("coinbase").is_some());

    let mut total = Amount::ZERO;
    for output in tx["vout"].as_array().into_iter().flatten() {
        let value = output["value"]
            .as_f64()
            .ok_or_else(|| RpcError::Malformed(format!("{hash}: output without value")))?;
        let value = Amount::from_btc(value)
            .map_err(|e| RpcError::Malformed(format!("{hash}: bad output value {value}: {e}")))?;
        total = total
            .checked_add(value)
            .ok_or_else(|| RpcError::Malformed(format!("{hash}: output total overflows")))?;
    }

    let fee = match tx.get("fee").and_then(Value::as_f64) {
        Some(fee) => Amount::from_btc(fee)
            .map_err(|e| RpcError::Malformed(format!("{hash}: bad fee {fee}: {e}")))?,
        None => Amount::ZERO,
    };

    Ok(TxRecord {
        hash,
        total_output_value: total,
        fee,
        block_height: height,
        is_coinbase,
    })
}
