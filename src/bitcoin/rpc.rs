//! A minimal Bitcoin Core JSON-RPC client: HTTP + basic auth, structured
//! error bodies, 5 s slow-call warning (§9 design notes).

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::utils::timeout::{timed_rpc, Timeouts};

pub struct BitcoinRpcClient {
    http: Client,
    url: String,
    user: String,
    password: String,
    timeouts: Timeouts,
}

impl BitcoinRpcClient {
    pub fn new(url: String, user: String, password: String) -> Self {
        Self {
            http: Client::new(),
            url,
            user,
            password,
            timeouts: Timeouts::default(),
        }
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "federator",
            "method": method,
            "params": params,
        });

        let request = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body);

        let response = timed_rpc(method, &self.timeouts, async {
            request
                .send()
                .await
                .map_err(|e| Error::Bitcoin(format!("{method}: request failed: {e}")))
        })
        .await?;

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::Bitcoin(format!("{method}: invalid JSON response: {e}")))?;

        if let Some(err) = parsed.get("error") {
            if !err.is_null() {
                return Err(Error::Bitcoin(format!("{method}: rpc error: {err}")));
            }
        }

        let result = parsed
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Bitcoin(format!("{method}: missing result field")))?;

        serde_json::from_value(result).map_err(|e| Error::Bitcoin(format!("{method}: decode error: {e}")))
    }

    pub async fn list_unspent(&self, min_conf: u32, address: &str) -> Result<Vec<Value>> {
        self.call("listunspent", json!([min_conf, 9_999_999, [address]])).await
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<Option<Value>> {
        match self.call::<Value>("gettransaction", json!([txid])).await {
            Ok(v) => Ok(Some(v)),
            Err(_) => Ok(None),
        }
    }

    pub async fn send_raw_transaction(&self, hex_tx: &str) -> Result<String> {
        self.call("sendrawtransaction", json!([hex_tx])).await
    }

    pub async fn estimate_raw_fee(&self, conf_target: u32) -> Result<Value> {
        self.call("estimaterawfee", json!([conf_target])).await
    }

    pub async fn get_blockchain_info(&self) -> Result<Value> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn get_address_info(&self, address: &str) -> Result<Value> {
        self.call("getaddressinfo", json!([address])).await
    }
}
