//! etcd v3 client over the JSON gRPC gateway
//!
//! Keys and values travel base64-encoded, int64 fields come back as
//! JSON strings. Conditional put is a `txn` comparing the key's
//! `create_revision` with 0, conditional delete one comparing its value.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pollward_api::LeaseId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

use super::{CoordinationStore, StoreError, StoreResult};

/// int64 as returned by the gateway: usually a string, sometimes a number
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum Int64 {
    Num(i64),
    Str(String),
}

impl Int64 {
    fn get(&self) -> Option<i64> {
        match self {
            Int64::Num(n) => Some(*n),
            Int64::Str(s) => s.parse().ok(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize, Debug)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize, Debug)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

#[derive(Deserialize, Debug)]
struct DeleteRangeResponse {
    deleted: Option<Int64>,
}

#[derive(Deserialize, Debug)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: Option<Int64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct LeaseKeepAliveResult {
    #[serde(rename = "TTL")]
    ttl: Option<Int64>,
}

#[derive(Deserialize, Debug)]
struct LeaseKeepAliveResponse {
    result: Option<LeaseKeepAliveResult>,
}

pub struct EtcdGatewayStore {
    http: reqwest::Client,
    /// e.g. `http://127.0.0.1:2379`
    endpoint: String,
}

impl EtcdGatewayStore {
    pub fn new(endpoint: &str, request_timeout: Duration) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Rejected {
                op: "connect",
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, op: &'static str, path: &str, body: Value) -> StoreResult<T> {
        let url = format!("{}{path}", self.endpoint);
        trace!(%url, op, "etcd request");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable {
                op,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(StoreError::Unavailable {
                op,
                reason: format!("http status {status}"),
            });
        }

        let body = response.text().await.map_err(|e| StoreError::Unavailable {
            op,
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(classify_rejection(op, &body));
        }

        serde_json::from_str(&body).map_err(|e| StoreError::Rejected {
            op,
            reason: format!("unexpected response: {e}"),
        })
    }
}

/// Map a non-2xx gateway body to an error
fn classify_rejection(op: &'static str, body: &str) -> StoreError {
    if body.contains("requested lease not found") {
        // the gateway never tells us which lease; callers re-map the id
        return StoreError::LeaseNotFound(LeaseId(0));
    }
    StoreError::Rejected {
        op,
        reason: body.to_owned(),
    }
}

fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn decode(op: &'static str, s: &str) -> StoreResult<Vec<u8>> {
    BASE64.decode(s).map_err(|e| StoreError::Rejected {
        op,
        reason: format!("invalid base64: {e}"),
    })
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // all 0xff: range to the end of the keyspace
    vec![0]
}

/// Whole seconds, rounded up, at least one
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn put_request(key: &str, value: &[u8], lease: Option<LeaseId>) -> Value {
    let mut request = json!({
        "key": encode(key.as_bytes()),
        "value": encode(value),
    });
    if let Some(lease) = lease {
        request["lease"] = json!(lease.0.to_string());
    }
    request
}

#[async_trait]
impl CoordinationStore for EtcdGatewayStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let response: RangeResponse = self
            .call("get", "/v3/kv/range", json!({ "key": encode(key.as_bytes()) }))
            .await?;

        response
            .kvs
            .first()
            .map(|kv| decode("get", &kv.value))
            .transpose()
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let _: Value = self
            .call("put", "/v3/kv/put", put_request(key, &value, lease))
            .await
            .map_err(|e| with_lease(e, lease))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<bool> {
        let request = json!({
            "compare": [{
                "key": encode(key.as_bytes()),
                "result": "EQUAL",
                "target": "CREATE",
                "create_revision": "0",
            }],
            "success": [{ "request_put": put_request(key, &value, Some(lease)) }],
            "failure": [],
        });

        let response: TxnResponse = self
            .call("put_if_absent", "/v3/kv/txn", request)
            .await
            .map_err(|e| with_lease(e, Some(lease)))?;
        debug!(key, succeeded = response.succeeded, "conditional put");
        Ok(response.succeeded)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let response: DeleteRangeResponse = self
            .call(
                "delete",
                "/v3/kv/deleterange",
                json!({ "key": encode(key.as_bytes()) }),
            )
            .await?;
        Ok(response.deleted.and_then(|d| d.get()).unwrap_or(0) > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let request = json!({
            "compare": [{
                "key": encode(key.as_bytes()),
                "result": "EQUAL",
                "target": "VALUE",
                "value": encode(expected),
            }],
            "success": [{ "request_delete_range": { "key": encode(key.as_bytes()) } }],
            "failure": [],
        });

        let response: TxnResponse = self
            .call("delete_if_equals", "/v3/kv/txn", request)
            .await?;
        Ok(response.succeeded)
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let response: RangeResponse = self
            .call(
                "get_prefix",
                "/v3/kv/range",
                json!({
                    "key": encode(prefix.as_bytes()),
                    "range_end": encode(&prefix_range_end(prefix.as_bytes())),
                }),
            )
            .await?;

        response
            .kvs
            .iter()
            .map(|kv| {
                let key = String::from_utf8(decode("get_prefix", &kv.key)?).map_err(|e| {
                    StoreError::Rejected {
                        op: "get_prefix",
                        reason: format!("non utf-8 key: {e}"),
                    }
                })?;
                Ok((key, decode("get_prefix", &kv.value)?))
            })
            .collect()
    }

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let response: LeaseGrantResponse = self
            .call(
                "lease_grant",
                "/v3/lease/grant",
                json!({ "TTL": ttl_seconds(ttl).to_string() }),
            )
            .await?;

        match (response.id.and_then(|id| id.get()), response.error) {
            (Some(id), None) => Ok(LeaseId(id)),
            (_, error) => Err(StoreError::Rejected {
                op: "lease_grant",
                reason: error.unwrap_or_else(|| "no lease id in response".into()),
            }),
        }
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let response: LeaseKeepAliveResponse = self
            .call(
                "lease_keep_alive",
                "/v3/lease/keepalive",
                json!({ "ID": lease.0.to_string() }),
            )
            .await
            .map_err(|e| with_lease(e, Some(lease)))?;

        // an expired lease is answered with a missing or non-positive TTL
        match response.result.and_then(|r| r.ttl).and_then(|ttl| ttl.get()) {
            Some(ttl) if 0 < ttl => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        match self
            .call::<Value>(
                "lease_revoke",
                "/v3/lease/revoke",
                json!({ "ID": lease.0.to_string() }),
            )
            .await
        {
            Ok(_) | Err(StoreError::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn with_lease(e: StoreError, lease: Option<LeaseId>) -> StoreError {
    match (e, lease) {
        (StoreError::LeaseNotFound(_), Some(lease)) => StoreError::LeaseNotFound(lease),
        (e, _) => e,
    }
}

#[test]
fn range_end_for_prefix() {
    assert_eq!(prefix_range_end(b"/bots/s/health/"), b"/bots/s/health0".to_vec());
    assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
    assert_eq!(prefix_range_end(b"\xff\xff"), vec![0]);
}

#[test]
fn ttl_rounds_up_to_seconds() {
    assert_eq!(ttl_seconds(Duration::from_secs(15)), 15);
    assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
    assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
}

#[test]
fn lease_not_found_body_is_classified() {
    assert_eq!(
        with_lease(
            classify_rejection("put", r#"{"error":"etcdserver: requested lease not found","code":5}"#),
            Some(LeaseId(7))
        ),
        StoreError::LeaseNotFound(LeaseId(7))
    );
    assert!(matches!(
        classify_rejection("put", "permission denied"),
        StoreError::Rejected { op: "put", .. }
    ));
}

#[test]
fn gateway_int64_parsing() {
    let response: LeaseKeepAliveResponse =
        serde_json::from_str(r#"{"result":{"ID":"7587","TTL":"15"}}"#).unwrap();
    assert_eq!(response.result.unwrap().ttl.unwrap().get(), Some(15));

    let response: LeaseGrantResponse = serde_json::from_str(r#"{"ID":7587,"TTL":15}"#).unwrap();
    assert_eq!(response.id.unwrap().get(), Some(7587));
}
