//! DynamoDB adapter for the pool store
//!
//! One table keyed by `sandbox_id` with three sparse GSIs (`by_status`,
//! `by_owner`, `by_idem`), each sorted by `allocated_at`. Every mutation that
//! must be exclusive carries a `ConditionExpression`; a failed condition is
//! reported as an outcome, not an error. Throttling surfaces as
//! `StoreError::Transient` so callers can back off.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_dynamodb::config::BehaviorVersion;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::config::StoreConfig;
use crate::models::{SandboxRecord, SandboxStatus};
use crate::store::{
    ClaimOutcome, DestroyFailure, Page, ReleaseOutcome, SandboxStore, StoreError,
};

pub struct DynamoStore {
    client: Client,
    table: String,
    gsi_status: String,
    gsi_owner: String,
    gsi_idem: String,
}

/// Every store call carries an explicit deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

impl DynamoStore {
    /// Build a client from the ambient AWS environment, honoring the
    /// local-dev endpoint override.
    pub async fn connect(cfg: &StoreConfig) -> Self {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_timeout(OPERATION_TIMEOUT)
            .build();
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()))
            .timeout_config(timeouts)
            .load()
            .await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            table: cfg.table_name.clone(),
            gsi_status: cfg.gsi1_name.clone(),
            gsi_owner: cfg.gsi2_name.clone(),
            gsi_idem: cfg.gsi3_name.clone(),
        }
    }

    async fn query_index(
        &self,
        index: &str,
        key_condition: &str,
        names: Vec<(&str, &str)>,
        values: Vec<(&str, AttributeValue)>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let mut req = self
            .client
            .query()
            .table_name(&self.table)
            .index_name(index)
            .key_condition_expression(key_condition)
            .scan_index_forward(true)
            .limit(limit as i32);
        for (placeholder, name) in names {
            req = req.expression_attribute_names(placeholder, name);
        }
        for (placeholder, value) in values {
            req = req.expression_attribute_values(placeholder, value);
        }
        if let Some(cursor) = cursor {
            req = req.set_exclusive_start_key(Some(decode_cursor(cursor)?));
        }

        let out = req
            .send()
            .await
            .map_err(|e| classify_sdk_error("query", &e))?;

        let items = out
            .items()
            .iter()
            .map(from_item)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = out
            .last_evaluated_key()
            .map(encode_cursor)
            .transpose()?;

        Ok(Page { items, next_cursor })
    }
}

#[async_trait]
impl SandboxStore for DynamoStore {
    async fn get(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get", &e))?;

        out.item().map(from_item).transpose()
    }

    async fn put(&self, record: &SandboxRecord) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_item(record)))
            .send()
            .await
            .map_err(|e| classify_sdk_error("put", &e))?;
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete", &e))?;
        Ok(())
    }

    async fn atomic_claim(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        track_name: Option<&str>,
        now: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut update = "SET #st = :allocated, allocated_to_sandbox_id = :consumer, \
                          allocated_at = :now, idempotency_key = :consumer, updated_at = :now"
            .to_string();
        let mut req = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression("#st = :available")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":available", s(SandboxStatus::Available.as_str()))
            .expression_attribute_values(":allocated", s(SandboxStatus::Allocated.as_str()))
            .expression_attribute_values(":consumer", s(consumer_id))
            .expression_attribute_values(":now", n(now))
            .return_values(ReturnValue::AllNew);
        if let Some(track) = track_name {
            update.push_str(", track_name = :track");
            req = req.expression_attribute_values(":track", s(track));
        }

        match req.update_expression(update).send().await {
            Ok(out) => {
                let item = out
                    .attributes()
                    .ok_or_else(|| StoreError::Internal("claim returned no attributes".into()))?;
                Ok(ClaimOutcome::Claimed(from_item(item)?))
            }
            Err(e) if is_condition_failed(&e) => Ok(ClaimOutcome::Conflict),
            Err(e) => Err(classify_sdk_error("atomic_claim", &e)),
        }
    }

    async fn atomic_release(
        &self,
        sandbox_id: &str,
        consumer_id: &str,
        now: i64,
        max_hold_seconds: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression(
                "#st = :allocated AND allocated_to_sandbox_id = :consumer \
                 AND allocated_at > :min_allocated",
            )
            .update_expression(
                "SET #st = :pending, deletion_requested_at = :now, updated_at = :now",
            )
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":allocated", s(SandboxStatus::Allocated.as_str()))
            .expression_attribute_values(":pending", s(SandboxStatus::PendingDeletion.as_str()))
            .expression_attribute_values(":consumer", s(consumer_id))
            .expression_attribute_values(":now", n(now))
            .expression_attribute_values(":min_allocated", n(now - max_hold_seconds))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(out) => {
                let item = out
                    .attributes()
                    .ok_or_else(|| StoreError::Internal("release returned no attributes".into()))?;
                Ok(ReleaseOutcome::Released(from_item(item)?))
            }
            Err(e) if is_condition_failed(&e) => {
                // Disambiguate the three failure reasons with a follow-up read
                match self.get(sandbox_id).await? {
                    None => Ok(ReleaseOutcome::NotFound),
                    Some(rec)
                        if rec.status == SandboxStatus::Allocated
                            && rec.allocated_to_sandbox_id.as_deref() == Some(consumer_id) =>
                    {
                        Ok(ReleaseOutcome::Expired)
                    }
                    Some(_) => Ok(ReleaseOutcome::NotOwner),
                }
            }
            Err(e) => Err(classify_sdk_error("atomic_release", &e)),
        }
    }

    async fn expire_allocation(
        &self,
        sandbox_id: &str,
        cutoff: i64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression("#st = :allocated AND allocated_at < :cutoff")
            .update_expression(
                "SET #st = :pending, deletion_requested_at = :now, updated_at = :now",
            )
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":allocated", s(SandboxStatus::Allocated.as_str()))
            .expression_attribute_values(":pending", s(SandboxStatus::PendingDeletion.as_str()))
            .expression_attribute_values(":cutoff", n(cutoff))
            .expression_attribute_values(":now", n(now))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_condition_failed(&e) => Ok(false),
            Err(e) => Err(classify_sdk_error("expire_allocation", &e)),
        }
    }

    async fn mark_stale_if_available(
        &self,
        sandbox_id: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression("#st = :available")
            .update_expression("SET #st = :stale, updated_at = :now")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":available", s(SandboxStatus::Available.as_str()))
            .expression_attribute_values(":stale", s(SandboxStatus::Stale.as_str()))
            .expression_attribute_values(":now", n(now))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_condition_failed(&e) => Ok(false),
            Err(e) => Err(classify_sdk_error("mark_stale_if_available", &e)),
        }
    }

    async fn sync_upsert(&self, record: &SandboxRecord) -> Result<bool, StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_item(record)))
            .condition_expression("attribute_not_exists(sandbox_id) OR #st = :available")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":available", s(SandboxStatus::Available.as_str()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_condition_failed(&e) => Ok(false),
            Err(e) => Err(classify_sdk_error("sync_upsert", &e)),
        }
    }

    async fn record_destroy_failure(
        &self,
        sandbox_id: &str,
        now: i64,
        max_attempts: i64,
    ) -> Result<DestroyFailure, StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression("#st = :pending")
            .update_expression("SET updated_at = :now ADD deletion_retry_count :one")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":pending", s(SandboxStatus::PendingDeletion.as_str()))
            .expression_attribute_values(":now", n(now))
            .expression_attribute_values(":one", n(1))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        let attempts = match result {
            Ok(out) => out
                .attributes()
                .and_then(|item| item.get("deletion_retry_count"))
                .and_then(|v| v.as_n().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0),
            // Record moved on (deleted or already failed) between our destroy
            // attempt and this write
            Err(e) if is_condition_failed(&e) => return Ok(DestroyFailure::Retried { attempts: 0 }),
            Err(e) => return Err(classify_sdk_error("record_destroy_failure", &e)),
        };

        if attempts < max_attempts {
            return Ok(DestroyFailure::Retried { attempts });
        }

        let parked = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("sandbox_id", s(sandbox_id))
            .condition_expression("#st = :pending")
            .update_expression("SET #st = :failed, updated_at = :now")
            .expression_attribute_names("#st", "status")
            .expression_attribute_values(":pending", s(SandboxStatus::PendingDeletion.as_str()))
            .expression_attribute_values(":failed", s(SandboxStatus::DeletionFailed.as_str()))
            .expression_attribute_values(":now", n(now))
            .send()
            .await;

        match parked {
            Ok(_) => Ok(DestroyFailure::MarkedFailed),
            Err(e) if is_condition_failed(&e) => Ok(DestroyFailure::Retried { attempts }),
            Err(e) => Err(classify_sdk_error("record_destroy_failure", &e)),
        }
    }

    async fn query_by_status(
        &self,
        status: SandboxStatus,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.query_index(
            &self.gsi_status,
            "#st = :status",
            vec![("#st", "status")],
            vec![(":status", s(status.as_str()))],
            limit,
            cursor,
        )
        .await
    }

    async fn query_by_status_older_than(
        &self,
        status: SandboxStatus,
        cutoff: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        self.query_index(
            &self.gsi_status,
            "#st = :status AND allocated_at < :cutoff",
            vec![("#st", "status")],
            vec![(":status", s(status.as_str())), (":cutoff", n(cutoff))],
            limit,
            cursor,
        )
        .await
    }

    async fn query_by_owner(
        &self,
        consumer_id: &str,
    ) -> Result<Option<SandboxRecord>, StoreError> {
        let page = self
            .query_index(
                &self.gsi_owner,
                "allocated_to_sandbox_id = :consumer",
                vec![],
                vec![(":consumer", s(consumer_id))],
                1,
                None,
            )
            .await?;
        Ok(page.items.into_iter().next())
    }

    async fn query_by_idem(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<SandboxRecord>, StoreError> {
        let page = self
            .query_index(
                &self.gsi_idem,
                "idempotency_key = :key",
                vec![],
                vec![(":key", s(idempotency_key))],
                1,
                None,
            )
            .await?;
        Ok(page.items.into_iter().next())
    }

    async fn scan(
        &self,
        status: Option<SandboxStatus>,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let mut req = self
            .client
            .scan()
            .table_name(&self.table)
            .limit(limit as i32);
        if let Some(status) = status {
            req = req
                .filter_expression("#st = :status")
                .expression_attribute_names("#st", "status")
                .expression_attribute_values(":status", s(status.as_str()));
        }
        if let Some(cursor) = cursor {
            req = req.set_exclusive_start_key(Some(decode_cursor(cursor)?));
        }

        let out = req
            .send()
            .await
            .map_err(|e| classify_sdk_error("scan", &e))?;

        let items = out
            .items()
            .iter()
            .map(from_item)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = out
            .last_evaluated_key()
            .map(encode_cursor)
            .transpose()?;

        Ok(Page { items, next_cursor })
    }
}

fn s(v: impl Into<String>) -> AttributeValue {
    AttributeValue::S(v.into())
}

fn n(v: i64) -> AttributeValue {
    AttributeValue::N(v.to_string())
}

fn to_item(rec: &SandboxRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("sandbox_id".to_string(), s(&rec.sandbox_id)),
        ("name".to_string(), s(&rec.name)),
        ("external_id".to_string(), s(&rec.external_id)),
        ("status".to_string(), s(rec.status.as_str())),
        ("allocated_at".to_string(), n(rec.allocated_at)),
        ("deletion_retry_count".to_string(), n(rec.deletion_retry_count)),
        ("created_at".to_string(), n(rec.created_at)),
        ("updated_at".to_string(), n(rec.updated_at)),
        ("lab_duration_hours".to_string(), n(rec.lab_duration_hours)),
    ]);
    if let Some(v) = &rec.allocated_to_sandbox_id {
        item.insert("allocated_to_sandbox_id".to_string(), s(v));
    }
    if let Some(v) = &rec.track_name {
        item.insert("track_name".to_string(), s(v));
    }
    if let Some(v) = &rec.idempotency_key {
        item.insert("idempotency_key".to_string(), s(v));
    }
    if let Some(v) = rec.deletion_requested_at {
        item.insert("deletion_requested_at".to_string(), n(v));
    }
    if let Some(v) = rec.last_synced {
        item.insert("last_synced".to_string(), n(v));
    }
    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<SandboxRecord, StoreError> {
    let status_raw = get_s(item, "status")?;
    let status = SandboxStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Internal(format!("unknown status: {}", status_raw)))?;

    Ok(SandboxRecord {
        sandbox_id: get_s(item, "sandbox_id")?,
        name: get_s(item, "name")?,
        external_id: get_s(item, "external_id")?,
        status,
        allocated_to_sandbox_id: opt_s(item, "allocated_to_sandbox_id"),
        track_name: opt_s(item, "track_name"),
        allocated_at: get_n(item, "allocated_at")?,
        idempotency_key: opt_s(item, "idempotency_key"),
        deletion_requested_at: opt_n(item, "deletion_requested_at"),
        deletion_retry_count: get_n(item, "deletion_retry_count").unwrap_or(0),
        last_synced: opt_n(item, "last_synced"),
        created_at: get_n(item, "created_at")?,
        updated_at: get_n(item, "updated_at")?,
        lab_duration_hours: get_n(item, "lab_duration_hours").unwrap_or(4),
    })
}

fn get_s(item: &HashMap<String, AttributeValue>, key: &str) -> Result<String, StoreError> {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StoreError::Internal(format!("missing string attribute: {}", key)))
}

fn opt_s(item: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    item.get(key).and_then(|v| v.as_s().ok()).cloned()
}

fn get_n(item: &HashMap<String, AttributeValue>, key: &str) -> Result<i64, StoreError> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::Internal(format!("missing numeric attribute: {}", key)))
}

fn opt_n(item: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
}

/// Opaque page cursor: the DynamoDB `LastEvaluatedKey` as base64 JSON.
/// Only S and N attribute types occur in this table's keys.
fn encode_cursor(key: &HashMap<String, AttributeValue>) -> Result<String, StoreError> {
    let mut map = serde_json::Map::new();
    for (attr, value) in key {
        let encoded = match value {
            AttributeValue::S(v) => serde_json::json!({ "S": v }),
            AttributeValue::N(v) => serde_json::json!({ "N": v }),
            other => {
                return Err(StoreError::Internal(format!(
                    "unsupported key attribute type for {}: {:?}",
                    attr, other
                )))
            }
        };
        map.insert(attr.clone(), encoded);
    }
    Ok(URL_SAFE_NO_PAD.encode(serde_json::Value::Object(map).to_string()))
}

fn decode_cursor(cursor: &str) -> Result<HashMap<String, AttributeValue>, StoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| StoreError::Internal(format!("invalid cursor: {}", e)))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Internal(format!("invalid cursor: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| StoreError::Internal("invalid cursor: not an object".into()))?;

    let mut key = HashMap::new();
    for (attr, encoded) in object {
        let av = if let Some(v) = encoded.get("S").and_then(|v| v.as_str()) {
            AttributeValue::S(v.to_string())
        } else if let Some(v) = encoded.get("N").and_then(|v| v.as_str()) {
            AttributeValue::N(v.to_string())
        } else {
            return Err(StoreError::Internal(format!(
                "invalid cursor attribute: {}",
                attr
            )));
        };
        key.insert(attr.clone(), av);
    }
    Ok(key)
}

fn is_condition_failed<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.as_service_error()
        .map(|e| e.meta().code() == Some("ConditionalCheckFailedException"))
        .unwrap_or(false)
}

fn classify_sdk_error<E, R>(op: &str, err: &SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StoreError::Transient(format!("{}: transport failure", op))
        }
        SdkError::ServiceError(_) => {
            let code = err
                .as_service_error()
                .and_then(|e| e.meta().code())
                .unwrap_or("unknown");
            let message = err
                .as_service_error()
                .and_then(|e| e.meta().message())
                .unwrap_or("");
            match code {
                "ProvisionedThroughputExceededException"
                | "ThrottlingException"
                | "RequestLimitExceeded"
                | "InternalServerError"
                | "ServiceUnavailable" => {
                    StoreError::Transient(format!("{}: {} {}", op, code, message))
                }
                _ => StoreError::Internal(format!("{}: {} {}", op, code, message)),
            }
        }
        _ => StoreError::Internal(format!("{}: request failed", op)),
    }
}
