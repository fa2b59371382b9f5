//! Pool data model
//!
//! One entity: the sandbox record, keyed by the CSP-assigned `sandbox_id`.
//! A record is created by the sync loop, claimed by a consumer, released (or
//! auto-expired) into `pending_deletion`, and removed once the CSP object is
//! destroyed. Records that disappear from the CSP while still `available`
//! become `stale` and are purged after a grace window.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a pooled sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Available,
    Allocated,
    PendingDeletion,
    Stale,
    DeletionFailed,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 5] = [
        SandboxStatus::Available,
        SandboxStatus::Allocated,
        SandboxStatus::PendingDeletion,
        SandboxStatus::Stale,
        SandboxStatus::DeletionFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Available => "available",
            SandboxStatus::Allocated => "allocated",
            SandboxStatus::PendingDeletion => "pending_deletion",
            SandboxStatus::Stale => "stale",
            SandboxStatus::DeletionFailed => "deletion_failed",
        }
    }

    pub fn parse(s: &str) -> Option<SandboxStatus> {
        match s {
            "available" => Some(SandboxStatus::Available),
            "allocated" => Some(SandboxStatus::Allocated),
            "pending_deletion" => Some(SandboxStatus::PendingDeletion),
            "stale" => Some(SandboxStatus::Stale),
            "deletion_failed" => Some(SandboxStatus::DeletionFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pooled sandbox account
///
/// `allocated_at` is 0 while the record is `available` so the status index
/// can use it as a sort key without gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub name: String,
    /// Opaque handle used when asking the CSP to destroy the account
    pub external_id: String,
    pub status: SandboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_to_sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    pub allocated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<i64>,
    pub deletion_retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub lab_duration_hours: i64,
}

impl SandboxRecord {
    /// A fresh `available` record as written by the sync loop
    pub fn available(
        sandbox_id: impl Into<String>,
        name: impl Into<String>,
        external_id: impl Into<String>,
        created_at: i64,
        now: i64,
        lab_duration_hours: i64,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            name: name.into(),
            external_id: external_id.into(),
            status: SandboxStatus::Available,
            allocated_to_sandbox_id: None,
            track_name: None,
            allocated_at: 0,
            idempotency_key: None,
            deletion_requested_at: None,
            deletion_retry_count: 0,
            last_synced: Some(now),
            created_at,
            updated_at: now,
            lab_duration_hours,
        }
    }

    /// End of the hold window; meaningful only for allocated records
    pub fn expires_at(&self) -> i64 {
        self.allocated_at + self.lab_duration_hours * 3600
    }
}
