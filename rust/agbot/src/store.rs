/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Agreement persistence. The `agreements` and `workload_usages` tables
//! are partitioned: each agbot instance reads and writes only its own
//! partition. The `ha_workload_upgrades` table is shared by every
//! instance; its insert-if-absent is a single atomic statement because HA
//! coordination depends on it.

use std::collections::HashMap;

use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::policy::DataVerification;
use crate::AgbotError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct Agreement {
    pub current_agreement_id: String,
    pub org: String,
    pub device_id: String,
    pub device_type: String,
    pub agreement_protocol: String,
    pub pattern: String,
    pub policy_name: String,
    pub service_ids: Vec<String>,
    pub policy: String,
    pub proposal: String,
    pub proposal_hash: String,
    pub proposal_sig: String,
    pub proposal_version: i32,
    pub counter_party_address: String,
    pub data_verification: DataVerification,
    pub governance_interval: u64,
    pub agreement_creation_time: u64,
    pub agreement_finalized_time: u64,
    pub agreement_timedout: u64,
    pub last_policy_update_time: u64,
    pub archived: bool,
}

impl Agreement {
    /// Negotiation started and not yet terminated.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.agreement_creation_time != 0 && self.agreement_timedout == 0
    }

    /// Node type, defaulting to `device` for rows that predate the column.
    #[must_use]
    pub fn device_type(&self) -> &str {
        if self.device_type.is_empty() {
            crate::policy::DEVICE_TYPE_DEVICE
        } else {
            &self.device_type
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkloadUsage {
    pub device_id: String,
    pub policy_name: String,
    pub current_agreement_id: String,
    pub priority: i32,
    pub pending_upgrade: bool,
}

#[derive(Clone, Debug, Default)]
pub struct HaUpgradingWorkload {
    pub org: String,
    pub ha_group: String,
    pub policy_name: String,
    pub device_id: String,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

// Row predicates are plain closures so callers keep the semantics and the
// store stays a dumb table.
pub type AFilter = Box<dyn Fn(&Agreement) -> bool + Send + Sync>;
pub type WuFilter = Box<dyn Fn(&WorkloadUsage) -> bool + Send + Sync>;

#[must_use]
pub fn unarchived_filter() -> AFilter {
    Box::new(|a| !a.archived)
}

#[must_use]
pub fn in_progress_filter() -> AFilter {
    Box::new(Agreement::in_progress)
}

#[must_use]
pub fn policy_name_wu_filter(policy_name: &str) -> WuFilter {
    let name = policy_name.to_string();
    Box::new(move |w| w.policy_name == name)
}

#[must_use]
pub fn agreement_not_kept_wu_filter(kept: Vec<String>) -> WuFilter {
    Box::new(move |w| !kept.contains(&w.current_agreement_id))
}

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait AgreementStore: Send + Sync {
    async fn find_agreements(
        &self,
        filters: &[AFilter],
        protocol: &str,
    ) -> Result<Vec<Agreement>, AgbotError>;

    async fn find_single_agreement_by_id(
        &self,
        agreement_id: &str,
        protocol: &str,
        filters: &[AFilter],
    ) -> Result<Option<Agreement>, AgbotError>;

    /// Create the skeleton row when a proposal attempt begins.
    #[allow(clippy::too_many_arguments)]
    async fn agreement_attempt(
        &self,
        agreement_id: &str,
        org: &str,
        device_id: &str,
        device_type: &str,
        policy_name: &str,
        pattern: &str,
        service_ids: &[String],
        protocol: &str,
    ) -> Result<(), AgbotError>;

    /// Attach the persisted proposal, policy snapshot, data-verification
    /// parameters, and signature material to the row.
    #[allow(clippy::too_many_arguments)]
    async fn agreement_update(
        &self,
        agreement_id: &str,
        proposal: &str,
        policy: &str,
        data_verification: &DataVerification,
        governance_interval: u64,
        hash: &str,
        sig: &str,
        protocol: &str,
        proposal_version: i32,
    ) -> Result<(), AgbotError>;

    /// Record the producer's reply: the counterparty is now known.
    async fn agreement_made(
        &self,
        agreement_id: &str,
        device_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError>;

    async fn agreement_finalized(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError>;

    async fn agreement_timed_out(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError>;

    async fn archive_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError>;

    async fn set_last_policy_update_time(
        &self,
        agreement_id: &str,
        protocol: &str,
        update_time: u64,
    ) -> Result<(), AgbotError>;

    async fn find_single_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>, AgbotError>;

    async fn find_workload_usages(
        &self,
        filters: &[WuFilter],
    ) -> Result<Vec<WorkloadUsage>, AgbotError>;

    async fn upsert_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
        agreement_id: &str,
        priority: i32,
    ) -> Result<(), AgbotError>;

    async fn delete_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError>;

    async fn update_pending_upgrade(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError>;

    async fn get_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<Option<HaUpgradingWorkload>, AgbotError>;

    /// Atomic insert-if-absent across every agbot instance. Returns the
    /// device id that holds the upgrade slot after the call — the caller's
    /// device on a win, the earlier winner otherwise.
    async fn insert_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
        device_id: &str,
    ) -> Result<String, AgbotError>;

    async fn delete_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError>;
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PostgresAgreementStore {
    pool: PgPool,
    partition: String,
}

impl PostgresAgreementStore {
    #[must_use]
    pub fn new(pool: PgPool, partition: &str) -> Self {
        Self {
            pool,
            partition: partition.to_string(),
        }
    }

    /// Create the schema when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AgbotError::Database` when a DDL statement fails.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), AgbotError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agreements (
                 agreement_id TEXT NOT NULL,
                 partition_name TEXT NOT NULL,
                 protocol TEXT NOT NULL,
                 org TEXT NOT NULL DEFAULT '',
                 device_id TEXT NOT NULL DEFAULT '',
                 device_type TEXT NOT NULL DEFAULT 'device',
                 pattern TEXT NOT NULL DEFAULT '',
                 policy_name TEXT NOT NULL DEFAULT '',
                 service_ids JSONB NOT NULL DEFAULT '[]',
                 policy TEXT NOT NULL DEFAULT '',
                 proposal TEXT NOT NULL DEFAULT '',
                 proposal_hash TEXT NOT NULL DEFAULT '',
                 proposal_sig TEXT NOT NULL DEFAULT '',
                 proposal_version INT NOT NULL DEFAULT 0,
                 counter_party_address TEXT NOT NULL DEFAULT '',
                 data_verification JSONB NOT NULL DEFAULT '{}',
                 governance_interval BIGINT NOT NULL DEFAULT 0,
                 creation_time BIGINT NOT NULL DEFAULT 0,
                 finalized_time BIGINT NOT NULL DEFAULT 0,
                 timedout_time BIGINT NOT NULL DEFAULT 0,
                 last_policy_update_time BIGINT NOT NULL DEFAULT 0,
                 archived BOOLEAN NOT NULL DEFAULT false,
                 PRIMARY KEY (agreement_id, protocol, partition_name)
             )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workload_usages (
                 device_id TEXT NOT NULL,
                 policy_name TEXT NOT NULL,
                 partition_name TEXT NOT NULL,
                 current_agreement_id TEXT NOT NULL DEFAULT '',
                 priority INT NOT NULL DEFAULT 0,
                 pending_upgrade BOOLEAN NOT NULL DEFAULT false,
                 PRIMARY KEY (device_id, policy_name, partition_name)
             )",
        )
        .execute(pool)
        .await?;

        // Shared across all agbots, deliberately un-partitioned.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ha_workload_upgrades (
                 org TEXT NOT NULL,
                 ha_group TEXT NOT NULL,
                 policy_name TEXT NOT NULL,
                 device_id TEXT NOT NULL,
                 PRIMARY KEY (org, ha_group, policy_name)
             )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_agreement(row: &sqlx::postgres::PgRow) -> Agreement {
        let service_ids: serde_json::Value = row.get("service_ids");
        let data_verification: serde_json::Value = row.get("data_verification");
        Agreement {
            current_agreement_id: row.get("agreement_id"),
            org: row.get("org"),
            device_id: row.get("device_id"),
            device_type: row.get("device_type"),
            agreement_protocol: row.get("protocol"),
            pattern: row.get("pattern"),
            policy_name: row.get("policy_name"),
            service_ids: serde_json::from_value(service_ids).unwrap_or_default(),
            policy: row.get("policy"),
            proposal: row.get("proposal"),
            proposal_hash: row.get("proposal_hash"),
            proposal_sig: row.get("proposal_sig"),
            proposal_version: row.get("proposal_version"),
            counter_party_address: row.get("counter_party_address"),
            data_verification: serde_json::from_value(data_verification).unwrap_or_default(),
            governance_interval: row.get::<i64, _>("governance_interval").max(0) as u64,
            agreement_creation_time: row.get::<i64, _>("creation_time").max(0) as u64,
            agreement_finalized_time: row.get::<i64, _>("finalized_time").max(0) as u64,
            agreement_timedout: row.get::<i64, _>("timedout_time").max(0) as u64,
            last_policy_update_time: row.get::<i64, _>("last_policy_update_time").max(0) as u64,
            archived: row.get("archived"),
        }
    }

    fn row_to_usage(row: &sqlx::postgres::PgRow) -> WorkloadUsage {
        WorkloadUsage {
            device_id: row.get("device_id"),
            policy_name: row.get("policy_name"),
            current_agreement_id: row.get("current_agreement_id"),
            priority: row.get("priority"),
            pending_upgrade: row.get("pending_upgrade"),
        }
    }
}

#[async_trait::async_trait]
impl AgreementStore for PostgresAgreementStore {
    async fn find_agreements(
        &self,
        filters: &[AFilter],
        protocol: &str,
    ) -> Result<Vec<Agreement>, AgbotError> {
        let rows = sqlx::query("SELECT * FROM agreements WHERE partition_name = $1 AND protocol = $2")
            .bind(&self.partition)
            .bind(protocol)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(Self::row_to_agreement)
            .filter(|a| filters.iter().all(|f| f(a)))
            .collect())
    }

    async fn find_single_agreement_by_id(
        &self,
        agreement_id: &str,
        protocol: &str,
        filters: &[AFilter],
    ) -> Result<Option<Agreement>, AgbotError> {
        let row = sqlx::query(
            "SELECT * FROM agreements
             WHERE agreement_id = $1 AND protocol = $2 AND partition_name = $3",
        )
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .as_ref()
            .map(Self::row_to_agreement)
            .filter(|a| filters.iter().all(|f| f(a))))
    }

    async fn agreement_attempt(
        &self,
        agreement_id: &str,
        org: &str,
        device_id: &str,
        device_type: &str,
        policy_name: &str,
        pattern: &str,
        service_ids: &[String],
        protocol: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "INSERT INTO agreements
                 (agreement_id, partition_name, protocol, org, device_id, device_type,
                  pattern, policy_name, service_ids, creation_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(agreement_id)
        .bind(&self.partition)
        .bind(protocol)
        .bind(org)
        .bind(device_id)
        .bind(device_type)
        .bind(pattern)
        .bind(policy_name)
        .bind(json!(service_ids))
        .bind(now_secs() as i64)
        .execute(&self.pool)
        .await?;
        debug!(agreement_id = %agreement_id, device_id = %device_id, "agreement attempt recorded");
        Ok(())
    }

    async fn agreement_update(
        &self,
        agreement_id: &str,
        proposal: &str,
        policy: &str,
        data_verification: &DataVerification,
        governance_interval: u64,
        hash: &str,
        sig: &str,
        protocol: &str,
        proposal_version: i32,
    ) -> Result<(), AgbotError> {
        let dv = serde_json::to_value(data_verification)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal data verification: {e}")))?;
        let result = sqlx::query(
            "UPDATE agreements
             SET proposal = $1, policy = $2, data_verification = $3,
                 governance_interval = $4, proposal_hash = $5, proposal_sig = $6,
                 proposal_version = $7
             WHERE agreement_id = $8 AND protocol = $9 AND partition_name = $10",
        )
        .bind(proposal)
        .bind(policy)
        .bind(dv)
        .bind(governance_interval as i64)
        .bind(hash)
        .bind(sig)
        .bind(proposal_version)
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AgbotError::NotFound(format!(
                "agreement {agreement_id} not in partition {}",
                self.partition
            )));
        }
        Ok(())
    }

    async fn agreement_made(
        &self,
        agreement_id: &str,
        device_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE agreements SET device_id = $1, counter_party_address = $2
             WHERE agreement_id = $3 AND protocol = $4 AND partition_name = $5",
        )
        .bind(device_id)
        .bind(device_id)
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn agreement_finalized(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE agreements SET finalized_time = $1
             WHERE agreement_id = $2 AND protocol = $3 AND partition_name = $4",
        )
        .bind(now_secs() as i64)
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn agreement_timed_out(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE agreements SET timedout_time = $1
             WHERE agreement_id = $2 AND protocol = $3 AND partition_name = $4",
        )
        .bind(now_secs() as i64)
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE agreements SET archived = true
             WHERE agreement_id = $1 AND protocol = $2 AND partition_name = $3",
        )
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_policy_update_time(
        &self,
        agreement_id: &str,
        protocol: &str,
        update_time: u64,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE agreements SET last_policy_update_time = $1
             WHERE agreement_id = $2 AND protocol = $3 AND partition_name = $4",
        )
        .bind(update_time as i64)
        .bind(agreement_id)
        .bind(protocol)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_single_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>, AgbotError> {
        let row = sqlx::query(
            "SELECT * FROM workload_usages
             WHERE device_id = $1 AND policy_name = $2 AND partition_name = $3",
        )
        .bind(device_id)
        .bind(policy_name)
        .bind(&self.partition)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_usage))
    }

    async fn find_workload_usages(
        &self,
        filters: &[WuFilter],
    ) -> Result<Vec<WorkloadUsage>, AgbotError> {
        let rows = sqlx::query("SELECT * FROM workload_usages WHERE partition_name = $1")
            .bind(&self.partition)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(Self::row_to_usage)
            .filter(|w| filters.iter().all(|f| f(w)))
            .collect())
    }

    async fn upsert_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
        agreement_id: &str,
        priority: i32,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "INSERT INTO workload_usages
                 (device_id, policy_name, partition_name, current_agreement_id, priority)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (device_id, policy_name, partition_name)
             DO UPDATE SET current_agreement_id = $4, priority = $5, pending_upgrade = false",
        )
        .bind(device_id)
        .bind(policy_name)
        .bind(&self.partition)
        .bind(agreement_id)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "DELETE FROM workload_usages
             WHERE device_id = $1 AND policy_name = $2 AND partition_name = $3",
        )
        .bind(device_id)
        .bind(policy_name)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pending_upgrade(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "UPDATE workload_usages SET pending_upgrade = true
             WHERE device_id = $1 AND policy_name = $2 AND partition_name = $3",
        )
        .bind(device_id)
        .bind(policy_name)
        .bind(&self.partition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<Option<HaUpgradingWorkload>, AgbotError> {
        let row = sqlx::query(
            "SELECT * FROM ha_workload_upgrades
             WHERE org = $1 AND ha_group = $2 AND policy_name = $3",
        )
        .bind(org)
        .bind(ha_group)
        .bind(policy_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| HaUpgradingWorkload {
            org: r.get("org"),
            ha_group: r.get("ha_group"),
            policy_name: r.get("policy_name"),
            device_id: r.get("device_id"),
        }))
    }

    async fn insert_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
        device_id: &str,
    ) -> Result<String, AgbotError> {
        // The no-op DO UPDATE makes RETURNING yield the surviving row in
        // one round trip: the caller's device on insert, the earlier
        // winner on conflict. Read-then-write here would reintroduce the
        // race this table exists to close.
        let row = sqlx::query(
            "INSERT INTO ha_workload_upgrades (org, ha_group, policy_name, device_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (org, ha_group, policy_name)
             DO UPDATE SET device_id = ha_workload_upgrades.device_id
             RETURNING device_id",
        )
        .bind(org)
        .bind(ha_group)
        .bind(policy_name)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("device_id"))
    }

    async fn delete_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        sqlx::query(
            "DELETE FROM ha_workload_upgrades
             WHERE org = $1 AND ha_group = $2 AND policy_name = $3",
        )
        .bind(org)
        .bind(ha_group)
        .bind(policy_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    agreements: HashMap<(String, String), Agreement>,
    usages: HashMap<(String, String), WorkloadUsage>,
    ha: HashMap<(String, String, String), String>,
}

/// Single-process store for tests and local development. The HA map is
/// guarded by one mutex, which gives the same insert-if-absent atomicity
/// the Postgres statement provides.
#[derive(Default)]
pub struct MemoryAgreementStore {
    inner: tokio::sync::Mutex<MemInner>,
}

impl MemoryAgreementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test seam: place a fully formed agreement row.
    pub async fn seed_agreement(&self, ag: Agreement) {
        let mut inner = self.inner.lock().await;
        inner.agreements.insert(
            (ag.current_agreement_id.clone(), ag.agreement_protocol.clone()),
            ag,
        );
    }
}

#[async_trait::async_trait]
impl AgreementStore for MemoryAgreementStore {
    async fn find_agreements(
        &self,
        filters: &[AFilter],
        protocol: &str,
    ) -> Result<Vec<Agreement>, AgbotError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agreements
            .values()
            .filter(|a| a.agreement_protocol == protocol)
            .filter(|a| filters.iter().all(|f| f(a)))
            .cloned()
            .collect())
    }

    async fn find_single_agreement_by_id(
        &self,
        agreement_id: &str,
        protocol: &str,
        filters: &[AFilter],
    ) -> Result<Option<Agreement>, AgbotError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agreements
            .get(&(agreement_id.to_string(), protocol.to_string()))
            .filter(|a| filters.iter().all(|f| f(a)))
            .cloned())
    }

    async fn agreement_attempt(
        &self,
        agreement_id: &str,
        org: &str,
        device_id: &str,
        device_type: &str,
        policy_name: &str,
        pattern: &str,
        service_ids: &[String],
        protocol: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        inner.agreements.insert(
            (agreement_id.to_string(), protocol.to_string()),
            Agreement {
                current_agreement_id: agreement_id.to_string(),
                org: org.to_string(),
                device_id: device_id.to_string(),
                device_type: device_type.to_string(),
                agreement_protocol: protocol.to_string(),
                policy_name: policy_name.to_string(),
                pattern: pattern.to_string(),
                service_ids: service_ids.to_vec(),
                agreement_creation_time: now_secs(),
                ..Agreement::default()
            },
        );
        Ok(())
    }

    async fn agreement_update(
        &self,
        agreement_id: &str,
        proposal: &str,
        policy: &str,
        data_verification: &DataVerification,
        governance_interval: u64,
        hash: &str,
        sig: &str,
        protocol: &str,
        proposal_version: i32,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        let ag = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
            .ok_or_else(|| AgbotError::NotFound(format!("agreement {agreement_id} not found")))?;
        ag.proposal = proposal.to_string();
        ag.policy = policy.to_string();
        ag.data_verification = data_verification.clone();
        ag.governance_interval = governance_interval;
        ag.proposal_hash = hash.to_string();
        ag.proposal_sig = sig.to_string();
        ag.proposal_version = proposal_version;
        Ok(())
    }

    async fn agreement_made(
        &self,
        agreement_id: &str,
        device_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(ag) = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
        {
            ag.device_id = device_id.to_string();
            ag.counter_party_address = device_id.to_string();
        }
        Ok(())
    }

    async fn agreement_finalized(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(ag) = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
        {
            ag.agreement_finalized_time = now_secs();
        }
        Ok(())
    }

    async fn agreement_timed_out(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(ag) = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
        {
            ag.agreement_timedout = now_secs();
        }
        Ok(())
    }

    async fn archive_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(ag) = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
        {
            ag.archived = true;
        }
        Ok(())
    }

    async fn set_last_policy_update_time(
        &self,
        agreement_id: &str,
        protocol: &str,
        update_time: u64,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(ag) = inner
            .agreements
            .get_mut(&(agreement_id.to_string(), protocol.to_string()))
        {
            ag.last_policy_update_time = update_time;
        }
        Ok(())
    }

    async fn find_single_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>, AgbotError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .usages
            .get(&(device_id.to_string(), policy_name.to_string()))
            .cloned())
    }

    async fn find_workload_usages(
        &self,
        filters: &[WuFilter],
    ) -> Result<Vec<WorkloadUsage>, AgbotError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .usages
            .values()
            .filter(|w| filters.iter().all(|f| f(w)))
            .cloned()
            .collect())
    }

    async fn upsert_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
        agreement_id: &str,
        priority: i32,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        inner.usages.insert(
            (device_id.to_string(), policy_name.to_string()),
            WorkloadUsage {
                device_id: device_id.to_string(),
                policy_name: policy_name.to_string(),
                current_agreement_id: agreement_id.to_string(),
                priority,
                pending_upgrade: false,
            },
        );
        Ok(())
    }

    async fn delete_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        inner
            .usages
            .remove(&(device_id.to_string(), policy_name.to_string()));
        Ok(())
    }

    async fn update_pending_upgrade(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner
            .usages
            .get_mut(&(device_id.to_string(), policy_name.to_string()))
        {
            w.pending_upgrade = true;
        }
        Ok(())
    }

    async fn get_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<Option<HaUpgradingWorkload>, AgbotError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ha
            .get(&(org.to_string(), ha_group.to_string(), policy_name.to_string()))
            .map(|device_id| HaUpgradingWorkload {
                org: org.to_string(),
                ha_group: ha_group.to_string(),
                policy_name: policy_name.to_string(),
                device_id: device_id.clone(),
            }))
    }

    async fn insert_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
        device_id: &str,
    ) -> Result<String, AgbotError> {
        let mut inner = self.inner.lock().await;
        let winner = inner
            .ha
            .entry((org.to_string(), ha_group.to_string(), policy_name.to_string()))
            .or_insert_with(|| device_id.to_string());
        Ok(winner.clone())
    }

    async fn delete_ha_upgrading_workload(
        &self,
        org: &str,
        ha_group: &str,
        policy_name: &str,
    ) -> Result<(), AgbotError> {
        let mut inner = self.inner.lock().await;
        inner
            .ha
            .remove(&(org.to_string(), ha_group.to_string(), policy_name.to_string()));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn in_progress_agreement(id: &str, policy_name: &str) -> Agreement {
        Agreement {
            current_agreement_id: id.to_string(),
            agreement_protocol: "Basic".to_string(),
            policy_name: policy_name.to_string(),
            device_id: "e2edev/node1".to_string(),
            agreement_creation_time: 100,
            ..Agreement::default()
        }
    }

    #[tokio::test]
    async fn test_filters_compose() {
        let store = MemoryAgreementStore::new();
        let mut active = in_progress_agreement("ag1", "e2edev/weather");
        active.org = "e2edev".to_string();
        store.seed_agreement(active).await;

        let mut ended = in_progress_agreement("ag2", "e2edev/weather");
        ended.agreement_timedout = 200;
        store.seed_agreement(ended).await;

        let mut archived = in_progress_agreement("ag3", "e2edev/weather");
        archived.archived = true;
        store.seed_agreement(archived).await;

        let found = store
            .find_agreements(&[unarchived_filter(), in_progress_filter()], "Basic")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].current_agreement_id, "ag1");
    }

    #[tokio::test]
    async fn test_find_single_respects_filters() {
        let store = MemoryAgreementStore::new();
        let mut ag = in_progress_agreement("ag1", "e2edev/weather");
        ag.archived = true;
        store.seed_agreement(ag).await;

        let found = store
            .find_single_agreement_by_id("ag1", "Basic", &[])
            .await
            .unwrap();
        assert!(found.is_some());

        let found = store
            .find_single_agreement_by_id("ag1", "Basic", &[unarchived_filter()])
            .await
            .unwrap();
        assert!(found.is_none(), "archived row filtered out");
    }

    #[tokio::test]
    async fn test_agreement_lifecycle_updates() {
        let store = MemoryAgreementStore::new();
        store
            .agreement_attempt(
                "ag1",
                "e2edev",
                "e2edev/node1",
                "device",
                "e2edev/weather",
                "",
                &["e2edev/svc1".to_string()],
                "Basic",
            )
            .await
            .unwrap();

        store
            .agreement_update(
                "ag1",
                "proposal-json",
                "policy-json",
                &DataVerification::default(),
                10,
                "hash",
                "sig",
                "Basic",
                2,
            )
            .await
            .unwrap();
        store.agreement_made("ag1", "e2edev/node1", "Basic").await.unwrap();
        store.agreement_finalized("ag1", "Basic").await.unwrap();

        let ag = store
            .find_single_agreement_by_id("ag1", "Basic", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(ag.in_progress());
        assert_eq!(ag.proposal, "proposal-json");
        assert_eq!(ag.counter_party_address, "e2edev/node1", "reply recorded");
        assert!(ag.agreement_finalized_time > 0);

        store.agreement_timed_out("ag1", "Basic").await.unwrap();
        store.archive_agreement("ag1", "Basic").await.unwrap();
        let ag = store
            .find_single_agreement_by_id("ag1", "Basic", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(!ag.in_progress());
        assert!(ag.archived);
    }

    #[tokio::test]
    async fn test_agreement_update_missing_row() {
        let store = MemoryAgreementStore::new();
        let err = store
            .agreement_update(
                "nope",
                "p",
                "p",
                &DataVerification::default(),
                10,
                "h",
                "s",
                "Basic",
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgbotError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_workload_usage_filters() {
        let store = MemoryAgreementStore::new();
        store
            .upsert_workload_usage("e2edev/node1", "e2edev/weather", "ag1", 2)
            .await
            .unwrap();
        store
            .upsert_workload_usage("e2edev/node2", "e2edev/weather", "ag2", 1)
            .await
            .unwrap();
        store
            .upsert_workload_usage("e2edev/node3", "e2edev/other", "ag3", 1)
            .await
            .unwrap();

        let matched = store
            .find_workload_usages(&[
                policy_name_wu_filter("e2edev/weather"),
                agreement_not_kept_wu_filter(vec!["ag1".to_string()]),
            ])
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].device_id, "e2edev/node2");
    }

    #[tokio::test]
    async fn test_pending_upgrade_flag() {
        let store = MemoryAgreementStore::new();
        store
            .upsert_workload_usage("e2edev/node1", "e2edev/weather", "ag1", 2)
            .await
            .unwrap();
        store
            .update_pending_upgrade("e2edev/node1", "e2edev/weather")
            .await
            .unwrap();
        let wu = store
            .find_single_workload_usage("e2edev/node1", "e2edev/weather")
            .await
            .unwrap()
            .unwrap();
        assert!(wu.pending_upgrade);
    }

    #[tokio::test]
    async fn test_ha_insert_if_absent_single_winner() {
        let store = Arc::new(MemoryAgreementStore::new());

        // Three concurrent agbots race to claim the upgrade slot for the
        // same HA group and policy.
        let mut handles = Vec::new();
        for device in ["e2edev/node1", "e2edev/node2", "e2edev/node3"] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .insert_ha_upgrading_workload("e2edev", "group1", "e2edev/weather", device)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            winners.push(h.await.unwrap());
        }
        let first = winners[0].clone();
        assert!(winners.iter().all(|w| *w == first), "all callers see one winner");

        let row = store
            .get_ha_upgrading_workload("e2edev", "group1", "e2edev/weather")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.device_id, first);
    }

    #[tokio::test]
    async fn test_ha_delete_frees_slot() {
        let store = MemoryAgreementStore::new();
        store
            .insert_ha_upgrading_workload("e2edev", "group1", "e2edev/weather", "e2edev/node1")
            .await
            .unwrap();
        store
            .delete_ha_upgrading_workload("e2edev", "group1", "e2edev/weather")
            .await
            .unwrap();
        let winner = store
            .insert_ha_upgrading_workload("e2edev", "group1", "e2edev/weather", "e2edev/node2")
            .await
            .unwrap();
        assert_eq!(winner, "e2edev/node2");
    }
}
