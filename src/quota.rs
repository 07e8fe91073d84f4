//! Quota ledger: admission control against per-user or per-team ceilings.
//!
//! Usage is accumulated per requester per calendar day. The check and the
//! increment happen under one write lock on the usage table, and the engine
//! additionally runs them inside the requester's reservation lock so the
//! subsequent container insert sees the same decision.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::model::{Demand, Quota, QuotaScope, Requester, UsageCounter};

/// The accounting period a reservation made right now belongs to.
pub fn current_period() -> NaiveDate {
    Utc::now().date_naive()
}

/// Pure admission rule. Unset limits never reject, and a sum that would
/// overflow its counter is a rejection.
pub fn admits(quota: &Quota, usage: &UsageCounter, demand: &Demand) -> bool {
    within(quota.cores_limit.map(u64::from), usage.cores_used, u64::from(demand.cores))
        && within(quota.memory_mb_limit, usage.memory_mb_used, demand.memory_mb)
        && within(quota.disk_mb_limit, usage.storage_mb_used, demand.disk_mb)
        && within(
            quota.max_concurrent_containers.map(u64::from),
            u64::from(usage.concurrent_containers),
            1,
        )
}

fn within(limit: Option<u64>, used: u64, add: u64) -> bool {
    match (limit, used.checked_add(add)) {
        (None, _) => true,
        (Some(limit), Some(total)) => total <= limit,
        (Some(_), None) => false,
    }
}

#[derive(Debug, Default)]
pub struct QuotaLedger {
    quotas: RwLock<HashMap<(QuotaScope, u64), Quota>>,
    usage: RwLock<HashMap<(Requester, NaiveDate), UsageCounter>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quotas(quotas: impl IntoIterator<Item = Quota>) -> Self {
        let map = quotas
            .into_iter()
            .map(|q| ((q.scope, q.id), q))
            .collect();
        Self {
            quotas: RwLock::new(map),
            usage: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a quota record.
    pub async fn set_quota(&self, quota: Quota) {
        info!(scope = ?quota.scope, id = quota.id, "quota updated");
        self.quotas.write().await.insert((quota.scope, quota.id), quota);
    }

    /// The record consulted for `requester`: the user-level one if present,
    /// otherwise the team-level one. `None` means unlimited.
    pub async fn applicable_quota(&self, requester: &Requester) -> Option<Quota> {
        let quotas = self.quotas.read().await;
        if let Some(q) = quotas.get(&(QuotaScope::User, requester.user_id)) {
            return Some(q.clone());
        }
        requester
            .team_id
            .and_then(|team| quotas.get(&(QuotaScope::Team, team)))
            .cloned()
    }

    /// Admit or reject `demand` for the current period.
    pub async fn check_and_reserve(&self, requester: &Requester, demand: &Demand) -> bool {
        self.check_and_reserve_at(requester, demand, current_period())
            .await
    }

    /// Admit or reject `demand` against the counter for `period`.
    ///
    /// On admission every counter is incremented by the demand and `true` is
    /// returned. On rejection nothing changes.
    pub async fn check_and_reserve_at(
        &self,
        requester: &Requester,
        demand: &Demand,
        period: NaiveDate,
    ) -> bool {
        let quota = self.applicable_quota(requester).await;

        let mut usage = self.usage.write().await;
        let counter = usage
            .entry((*requester, period))
            .or_insert_with(|| UsageCounter::empty(*requester, period));

        if let Some(quota) = &quota {
            if !admits(quota, counter, demand) {
                debug!(
                    requester = %requester,
                    cores_used = counter.cores_used,
                    memory_mb_used = counter.memory_mb_used,
                    storage_mb_used = counter.storage_mb_used,
                    "reservation rejected"
                );
                return false;
            }
        }

        counter.cores_used = counter.cores_used.saturating_add(u64::from(demand.cores));
        counter.memory_mb_used = counter.memory_mb_used.saturating_add(demand.memory_mb);
        counter.storage_mb_used = counter.storage_mb_used.saturating_add(demand.disk_mb);
        counter.concurrent_containers = counter.concurrent_containers.saturating_add(1);

        debug!(requester = %requester, demand = %demand, "reservation admitted");
        true
    }

    /// Return a previously admitted demand to the counter it was charged to.
    pub async fn release(&self, requester: &Requester, demand: &Demand, period: NaiveDate) {
        let mut usage = self.usage.write().await;
        if let Some(counter) = usage.get_mut(&(*requester, period)) {
            counter.cores_used = counter.cores_used.saturating_sub(u64::from(demand.cores));
            counter.memory_mb_used = counter.memory_mb_used.saturating_sub(demand.memory_mb);
            counter.storage_mb_used = counter.storage_mb_used.saturating_sub(demand.disk_mb);
            counter.concurrent_containers = counter.concurrent_containers.saturating_sub(1);
            info!(requester = %requester, demand = %demand, %period, "reservation released");
        }
    }

    pub async fn usage(&self, requester: &Requester, period: NaiveDate) -> Option<UsageCounter> {
        self.usage.read().await.get(&(*requester, period)).cloned()
    }
}
