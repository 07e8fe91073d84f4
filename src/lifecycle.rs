//! Container lifecycle state machine.
//!
//! ```text
//!              ┌──────────► failed ─────┐
//!   creating ──┤                        │
//!              └──────────► running ◄──►│stopped
//!                                       ▼
//!   (any) ─────────────────────────► deleting ──► archived (history)
//! ```
//!
//! Transitions are validated against a fixed table before the container row
//! is touched. Every attempt, accepted or not, appends an audit row, and the
//! post-transition hooks publish to the configured event sink once the table
//! lock has been dropped.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::events::{Event, EventSink, EventType, deliver};
use crate::model::{
    Actor, AuditEntry, Container, ContainerId, Demand, Requester, Status, TransitionOutcome,
};

/// Whether `from → to` is a legal lifecycle move.
pub fn can_transition(from: Status, to: Status) -> bool {
    use Status::*;
    from == to
        || to == Deleting
        || matches!(
            (from, to),
            (Creating, Running) | (Creating, Failed) | (Running, Stopped) | (Stopped, Running)
        )
}

#[derive(Debug, Default)]
struct Tables {
    active: BTreeMap<ContainerId, Container>,
    history: Vec<Container>,
    audit: Vec<AuditEntry>,
}

pub struct LifecycleManager {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl LifecycleManager {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
            sink,
        }
    }

    pub async fn name_in_use(&self, name: &str) -> bool {
        self.tables
            .read()
            .await
            .active
            .values()
            .any(|c| c.name == name)
    }

    /// Create a container row in `creating`.
    pub async fn insert(
        &self,
        name: &str,
        requester: Requester,
        demand: Demand,
        reserved_period: NaiveDate,
        actor: &Actor,
    ) -> Result<Container> {
        let (container, created) = self
            .insert_deferred(name, requester, demand, reserved_period, actor)
            .await?;
        deliver(self.sink.as_ref(), created).await;
        Ok(container)
    }

    /// Like [`insert`](Self::insert), but hands the `created` event back
    /// instead of delivering it, so a caller holding a lock can publish
    /// after releasing it.
    pub async fn insert_deferred(
        &self,
        name: &str,
        requester: Requester,
        demand: Demand,
        reserved_period: NaiveDate,
        actor: &Actor,
    ) -> Result<(Container, Event)> {
        let container = {
            let mut tables = self.tables.write().await;
            if tables.active.values().any(|c| c.name == name) {
                return Err(EngineError::NameInUse(name.to_string()));
            }

            let id = ContainerId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let now = Utc::now();
            let container = Container {
                id,
                name: name.to_string(),
                requester,
                demand,
                status: Status::Creating,
                address: None,
                created_at: now,
                started_at: None,
                stopped_at: None,
                reserved_period,
                metadata: serde_json::Map::new(),
            };
            tables.audit.push(AuditEntry {
                container: id,
                old_status: None,
                new_status: Status::Creating,
                changed_by: actor.clone(),
                reason: "admitted".into(),
                outcome: TransitionOutcome::Inserted,
                at: now,
            });
            tables.active.insert(id, container.clone());
            container
        };

        info!(container = %container.id, name = %container.name, requester = %requester, "container created");
        let created = Event::new(
            requester.user_id,
            EventType::Created,
            json!({
                "container": container.id,
                "name": container.name,
                "status": container.status,
                "actor": actor.to_string(),
            }),
        );
        Ok((container, created))
    }

    /// Move a container to `to`.
    pub async fn transition(
        &self,
        id: ContainerId,
        to: Status,
        actor: &Actor,
        reason: &str,
    ) -> Result<Container> {
        self.apply(id, to, actor, reason, |_| {}).await
    }

    /// Move a container to `running` and record its address in the same step.
    pub async fn mark_running(
        &self,
        id: ContainerId,
        address: Option<Ipv4Addr>,
        actor: &Actor,
        reason: &str,
    ) -> Result<Container> {
        self.apply(id, Status::Running, actor, reason, |c| {
            if address.is_some() {
                c.address = address;
            }
        })
        .await
    }

    async fn apply<F>(
        &self,
        id: ContainerId,
        to: Status,
        actor: &Actor,
        reason: &str,
        patch: F,
    ) -> Result<Container>
    where
        F: FnOnce(&mut Container),
    {
        let (outcome, from, snapshot) = {
            let mut tables = self.tables.write().await;
            let Tables { active, audit, .. } = &mut *tables;
            let container = active
                .get_mut(&id)
                .ok_or(EngineError::UnknownContainer(id))?;
            let from = container.status;
            let now = Utc::now();

            let outcome = if !can_transition(from, to) {
                TransitionOutcome::Rejected
            } else if from == to {
                TransitionOutcome::NoOp
            } else {
                TransitionOutcome::Applied
            };

            audit.push(AuditEntry {
                container: id,
                old_status: Some(from),
                new_status: to,
                changed_by: actor.clone(),
                reason: reason.to_string(),
                outcome,
                at: now,
            });

            if outcome != TransitionOutcome::Rejected {
                if outcome == TransitionOutcome::Applied {
                    container.status = to;
                    match to {
                        Status::Running => {
                            container.started_at = Some(now);
                            container.stopped_at = None;
                        }
                        Status::Stopped | Status::Failed => container.stopped_at = Some(now),
                        Status::Creating | Status::Deleting => {}
                    }
                }
                patch(container);
            }
            (outcome, from, container.clone())
        };

        let requester_id = snapshot.requester.user_id;
        match outcome {
            TransitionOutcome::Rejected => {
                warn!(container = %id, %from, %to, actor = %actor, "transition rejected");
                deliver(
                    self.sink.as_ref(),
                    Event::new(
                        requester_id,
                        EventType::TransitionRejected,
                        json!({
                            "container": id,
                            "from": from,
                            "to": to,
                            "reason": reason,
                            "actor": actor.to_string(),
                        }),
                    ),
                )
                .await;
                Err(EngineError::InvalidTransition { container: id, from, to })
            }
            TransitionOutcome::Applied => {
                info!(container = %id, %from, %to, actor = %actor, reason, "status changed");
                deliver(
                    self.sink.as_ref(),
                    Event::new(
                        requester_id,
                        EventType::StatusChanged,
                        json!({
                            "container": id,
                            "name": snapshot.name,
                            "from": from,
                            "to": to,
                            "address": snapshot.address,
                            "reason": reason,
                            "actor": actor.to_string(),
                        }),
                    ),
                )
                .await;
                Ok(snapshot)
            }
            TransitionOutcome::NoOp | TransitionOutcome::Inserted => Ok(snapshot),
        }
    }

    /// Set one metadata key on an active container.
    pub async fn set_metadata(
        &self,
        id: ContainerId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let container = tables
            .active
            .get_mut(&id)
            .ok_or(EngineError::UnknownContainer(id))?;
        container.metadata.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a `deleting` container from the active set, keeping it in
    /// history.
    pub async fn archive(&self, id: ContainerId) -> Result<Container> {
        let mut tables = self.tables.write().await;
        let status = tables
            .active
            .get(&id)
            .map(|c| c.status)
            .ok_or(EngineError::UnknownContainer(id))?;
        if status != Status::Deleting {
            return Err(EngineError::InvalidTransition {
                container: id,
                from: status,
                to: Status::Deleting,
            });
        }
        let container = tables
            .active
            .remove(&id)
            .ok_or(EngineError::UnknownContainer(id))?;
        tables.history.push(container.clone());
        info!(container = %id, name = %container.name, "container archived");
        Ok(container)
    }

    pub async fn get(&self, id: ContainerId) -> Option<Container> {
        self.tables.read().await.active.get(&id).cloned()
    }

    pub async fn list_active(&self) -> Vec<Container> {
        self.tables.read().await.active.values().cloned().collect()
    }

    pub async fn history(&self) -> Vec<Container> {
        self.tables.read().await.history.clone()
    }

    pub async fn audit_log(&self, id: ContainerId) -> Vec<AuditEntry> {
        self.tables
            .read()
            .await
            .audit
            .iter()
            .filter(|entry| entry.container == id)
            .cloned()
            .collect()
    }

    /// Containers still `creating` that were created before `cutoff`.
    pub async fn creating_before(&self, cutoff: DateTime<Utc>) -> Vec<ContainerId> {
        self.tables
            .read()
            .await
            .active
            .values()
            .filter(|c| c.status == Status::Creating && c.created_at < cutoff)
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastSink;

    fn manager() -> (LifecycleManager, BroadcastSink) {
        let sink = BroadcastSink::new(64);
        (LifecycleManager::new(Arc::new(sink.clone())), sink)
    }

    fn period() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).expect("valid date")
    }

    /// Drive a fresh container into `status` along legal edges.
    async fn container_in(lm: &LifecycleManager, name: &str, status: Status) -> ContainerId {
        let c = lm
            .insert(name, Requester::user(1), Demand::new(1, 256, 256), period(), &Actor::System)
            .await
            .expect("insert");
        let path: &[Status] = match status {
            Status::Creating => &[],
            Status::Running => &[Status::Running],
            Status::Stopped => &[Status::Running, Status::Stopped],
            Status::Failed => &[Status::Failed],
            Status::Deleting => &[Status::Deleting],
        };
        for step in path {
            lm.transition(c.id, *step, &Actor::System, "setup")
                .await
                .expect("setup path is legal");
        }
        c.id
    }

    #[tokio::test]
    async fn transition_table_is_exhaustive() {
        let allowed = [
            (Status::Creating, Status::Running),
            (Status::Creating, Status::Failed),
            (Status::Running, Status::Stopped),
            (Status::Stopped, Status::Running),
        ];

        let (lm, _sink) = manager();
        let mut accepted = 0;
        for (i, from) in Status::ALL.into_iter().enumerate() {
            for (j, to) in Status::ALL.into_iter().enumerate() {
                let id = container_in(&lm, &format!("c-{i}-{j}"), from).await;
                let expected = from == to || to == Status::Deleting || allowed.contains(&(from, to));
                assert_eq!(can_transition(from, to), expected, "{from} -> {to}");

                let result = lm.transition(id, to, &Actor::User(1), "table").await;
                let after = lm.get(id).await.expect("still active").status;
                if expected {
                    accepted += 1;
                    assert!(result.is_ok(), "{from} -> {to} should succeed");
                    assert_eq!(after, to);
                } else {
                    assert!(
                        matches!(result, Err(EngineError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(after, from, "rejected transition must not mutate");
                }
            }
        }
        // 5 self-loops + 4 deleting targets from other states + 4 listed edges.
        assert_eq!(accepted, 13);
    }

    #[tokio::test]
    async fn every_attempt_is_audited() {
        let (lm, _sink) = manager();
        let id = container_in(&lm, "audited", Status::Creating).await;

        lm.transition(id, Status::Running, &Actor::System, "ready").await.expect("legal");
        lm.transition(id, Status::Running, &Actor::System, "again").await.expect("no-op");
        lm.transition(id, Status::Creating, &Actor::User(1), "rewind")
            .await
            .expect_err("illegal");

        let outcomes: Vec<_> = lm.audit_log(id).await.into_iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                TransitionOutcome::Inserted,
                TransitionOutcome::Applied,
                TransitionOutcome::NoOp,
                TransitionOutcome::Rejected,
            ]
        );
    }

    #[tokio::test]
    async fn running_records_address_and_notifies_owner() {
        let (lm, sink) = manager();
        let mut rx = sink.subscribe();
        let id = container_in(&lm, "notified", Status::Creating).await;
        let created = rx.recv().await.expect("created event");
        assert_eq!(created.event_type, EventType::Created);

        let addr = Ipv4Addr::new(10, 0, 3, 17);
        let c = lm
            .mark_running(id, Some(addr), &Actor::System, "ready")
            .await
            .expect("legal");
        assert_eq!(c.address, Some(addr));
        assert!(c.started_at.is_some());

        let changed = rx.recv().await.expect("status event");
        assert_eq!(changed.event_type, EventType::StatusChanged);
        assert_eq!(changed.requester_id, 1);
        assert_eq!(changed.payload["to"], "running");
    }

    #[tokio::test]
    async fn duplicate_active_name_is_refused() {
        let (lm, _sink) = manager();
        container_in(&lm, "dup", Status::Creating).await;
        let err = lm
            .insert("dup", Requester::user(2), Demand::default(), period(), &Actor::System)
            .await
            .expect_err("name taken");
        assert!(matches!(err, EngineError::NameInUse(_)));
    }

    #[tokio::test]
    async fn archive_requires_deleting_and_keeps_history() {
        let (lm, _sink) = manager();
        let id = container_in(&lm, "old", Status::Running).await;
        assert!(lm.archive(id).await.is_err());

        lm.transition(id, Status::Deleting, &Actor::System, "delete").await.expect("legal");
        let archived = lm.archive(id).await.expect("archive");

        assert_eq!(archived.status, Status::Deleting);
        assert!(lm.get(id).await.is_none());
        assert_eq!(lm.history().await.len(), 1);
        assert!(!lm.name_in_use("old").await, "archived names can be reused");
    }
}
