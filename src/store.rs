//! Postgres persistence: the `incidents` / `incident_events` tables and the
//! fingerprint-keyed advisory lock facility.
//!
//! Events are append-only; nothing here updates or deletes a row in
//! `incident_events`. The advisory lock is session-scoped: the guard owns
//! one pooled connection for its whole lifetime and releases on that same
//! session, so a dying process can never strand a lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{FromRow, Postgres};
use thiserror::Error;
use tracing::warn;

use crate::config::DB_ACQUIRE_TIMEOUT;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The pool had no free connection within the acquire deadline. The
    /// ingress maps this to 503 so the alert router retries.
    #[error("database pool saturated")]
    PoolSaturated,
    #[error("database error: {0}")]
    Db(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::PoolSaturated,
            other => Self::Db(other),
        }
    }
}

/// A persisted incident row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Incident {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fingerprint: String,
    pub alertname: Option<String>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub severity: Option<String>,
    pub runbook_id: Option<String>,
    pub status: String,
    pub agent_mode: String,
    pub summary: Option<String>,
}

/// A persisted incident event row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IncidentEvent {
    pub id: i64,
    pub incident_id: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
}

/// A past incident projected for the analysis composer.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PastIncident {
    pub id: i64,
    pub alertname: Option<String>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub runbook_id: Option<String>,
    pub action_taken: Option<String>,
    pub action_recommended: Option<String>,
    pub action_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Event kinds in an incident's append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    WebhookReceived,
    Suppressed,
    Final,
    Analysis,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookReceived => "webhook_received",
            Self::Suppressed => "suppressed",
            Self::Final => "final",
            Self::Analysis => "analysis",
        }
    }
}

/// Identity fields for an incident upsert.
#[derive(Debug, Clone)]
pub struct NewIncident<'a> {
    pub fingerprint: &'a str,
    pub alertname: Option<&'a str>,
    pub namespace: Option<&'a str>,
    pub pod: Option<&'a str>,
    pub severity: Option<&'a str>,
    pub agent_mode: &'a str,
}

/// Map the fingerprint onto Postgres's signed 64-bit advisory-lock keyspace:
/// first 8 bytes of SHA-256, big-endian, masked to 63 bits.
#[must_use]
pub fn advisory_lock_key(fingerprint: &str) -> i64 {
    let digest = Sha256::digest(fingerprint.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    #[allow(clippy::cast_possible_wrap)]
    {
        (u64::from_be_bytes(raw) & (i64::MAX as u64)) as i64
    }
}

/// A held advisory lock. Owns its database session; dropping the guard
/// without [`AdvisoryLock::release`] closes the session, which also releases
/// the lock server-side.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl AdvisoryLock {
    /// Release the lock on its own session and return the connection to the
    /// pool.
    pub async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("select pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(conn.as_mut())
                .await
            {
                warn!(key = self.key, error = %e, "advisory unlock failed; dropping session");
                drop(conn.leak());
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Not released explicitly (cancelled or panicked path): close the
            // session instead of returning a lock-holding connection to the
            // pool. Postgres releases the lock with the session.
            drop(conn.leak());
        }
    }
}

/// Handle over the connection pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(DB_ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Db(e.into()))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Liveness probe; also the ingress backpressure check.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Idempotent incident upsert keyed by the fingerprint unique
    /// constraint. Refreshes identity fields and `updated_at` on conflict.
    pub async fn upsert_incident(&self, new: &NewIncident<'_>) -> Result<Incident, StoreError> {
        let summary = compose_summary(new);
        let incident = sqlx::query_as::<_, Incident>(
            r"
            insert into incidents (fingerprint, alertname, namespace, pod, severity, agent_mode, summary)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (fingerprint) do update set
              updated_at = now(),
              alertname = coalesce(excluded.alertname, incidents.alertname),
              namespace = coalesce(excluded.namespace, incidents.namespace),
              pod = coalesce(excluded.pod, incidents.pod),
              severity = coalesce(excluded.severity, incidents.severity),
              agent_mode = coalesce(excluded.agent_mode, incidents.agent_mode),
              summary = coalesce(excluded.summary, incidents.summary)
            returning id, created_at, updated_at, fingerprint, alertname, namespace, pod,
                      severity, runbook_id, status, agent_mode, summary
            ",
        )
        .bind(new.fingerprint)
        .bind(new.alertname)
        .bind(new.namespace)
        .bind(new.pod)
        .bind(new.severity)
        .bind(new.agent_mode)
        .bind(summary)
        .fetch_one(&self.pool)
        .await?;
        Ok(incident)
    }

    /// Record the runbook the router resolved for this incident.
    pub async fn update_incident_runbook(
        &self,
        incident_id: i64,
        runbook_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("update incidents set runbook_id = $1, updated_at = now() where id = $2")
            .bind(runbook_id)
            .bind(incident_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append one event to an incident's log. Insert-only.
    pub async fn append_event(
        &self,
        incident_id: i64,
        event_type: EventType,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "insert into incident_events (incident_id, event_type, payload)
             values ($1, $2, $3) returning id",
        )
        .bind(incident_id)
        .bind(event_type.as_str())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_incidents(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Incident>, i64), StoreError> {
        let incidents = sqlx::query_as::<_, Incident>(
            "select id, created_at, updated_at, fingerprint, alertname, namespace, pod,
                    severity, runbook_id, status, agent_mode, summary
             from incidents order by updated_at desc limit $1 offset $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("select count(*) from incidents")
            .fetch_one(&self.pool)
            .await?;
        Ok((incidents, total))
    }

    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>, StoreError> {
        let incident = sqlx::query_as::<_, Incident>(
            "select id, created_at, updated_at, fingerprint, alertname, namespace, pod,
                    severity, runbook_id, status, agent_mode, summary
             from incidents where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(incident)
    }

    /// All events for an incident in `(ts, id)` order.
    pub async fn get_events(&self, incident_id: i64) -> Result<Vec<IncidentEvent>, StoreError> {
        let events = sqlx::query_as::<_, IncidentEvent>(
            "select id, incident_id, ts, event_type, payload
             from incident_events where incident_id = $1 order by ts asc, id asc",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Most recent event of one type, if any.
    pub async fn latest_event_of_type(
        &self,
        incident_id: i64,
        event_type: EventType,
    ) -> Result<Option<IncidentEvent>, StoreError> {
        let event = sqlx::query_as::<_, IncidentEvent>(
            "select id, incident_id, ts, event_type, payload
             from incident_events
             where incident_id = $1 and event_type = $2
             order by ts desc, id desc limit 1",
        )
        .bind(incident_id)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    /// The most recent 50 incidents related to the given one: same
    /// alertname, same namespace+pod, or same node (read from each row's
    /// latest webhook labels). The action outcome is projected from each
    /// row's latest `final` event.
    pub async fn query_similar(
        &self,
        incident_id: i64,
        alertname: Option<&str>,
        namespace: Option<&str>,
        pod: Option<&str>,
        node: Option<&str>,
    ) -> Result<Vec<PastIncident>, StoreError> {
        let rows = sqlx::query_as::<_, PastIncident>(
            r"
            select i.id, i.alertname, i.namespace, i.pod, i.runbook_id, i.created_at,
                   f.payload #>> '{state,action_taken}' as action_taken,
                   f.payload #>> '{state,action_recommended}' as action_recommended,
                   f.payload #>> '{state,action_error}' as action_error
            from incidents i
            left join lateral (
                select e.payload from incident_events e
                where e.incident_id = i.id and e.event_type = 'final'
                order by e.ts desc, e.id desc limit 1
            ) f on true
            left join lateral (
                select e.payload #>> '{labels,node}' as node from incident_events e
                where e.incident_id = i.id and e.event_type = 'webhook_received'
                order by e.ts desc, e.id desc limit 1
            ) w on true
            where i.id <> $1
              and (
                  ($2::text is not null and i.alertname = $2)
                  or ($3::text is not null and $4::text is not null
                      and i.namespace = $3 and i.pod = $4)
                  or ($5::text is not null and w.node = $5)
              )
            order by i.created_at desc
            limit 50
            ",
        )
        .bind(incident_id)
        .bind(alertname)
        .bind(namespace)
        .bind(pod)
        .bind(node)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Try to take the fingerprint's advisory lock without blocking.
    /// `None` means another worker holds it: suppress, don't wait.
    pub async fn try_advisory_lock(
        &self,
        fingerprint: &str,
    ) -> Result<Option<AdvisoryLock>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let key = advisory_lock_key(fingerprint);
        let locked: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await?;
        if locked {
            Ok(Some(AdvisoryLock {
                conn: Some(conn),
                key,
            }))
        } else {
            Ok(None)
        }
    }
}

fn compose_summary(new: &NewIncident<'_>) -> String {
    let mut parts = Vec::new();
    if let Some(alertname) = new.alertname {
        parts.push(format!("Alert: {alertname}"));
    }
    if let Some(namespace) = new.namespace {
        parts.push(format!("Namespace: {namespace}"));
    }
    if let Some(pod) = new.pod {
        parts.push(format!("Pod: {pod}"));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_deterministic_and_non_negative() {
        let a = advisory_lock_key("KubePodOOMKilled:demo:app-x:app");
        let b = advisory_lock_key("KubePodOOMKilled:demo:app-x:app");
        assert_eq!(a, b);
        assert!(a >= 0);

        let c = advisory_lock_key("KubePodOOMKilled:demo:app-y:app");
        assert_ne!(a, c);
    }

    #[test]
    fn lock_key_matches_sha256_prefix() {
        // First 8 bytes of sha256("x") big-endian, top bit cleared.
        let digest = Sha256::digest(b"x");
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let expected = (u64::from_be_bytes(raw) & (i64::MAX as u64)) as i64;
        assert_eq!(advisory_lock_key("x"), expected);
    }

    #[test]
    fn summary_composition() {
        let new = NewIncident {
            fingerprint: "fp",
            alertname: Some("KubePodOOMKilled"),
            namespace: Some("demo"),
            pod: None,
            severity: None,
            agent_mode: "recommend",
        };
        assert_eq!(compose_summary(&new), "Alert: KubePodOOMKilled | Namespace: demo");
    }

    #[test]
    fn event_type_names() {
        assert_eq!(EventType::WebhookReceived.as_str(), "webhook_received");
        assert_eq!(EventType::Suppressed.as_str(), "suppressed");
        assert_eq!(EventType::Final.as_str(), "final");
        assert_eq!(EventType::Analysis.as_str(), "analysis");
    }
}
