//! Durable Session Records: creation, lookup, staleness detection, and the
//! tier-aware concurrency cap.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::colab::api_client::ColabApiClient;
use crate::colab::{Tier, Variant};
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::runtime_manager::{AssignRequest, RuntimeManager};

/// A durable, CLI-level user session pinned to a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session id.
    pub id: Uuid,
    /// Human-chosen or auto-generated label.
    pub label: String,
    /// The compute variant this session's runtime provides.
    pub variant: Variant,
    /// The pinned runtime's accelerator, e.g. `"T4"`, `"TPU"`, `"none"`.
    pub accelerator: String,
    /// The pinned runtime's opaque endpoint id. Immutable for this record.
    pub runtime_endpoint: String,
    /// When this record was created.
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    /// When this record was last used for an execution.
    #[serde(with = "time::serde::iso8601")]
    pub last_used_at: OffsetDateTime,
    /// Exactly one record per account has this set at a time.
    pub is_active: bool,
}

/// `listSessions()` enrichment: a record plus live state that cannot be
/// known from the file alone.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// The durable record.
    #[serde(flatten)]
    pub record: SessionRecord,
    /// Whether a live Connection exists for this session.
    pub connected: bool,
    /// Whether `runtime_endpoint` no longer appears in `listAssignments()`.
    pub stale: bool,
}

/// Aggregate counts for `sessions list` / `getStats()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Subscription tier, used to report the concurrency cap.
    pub tier: Tier,
    /// Maximum concurrent sessions permitted for `tier`.
    pub max: usize,
    /// Total durable records.
    pub total: usize,
    /// Records with `is_active = true` (0 or 1).
    pub active: usize,
    /// Records with a live Connection.
    pub connected: usize,
    /// Records whose runtime no longer appears in `listAssignments()`.
    pub stale: usize,
}

struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_locked(&self) -> Result<(Vec<SessionRecord>, File), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;
        file.lock_exclusive()
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;

        let mut contents = String::new();
        let mut reader = &file;
        reader
            .read_to_string(&mut contents)
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;

        let records = if contents.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&contents).map_err(|err| Error::json(self.path.display().to_string(), err))?
        };
        Ok((records, file))
    }

    fn write_locked(&self, file: &File, records: &[SessionRecord]) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|err| Error::json(self.path.display().to_string(), err))?;
        let mut writer = file;
        writer
            .set_len(0)
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;
        use std::io::Seek;
        writer
            .seek(std::io::SeekFrom::Start(0))
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;
        writer
            .write_all(json.as_bytes())
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;
        FileExt::unlock(file).map_err(|err| Error::io(self.path.display().to_string(), err))
    }

    /// Read-modify-write under an exclusive file lock.
    fn update<F>(&self, f: F) -> Result<Vec<SessionRecord>, Error>
    where
        F: FnOnce(&mut Vec<SessionRecord>) -> Result<(), Error>,
    {
        let (mut records, file) = self.read_locked()?;
        f(&mut records)?;
        self.write_locked(&file, &records)?;
        Ok(records)
    }

    fn read(&self) -> Result<Vec<SessionRecord>, Error> {
        let (records, file) = self.read_locked()?;
        let _ = FileExt::unlock(&file);
        Ok(records)
    }
}

/// Resolves the "target session" for every CLI invocation and keeps
/// durable records consistent.
pub struct SessionManager {
    store: SessionStore,
    runtime_manager: RuntimeManager,
    api: ColabApiClient,
    pool: Arc<ConnectionPool>,
}

impl SessionManager {
    /// `sessions_path` is typically `<config dir>/state/sessions.json`.
    pub fn new(
        sessions_path: impl AsRef<Path>,
        runtime_manager: RuntimeManager,
        api: ColabApiClient,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            store: SessionStore::new(sessions_path.as_ref().to_path_buf()),
            runtime_manager,
            api,
            pool,
        }
    }

    /// Central entry point: resolve `target_id` (exact id, then unique
    /// prefix of at least 4 characters), fall back to the active record, or
    /// create a fresh one via the Runtime Manager.
    pub async fn get_or_create_session(
        &self,
        target_id: Option<&str>,
        request: AssignRequest,
    ) -> Result<SessionRecord, Error> {
        if let Some(target) = target_id {
            let id = {
                let records = self.store.read()?;
                resolve_prefix(&records, target)?
            };
            return self.touch_last_used(id).await;
        }

        let active_id = {
            let records = self.store.read()?;
            records.iter().find(|r| r.is_active).map(|r| r.id)
        };
        if let Some(id) = active_id {
            return self.touch_last_used(id).await;
        }

        self.create_session(request).await
    }

    /// Bump `last_used_at` on the given record and return the updated copy.
    async fn touch_last_used(&self, id: Uuid) -> Result<SessionRecord, Error> {
        let records = self.store.update(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::SessionNotFound(format!("no session {id}")))?;
            record.last_used_at = OffsetDateTime::now_utc();
            Ok(())
        })?;

        records
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::SessionNotFound(format!("no session {id}")))
    }

    async fn create_session(&self, request: AssignRequest) -> Result<SessionRecord, Error> {
        let tier = self.pool.tier().await.unwrap_or(Tier::Free);
        let max = tier.max_sessions();

        let records = self.store.read()?;
        if records.len() >= max {
            return Err(Error::SessionLimitExceeded {
                current: records.len(),
                max,
                tier: tier.to_string(),
            });
        }

        let runtime = self.runtime_manager.assign_runtime(&request).await?;
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            label: runtime.label.clone(),
            variant: request.variant,
            accelerator: runtime.accelerator.clone(),
            runtime_endpoint: runtime.endpoint.clone(),
            created_at: now,
            last_used_at: now,
            is_active: true,
        };

        self.store.update(|records| {
            for existing in records.iter_mut() {
                existing.is_active = false;
            }
            records.push(record.clone());
            Ok(())
        })?;

        Ok(record)
    }

    /// Enrich durable records with live connection and staleness state.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, Error> {
        let records = self.store.read()?;
        let assignments = self.api.list_assignments().await?;
        let live_endpoints: std::collections::HashSet<&str> =
            assignments.iter().map(|a| a.endpoint.as_str()).collect();

        Ok(records
            .into_iter()
            .map(|record| {
                let connected = self.pool.get(&record.id.to_string()).is_some();
                let stale = !live_endpoints.contains(record.runtime_endpoint.as_str());
                SessionSummary {
                    record,
                    connected,
                    stale,
                }
            })
            .collect())
    }

    /// Atomically flip `is_active` to the given session.
    pub async fn switch_session(&self, id: &str) -> Result<SessionRecord, Error> {
        let target = {
            let records = self.store.read()?;
            resolve_prefix(&records, id)?
        };

        let records = self.store.update(|records| {
            if !records.iter().any(|r| r.id == target) {
                return Err(Error::SessionNotFound(format!("no session {id:?}")));
            }
            for record in records.iter_mut() {
                record.is_active = record.id == target;
                if record.id == target {
                    record.last_used_at = OffsetDateTime::now_utc();
                }
            }
            Ok(())
        })?;

        records
            .into_iter()
            .find(|r| r.id == target)
            .ok_or_else(|| Error::SessionNotFound(format!("no session {id:?}")))
    }

    /// Remove a session record, shutting down its live Connection first.
    pub async fn delete_session(&self, id: &str) -> Result<(), Error> {
        let target = {
            let records = self.store.read()?;
            resolve_prefix(&records, id)?
        };

        self.pool.remove(&target.to_string()).await?;

        self.store.update(|records| {
            let before = records.len();
            records.retain(|r| r.id != target);
            if records.len() == before {
                return Err(Error::SessionNotFound(format!("no session {id:?}")));
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Remove every stale session record, returning the deleted ids.
    pub async fn clean_stale_sessions(&self) -> Result<Vec<Uuid>, Error> {
        let assignments = self.api.list_assignments().await?;
        let live_endpoints: std::collections::HashSet<String> =
            assignments.into_iter().map(|a| a.endpoint).collect();

        let mut removed = Vec::new();
        self.store.update(|records| {
            let (stale, fresh): (Vec<_>, Vec<_>) = records
                .drain(..)
                .partition(|r| !live_endpoints.contains(&r.runtime_endpoint));
            removed = stale.iter().map(|r| r.id).collect();
            *records = fresh;
            Ok(())
        })?;

        for id in &removed {
            let _ = self.pool.remove(&id.to_string()).await;
        }
        Ok(removed)
    }

    /// Aggregate totals for `status`/`sessions list --stats`.
    pub async fn get_stats(&self) -> Result<SessionStats, Error> {
        let tier = self.pool.tier().await.unwrap_or(Tier::Free);
        let summaries = self.list_sessions().await?;
        Ok(SessionStats {
            tier,
            max: tier.max_sessions(),
            total: summaries.len(),
            active: summaries.iter().filter(|s| s.record.is_active).count(),
            connected: summaries.iter().filter(|s| s.connected).count(),
            stale: summaries.iter().filter(|s| s.stale).count(),
        })
    }
}

/// Resolve a session reference by exact id, then by unique prefix of at
/// least 4 characters. Prefixes shorter than 4 characters are rejected as
/// ambiguous regardless of how many records match.
fn resolve_prefix(records: &[SessionRecord], target: &str) -> Result<Uuid, Error> {
    if let Ok(exact) = Uuid::parse_str(target) {
        if records.iter().any(|r| r.id == exact) {
            return Ok(exact);
        }
    }

    if target.len() < 4 {
        return Err(Error::AmbiguousSession(
            target.to_string(),
            "session references must be at least 4 characters".to_string(),
        ));
    }

    let lowered = target.to_lowercase();
    let matches: Vec<&SessionRecord> = records
        .iter()
        .filter(|r| r.id.to_string().starts_with(&lowered))
        .collect();

    match matches.as_slice() {
        [single] => Ok(single.id),
        [] => Err(Error::SessionNotFound(format!("no session matches {target:?}"))),
        many => Err(Error::AmbiguousSession(
            target.to_string(),
            format!(
                "matches {} sessions: {}",
                many.len(),
                many.iter().map(|r| r.id.to_string()).collect::<Vec<_>>().join(", ")
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid, active: bool) -> SessionRecord {
        let now = OffsetDateTime::now_utc();
        SessionRecord {
            id,
            label: "gpu (T4)".into(),
            variant: Variant::Gpu,
            accelerator: "T4".into(),
            runtime_endpoint: "ep-1".into(),
            created_at: now,
            last_used_at: now,
            is_active: active,
        }
    }

    #[test]
    fn rejects_short_prefix_as_ambiguous_regardless_of_matches() {
        let records = vec![record(Uuid::new_v4(), true)];
        let err = resolve_prefix(&records, "abc").unwrap_err();
        assert!(matches!(err, Error::AmbiguousSession(_, _)));
    }

    #[test]
    fn resolves_unique_prefix() {
        let id = Uuid::new_v4();
        let records = vec![record(id, true)];
        let prefix = &id.to_string()[..8];
        assert_eq!(resolve_prefix(&records, prefix).unwrap(), id);
    }

    #[test]
    fn rejects_ambiguous_long_prefix_when_records_share_it() {
        let id = Uuid::new_v4();
        let mut second = record(Uuid::new_v4(), false);
        let shared_prefix = id.to_string()[..8].to_string();
        second.id = Uuid::parse_str(&format!("{shared_prefix}{}", &Uuid::new_v4().to_string()[8..])).unwrap();
        let records = vec![record(id, true), second];
        let err = resolve_prefix(&records, &shared_prefix).unwrap_err();
        assert!(matches!(err, Error::AmbiguousSession(_, _)));
    }
}
