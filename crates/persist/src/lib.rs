//! Stagehand persistence: SQLite-backed config store holding project stage
//! topology, the per-stage service registry and revisioned resources
//! (charts, umbrella manifests). Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use metrics::{counter, histogram};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use stagehand_core::{
    DeploymentStrategy, Precondition, Resource, ResourceKey, ResourceStore, Stage, StageCatalogue, StoreError,
    StrategySource,
};
use tracing::debug;

/// Stage definition used when creating a project (shipyard entry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDef {
    pub name: String,
    /// Optional pre-existing strategy for the stage.
    pub strategy: Option<DeploymentStrategy>,
}

impl StageDef {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), strategy: None } }

    pub fn with_strategy(mut self, strategy: DeploymentStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Listing row for stored resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub service: Option<String>,
    pub uri: String,
    pub revision: u64,
    pub bytes: usize,
    pub ts: i64,
}

/// SQLite-backed store. Simple, synchronous; calls are short and run inline.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("STAGEHAND_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_secs(5)).ok();
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                ts   INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stages (
                project  TEXT NOT NULL,
                name     TEXT NOT NULL,
                position INTEGER NOT NULL,
                strategy TEXT,
                PRIMARY KEY (project, name)
            );
            CREATE TABLE IF NOT EXISTS services (
                project TEXT NOT NULL,
                stage   TEXT NOT NULL,
                name    TEXT NOT NULL,
                ts      INTEGER NOT NULL,
                PRIMARY KEY (project, stage, name)
            );
            CREATE TABLE IF NOT EXISTS resources (
                project  TEXT NOT NULL,
                stage    TEXT NOT NULL,
                service  TEXT NOT NULL DEFAULT '',
                uri      TEXT NOT NULL,
                content  BLOB NOT NULL,
                revision INTEGER NOT NULL,
                ts       INTEGER NOT NULL,
                PRIMARY KEY (project, stage, service, uri)
            );",
        )
        .context("creating config store tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("config store connection poisoned"))
    }

    /// Create a project with its stages in topology order.
    pub fn create_project(&self, name: &str, stages: &[StageDef]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let exists: Option<String> =
            tx.query_row("SELECT name FROM projects WHERE name = ?1", [name], |r| r.get(0)).optional()?;
        if exists.is_some() {
            bail!("project already exists: {}", name);
        }
        tx.execute("INSERT INTO projects(name, ts) VALUES (?1, ?2)", (name, now_ts()))?;
        for (i, st) in stages.iter().enumerate() {
            tx.execute(
                "INSERT INTO stages(project, name, position, strategy) VALUES (?1, ?2, ?3, ?4)",
                (name, &st.name, i as i64, st.strategy.map(|s| s.as_str())),
            )
            .with_context(|| format!("inserting stage {}", st.name))?;
        }
        tx.commit()?;
        debug!(project = %name, stages = stages.len(), "project created");
        Ok(())
    }

    fn project_exists(db: &Connection, project: &str) -> Result<bool> {
        let found: Option<String> =
            db.query_row("SELECT name FROM projects WHERE name = ?1", [project], |r| r.get(0)).optional()?;
        Ok(found.is_some())
    }

    fn stages_sync(&self, project: &str) -> Result<Vec<Stage>> {
        let db = self.conn()?;
        if !Self::project_exists(&db, project)? {
            bail!("project not found: {}", project);
        }
        let mut stmt = db.prepare("SELECT name, position FROM stages WHERE project = ?1 ORDER BY position ASC")?;
        let mut rows = stmt.query([project])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let position: i64 = row.get(1)?;
            out.push(Stage { name, position: position as u32 });
        }
        Ok(out)
    }

    /// Services registered in a stage, sorted by name.
    pub fn services(&self, project: &str, stage: &str) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT name FROM services WHERE project = ?1 AND stage = ?2 ORDER BY name")?;
        let mut rows = stmt.query((project, stage))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Resources of a stage (stage-level and service-level), sorted by service then uri.
    pub fn list_resources(&self, project: &str, stage: &str) -> Result<Vec<ResourceInfo>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT service, uri, revision, length(content), ts FROM resources
             WHERE project = ?1 AND stage = ?2 ORDER BY service, uri",
        )?;
        let mut rows = stmt.query((project, stage))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let service: String = row.get(0)?;
            let revision: i64 = row.get(2)?;
            let bytes: i64 = row.get(3)?;
            out.push(ResourceInfo {
                service: if service.is_empty() { None } else { Some(service) },
                uri: row.get(1)?,
                revision: revision as u64,
                bytes: bytes as usize,
                ts: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn get_sync(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let row: Option<(Vec<u8>, i64)> = db
            .query_row(
                "SELECT content, revision FROM resources
                 WHERE project = ?1 AND stage = ?2 AND service = ?3 AND uri = ?4",
                (&key.project, &key.stage, key.service.as_deref().unwrap_or(""), &key.uri),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .with_context(|| format!("reading resource {}", key))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(row.map(|(content, revision)| Resource { content, revision: revision as u64 }))
    }

    /// Compare-and-swap write. `Ok(Err(found))` reports a failed precondition.
    fn put_sync(&self, key: &ResourceKey, content: &[u8], pre: Precondition) -> Result<std::result::Result<u64, Option<u64>>> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        // IMMEDIATE takes the write lock up front so the check and the write
        // are atomic across processes sharing the file.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let service = key.service.as_deref().unwrap_or("");
        let found: Option<i64> = tx
            .query_row(
                "SELECT revision FROM resources WHERE project = ?1 AND stage = ?2 AND service = ?3 AND uri = ?4",
                (&key.project, &key.stage, service, &key.uri),
                |r| r.get(0),
            )
            .optional()?;
        let found = found.map(|r| r as u64);
        let holds = match pre {
            Precondition::Any => true,
            Precondition::Absent => found.is_none(),
            Precondition::Revision(want) => found == Some(want),
        };
        if !holds {
            return Ok(Err(found));
        }
        let next = found.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO resources(project, stage, service, uri, content, revision, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(project, stage, service, uri)
             DO UPDATE SET content = excluded.content, revision = excluded.revision, ts = excluded.ts",
            (&key.project, &key.stage, service, &key.uri, content, next as i64, now_ts()),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(Ok(next))
    }
}

#[async_trait::async_trait]
impl StageCatalogue for SqliteStore {
    async fn list_stages(&self, project: &str) -> Result<Vec<Stage>> {
        self.stages_sync(project)
    }

    async fn create_service_in_stage(&self, project: &str, stage: &str, service: &str) -> Result<()> {
        let db = self.conn()?;
        let known: Option<String> = db
            .query_row("SELECT name FROM stages WHERE project = ?1 AND name = ?2", (project, stage), |r| r.get(0))
            .optional()?;
        if known.is_none() {
            bail!("stage {} not found in project {}", stage, project);
        }
        let n = db.execute(
            "INSERT OR IGNORE INTO services(project, stage, name, ts) VALUES (?1, ?2, ?3, ?4)",
            (project, stage, service, now_ts()),
        )?;
        debug!(project = %project, stage = %stage, service = %service, created = n > 0, "service registered");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceStore for SqliteStore {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        self.get_sync(key)
    }

    async fn put_resource(&self, key: &ResourceKey, content: &[u8], precondition: Precondition) -> std::result::Result<u64, StoreError> {
        match self.put_sync(key, content, precondition).with_context(|| format!("writing resource {}", key))? {
            Ok(rev) => Ok(rev),
            Err(found) => Err(StoreError::Conflict { key: key.to_string(), expected: precondition, found }),
        }
    }
}

#[async_trait::async_trait]
impl StrategySource for SqliteStore {
    async fn strategy_for(&self, project: &str, stage: &str) -> Result<Option<DeploymentStrategy>> {
        let db = self.conn()?;
        let raw: Option<Option<String>> = db
            .query_row("SELECT strategy FROM stages WHERE project = ?1 AND name = ?2", (project, stage), |r| r.get(0))
            .optional()?;
        match raw.flatten() {
            Some(s) => Ok(Some(s.parse()?)),
            None => Ok(None),
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".stagehand");
        let _ = std::fs::create_dir_all(&p);
        p.push("stagehand.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "stagehand.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_shop() -> SqliteStore {
        let s = SqliteStore::open_in_memory().unwrap();
        s.create_project(
            "shop",
            &[StageDef::new("dev"), StageDef::new("staging"), StageDef::new("production").with_strategy(DeploymentStrategy::Duplicate)],
        )
        .unwrap();
        s
    }

    #[tokio::test]
    async fn stages_keep_topology_order() {
        let s = store_with_shop();
        let names: Vec<String> = s.list_stages("shop").await.unwrap().into_iter().map(|st| st.name).collect();
        assert_eq!(names, vec!["dev", "staging", "production"]);
    }

    #[tokio::test]
    async fn unknown_project_is_an_error_but_empty_project_is_not() {
        let s = SqliteStore::open_in_memory().unwrap();
        let err = s.list_stages("nope").await.unwrap_err().to_string();
        assert!(err.contains("project not found"), "{err}");
        s.create_project("empty", &[]).unwrap();
        assert!(s.list_stages("empty").await.unwrap().is_empty());
    }

    #[test]
    fn duplicate_project_rejected() {
        let s = store_with_shop();
        assert!(s.create_project("shop", &[]).is_err());
    }

    #[tokio::test]
    async fn create_service_is_idempotent() {
        let s = store_with_shop();
        s.create_service_in_stage("shop", "dev", "cart").await.unwrap();
        s.create_service_in_stage("shop", "dev", "cart").await.unwrap();
        assert_eq!(s.services("shop", "dev").unwrap(), vec!["cart"]);
        assert!(s.create_service_in_stage("shop", "qa", "cart").await.is_err());
    }

    #[tokio::test]
    async fn put_respects_preconditions() {
        let s = store_with_shop();
        let key = ResourceKey::stage("shop", "dev", "helm/values.yaml");
        assert_eq!(s.get_resource(&key).await.unwrap(), None);

        assert_eq!(s.put_resource(&key, b"a", Precondition::Absent).await.unwrap(), 1);
        let err = s.put_resource(&key, b"b", Precondition::Absent).await.unwrap_err();
        assert!(err.is_conflict());

        let err = s.put_resource(&key, b"b", Precondition::Revision(7)).await.unwrap_err();
        match err {
            StoreError::Conflict { found, .. } => assert_eq!(found, Some(1)),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(s.put_resource(&key, b"b", Precondition::Revision(1)).await.unwrap(), 2);
        assert_eq!(s.put_resource(&key, b"c", Precondition::Any).await.unwrap(), 3);

        let got = s.get_resource(&key).await.unwrap().unwrap();
        assert_eq!(got, Resource { content: b"c".to_vec(), revision: 3 });
    }

    #[tokio::test]
    async fn service_scope_is_separate_from_stage_scope() {
        let s = store_with_shop();
        let stage_key = ResourceKey::stage("shop", "dev", "helm/cart.tgz");
        let svc_key = ResourceKey::service("shop", "dev", "cart", "helm/cart.tgz");
        s.put_resource(&svc_key, b"chart", Precondition::Any).await.unwrap();
        assert!(s.get_resource(&stage_key).await.unwrap().is_none());
        let listed = s.list_resources("shop", "dev").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service.as_deref(), Some("cart"));
        assert_eq!(listed[0].bytes, 5);
    }

    #[tokio::test]
    async fn shipyard_strategies() {
        let s = store_with_shop();
        assert_eq!(s.strategy_for("shop", "production").await.unwrap(), Some(DeploymentStrategy::Duplicate));
        assert_eq!(s.strategy_for("shop", "dev").await.unwrap(), None);
        assert_eq!(s.strategy_for("shop", "missing").await.unwrap(), None);
    }
}
