//! Persistent, indexed table of learned flows backed by SQLite via `rusqlite`. `rusqlite::Connection` is
//! synchronous, so every public method hands its closure to
//! `spawn_blocking` the way a blocking storage engine is normally wrapped
//! for an async caller.

pub mod model;

use anyhow::{Context as _, Result};
use model::*;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no flow with id {0}")]
    NotFound(i64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct FlowStore {
    conn: Arc<Mutex<Connection>>,
}

impl FlowStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let conn = Connection::open(&path).context("failed to open flow store database")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .context("flow store open task panicked")??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .context("flow store open task panicked")??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("flow store mutex poisoned");
            f(&conn)
        })
        .await
        .context("flow store task panicked")?
    }

    /// Insert new or merge with existing by fingerprint.
    pub async fn upsert(&self, new: NewFlow) -> Result<Flow> {
        self.with_conn(move |conn| upsert_tx(conn, new)).await
    }

    pub async fn find(&self, mac: &str, proto: &str, port: u16) -> Result<Option<Flow>> {
        let (mac, proto) = (mac.to_owned(), proto.to_owned());
        self.with_conn(move |conn| find_tx(conn, &mac, &proto, port))
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Flow>> {
        self.with_conn(move |conn| get_tx(conn, id)).await
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM flows WHERE id = ?1", params![id])?;
            if n > 0 {
                append_change(conn, "flows", id, ChangeType::Delete, serde_json::json!({}))?;
            }
            Ok(n > 0)
        })
        .await
    }

    pub async fn list(&self, options: ListOptions) -> Result<Vec<Flow>> {
        self.with_conn(move |conn| list_tx(conn, &options)).await
    }

    pub async fn update_state(&self, id: i64, state: FlowState) -> Result<()> {
        self.with_conn(move |conn| {
            let now = now_unix();
            let n = conn.execute(
                "UPDATE flows SET state = ?1, last_seen = ?2 WHERE id = ?3",
                params![state.as_str(), now, id],
            )?;
            if n == 0 {
                anyhow::bail!(Error::NotFound(id));
            }
            append_change(
                conn,
                "flows",
                id,
                ChangeType::Update,
                serde_json::json!({ "state": state.as_str() }),
            )?;
            Ok(())
        })
        .await
    }

    pub async fn bulk_update_state(&self, ids: Vec<i64>, state: FlowState) -> Result<usize> {
        self.with_conn(move |conn| {
            let mut updated = 0;
            for id in ids {
                let now = now_unix();
                let n = conn.execute(
                    "UPDATE flows SET state = ?1, last_seen = ?2 WHERE id = ?3",
                    params![state.as_str(), now, id],
                )?;
                if n > 0 {
                    append_change(
                        conn,
                        "flows",
                        id,
                        ChangeType::Update,
                        serde_json::json!({ "state": state.as_str() }),
                    )?;
                    updated += 1;
                }
            }
            Ok(updated)
        })
        .await
    }

    pub async fn allow_all_pending(&self) -> Result<usize> {
        self.with_conn(move |conn| {
            let ids: Vec<i64> = conn
                .prepare("SELECT id FROM flows WHERE state = 'pending'")?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            let n = ids.len();
            let now = now_unix();
            conn.execute(
                "UPDATE flows SET state = 'allowed', last_seen = ?1 WHERE state = 'pending'",
                params![now],
            )?;
            for id in ids {
                append_change(
                    conn,
                    "flows",
                    id,
                    ChangeType::Update,
                    serde_json::json!({ "state": "allowed" }),
                )?;
            }
            Ok(n)
        })
        .await
    }

    /// Writes back fields a cache entry may have accumulated between flushes
    /// (samples, occurrence count, recency) without touching state or
    /// scrutiny, which only change through their own dedicated methods.
    pub async fn save(&self, flow: &Flow) -> Result<()> {
        let flow = flow.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE flows SET src_ip = ?1, dst_ip = ?2, src_hostname = ?3,
                     last_seen = ?4, occurrences = ?5 WHERE id = ?6",
                params![
                    flow.src_ip,
                    flow.dst_ip,
                    flow.src_hostname,
                    flow.last_seen,
                    flow.occurrences,
                    flow.id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Fills in `app_label`/`vendor` only where currently unset.
    pub async fn update_labels(
        &self,
        id: i64,
        app_label: Option<String>,
        vendor: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE flows SET app_label = COALESCE(app_label, ?1), vendor = COALESCE(vendor, ?2) WHERE id = ?3",
                params![app_label, vendor, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_hint(
        &self,
        flow_id: i64,
        domain: String,
        source: HintSource,
    ) -> Result<DomainHint> {
        self.with_conn(move |conn| {
            let now = now_unix();
            let confidence = source.confidence();
            conn.execute(
                "INSERT INTO hints (flow_id, domain, confidence, source, detected_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![flow_id, domain, confidence, source.as_str(), now],
            )?;
            let id = conn.last_insert_rowid();
            append_change(
                conn,
                "hints",
                id,
                ChangeType::Insert,
                serde_json::json!({ "flow_id": flow_id, "domain": domain }),
            )?;
            Ok(DomainHint {
                id,
                flow_id,
                domain,
                confidence,
                source,
                detected_at: now,
            })
        })
        .await
    }

    pub async fn get_hints(&self, flow_id: i64) -> Result<Vec<DomainHint>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, flow_id, domain, confidence, source, detected_at FROM hints
                 WHERE flow_id = ?1 ORDER BY confidence DESC, detected_at DESC",
            )?;
            let hints = stmt
                .query_map(params![flow_id], row_to_hint)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hints)
        })
        .await
    }

    pub async fn best_hint(&self, flow_id: i64) -> Result<Option<DomainHint>> {
        Ok(self.get_hints(flow_id).await?.into_iter().next())
    }

    pub async fn set_scrutiny(
        &self,
        id: i64,
        enabled: bool,
        review_after: Option<i64>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE flows SET scrutiny = ?1, review_until = ?2 WHERE id = ?3",
                params![enabled, review_after, id],
            )?;
            if n == 0 {
                anyhow::bail!(Error::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    pub async fn scrutiny_due(&self, now: i64) -> Result<Vec<Flow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM flows WHERE scrutiny = 1 AND review_until IS NOT NULL AND review_until <= ?1",
            )?;
            let flows = stmt
                .query_map(params![now], row_to_flow)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(flows)
        })
        .await
    }

    /// Deletes only *pending* flows whose `last_seen` predates the cutoff.
    pub async fn cleanup(&self, retention_days: i64) -> Result<usize> {
        self.with_conn(move |conn| {
            let cutoff = now_unix() - retention_days * 86_400;
            let ids: Vec<i64> = conn
                .prepare("SELECT id FROM flows WHERE state = 'pending' AND last_seen < ?1")?
                .query_map(params![cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            for &id in &ids {
                conn.execute("DELETE FROM flows WHERE id = ?1", params![id])?;
                append_change(conn, "flows", id, ChangeType::Delete, serde_json::json!({}))?;
            }
            Ok(ids.len())
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<FlowStats> {
        self.with_conn(|conn| {
            let mut stats = FlowStats::default();
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM flows GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                stats.total += count;
                match state.as_str() {
                    "pending" => stats.pending = count,
                    "allowed" => stats.allowed = count,
                    "denied" => stats.denied = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
    }

    pub async fn get_version(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let v: Option<i64> =
                conn.query_row("SELECT MAX(version) FROM changes", [], |row| row.get(0))?;
            Ok(v.unwrap_or(0))
        })
        .await
    }

    pub async fn get_changes_since(&self, version: i64) -> Result<Vec<ChangeRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT version, table_name, row_id, change_type, fields, timestamp
                 FROM changes WHERE version > ?1 ORDER BY version ASC",
            )?;
            let rows = stmt
                .query_map(params![version], row_to_change)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn prune_changes(&self, keep_days: i64) -> Result<usize> {
        self.with_conn(move |conn| {
            let cutoff = now_unix() - keep_days * 86_400;
            let n = conn.execute("DELETE FROM changes WHERE timestamp < ?1", params![cutoff])?;
            conn.execute_batch("VACUUM")?;
            Ok(n)
        })
        .await
    }

    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM flows")?;
            let flows = stmt
                .query_map([], row_to_flow)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut stmt =
                conn.prepare("SELECT id, flow_id, domain, confidence, source, detected_at FROM hints")?;
            let hints = stmt
                .query_map([], row_to_hint)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let version: i64 = conn
                .query_row("SELECT MAX(version) FROM changes", [], |row| row.get(0))?
                .unwrap_or(0);
            Ok(Snapshot {
                version,
                flows,
                hints,
            })
        })
        .await
    }

    /// Replaces all state and sets the version.
    pub async fn import_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute_batch("DELETE FROM hints; DELETE FROM flows; DELETE FROM changes;")?;
            for flow in &snapshot.flows {
                conn.execute(
                    "INSERT INTO flows (id, mac, proto, port, src_ip, dst_ip, src_hostname,
                         policy_label, state, scrutiny, review_until, first_seen, last_seen,
                         occurrences, app_label, vendor, device_identity)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                    params![
                        flow.id,
                        flow.mac,
                        flow.proto,
                        flow.port,
                        flow.src_ip,
                        flow.dst_ip,
                        flow.src_hostname,
                        flow.policy_label,
                        flow.state.as_str(),
                        flow.scrutiny,
                        flow.review_until,
                        flow.first_seen,
                        flow.last_seen,
                        flow.occurrences,
                        flow.app_label,
                        flow.vendor,
                        flow.device_identity,
                    ],
                )?;
            }
            for hint in &snapshot.hints {
                conn.execute(
                    "INSERT INTO hints (id, flow_id, domain, confidence, source, detected_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        hint.id,
                        hint.flow_id,
                        hint.domain,
                        hint.confidence,
                        hint.source.as_str(),
                        hint.detected_at
                    ],
                )?;
            }
            conn.execute(
                "INSERT INTO changes (version, table_name, row_id, change_type, fields, timestamp)
                 VALUES (?1, 'snapshot', 0, 'insert', '{}', ?2)",
                params![snapshot.version, now_unix()],
            )?;
            Ok(())
        })
        .await
    }
}

fn upsert_tx(conn: &Connection, new: NewFlow) -> Result<Flow> {
    let existing = find_tx(conn, &new.mac, &new.proto, new.port)?;

    match existing {
        Some(existing) => {
            conn.execute(
                "UPDATE flows SET
                     src_ip = COALESCE(?1, src_ip),
                     dst_ip = COALESCE(?2, dst_ip),
                     src_hostname = COALESCE(?3, src_hostname),
                     policy_label = COALESCE(?4, policy_label),
                     app_label = COALESCE(?5, app_label),
                     vendor = COALESCE(?6, vendor),
                     device_identity = COALESCE(?7, device_identity),
                     last_seen = ?8,
                     occurrences = occurrences + 1
                 WHERE id = ?9",
                params![
                    new.src_ip,
                    new.dst_ip,
                    new.src_hostname,
                    new.policy_label,
                    new.app_label,
                    new.vendor,
                    new.device_identity,
                    new.now,
                    existing.id,
                ],
            )?;
            append_change(
                conn,
                "flows",
                existing.id,
                ChangeType::Update,
                serde_json::json!({ "occurrences": existing.occurrences + 1 }),
            )?;
            get_tx(conn, existing.id)?.context("flow vanished after upsert")
        }
        None => {
            conn.execute(
                "INSERT INTO flows (mac, proto, port, src_ip, dst_ip, src_hostname, policy_label,
                     state, scrutiny, review_until, first_seen, last_seen, occurrences,
                     app_label, vendor, device_identity)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,0,NULL,?9,?9,1,?10,?11,?12)",
                params![
                    new.mac,
                    new.proto,
                    new.port,
                    new.src_ip,
                    new.dst_ip,
                    new.src_hostname,
                    new.policy_label,
                    new.state.as_str(),
                    new.now,
                    new.app_label,
                    new.vendor,
                    new.device_identity,
                ],
            )?;
            let id = conn.last_insert_rowid();
            append_change(
                conn,
                "flows",
                id,
                ChangeType::Insert,
                serde_json::json!({ "mac": new.mac, "proto": new.proto, "port": new.port }),
            )?;
            get_tx(conn, id)?.context("flow vanished after insert")
        }
    }
}

fn find_tx(conn: &Connection, mac: &str, proto: &str, port: u16) -> Result<Option<Flow>> {
    conn.query_row(
        "SELECT * FROM flows WHERE mac = ?1 AND proto = ?2 AND port = ?3",
        params![mac, proto, port],
        row_to_flow,
    )
    .optional()
    .map_err(Into::into)
}

fn get_tx(conn: &Connection, id: i64) -> Result<Option<Flow>> {
    conn.query_row("SELECT * FROM flows WHERE id = ?1", params![id], row_to_flow)
        .optional()
        .map_err(Into::into)
}

fn list_tx(conn: &Connection, options: &ListOptions) -> Result<Vec<Flow>> {
    let mut sql = "SELECT * FROM flows WHERE 1=1".to_string();
    let mut sql_params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(state) = options.state {
        sql.push_str(" AND state = ?");
        sql_params.push(Box::new(state.as_str().to_string()));
    }
    if let Some(mac) = &options.mac {
        sql.push_str(" AND mac = ?");
        sql_params.push(Box::new(mac.clone()));
    }

    let order_col = match options.order_by.unwrap_or(OrderBy::LastSeen) {
        OrderBy::LastSeen => "last_seen",
        OrderBy::FirstSeen => "first_seen",
        OrderBy::Occurrences => "occurrences",
    };
    let order_dir = match options.order_dir.unwrap_or(OrderDir::Desc) {
        OrderDir::Asc => "ASC",
        OrderDir::Desc => "DESC",
    };
    sql.push_str(&format!(" ORDER BY {order_col} {order_dir}"));

    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        sql_params.iter().map(|b| b.as_ref()).collect();
    let flows = stmt
        .query_map(param_refs.as_slice(), row_to_flow)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(flows)
}

fn append_change(
    conn: &Connection,
    table: &str,
    row_id: i64,
    change_type: ChangeType,
    fields: serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO changes (table_name, row_id, change_type, fields, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            table,
            row_id,
            change_type.as_str(),
            fields.to_string(),
            now_unix()
        ],
    )?;
    Ok(())
}

fn row_to_flow(row: &rusqlite::Row) -> rusqlite::Result<Flow> {
    let state: String = row.get("state")?;
    Ok(Flow {
        id: row.get("id")?,
        mac: row.get("mac")?,
        proto: row.get("proto")?,
        port: row.get("port")?,
        src_ip: row.get("src_ip")?,
        dst_ip: row.get("dst_ip")?,
        src_hostname: row.get("src_hostname")?,
        policy_label: row.get("policy_label")?,
        state: FlowState::parse(&state).unwrap_or(FlowState::Pending),
        scrutiny: row.get("scrutiny")?,
        review_until: row.get("review_until")?,
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
        occurrences: row.get("occurrences")?,
        app_label: row.get("app_label")?,
        vendor: row.get("vendor")?,
        device_identity: row.get("device_identity")?,
    })
}

fn row_to_hint(row: &rusqlite::Row) -> rusqlite::Result<DomainHint> {
    let source: String = row.get("source")?;
    Ok(DomainHint {
        id: row.get("id")?,
        flow_id: row.get("flow_id")?,
        domain: row.get("domain")?,
        confidence: row.get("confidence")?,
        source: HintSource::parse(&source).unwrap_or(HintSource::ReverseDns),
        detected_at: row.get("detected_at")?,
    })
}

fn row_to_change(row: &rusqlite::Row) -> rusqlite::Result<ChangeRecord> {
    let change_type: String = row.get("change_type")?;
    let fields: String = row.get("fields")?;
    Ok(ChangeRecord {
        version: row.get("version")?,
        table: row.get("table_name")?,
        row_id: row.get("row_id")?,
        change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Update),
        fields: serde_json::from_str(&fields).unwrap_or(serde_json::json!({})),
        timestamp: row.get("timestamp")?,
    })
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Creates the schema if absent, then tolerantly adds any columns that a
/// prior version of the daemon didn't know about. Opening a database
/// written by an older build must never fail.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS flows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mac TEXT NOT NULL,
            proto TEXT NOT NULL,
            port INTEGER NOT NULL,
            src_ip TEXT,
            dst_ip TEXT,
            src_hostname TEXT,
            policy_label TEXT,
            state TEXT NOT NULL,
            scrutiny INTEGER NOT NULL DEFAULT 0,
            review_until INTEGER,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            occurrences INTEGER NOT NULL DEFAULT 1,
            app_label TEXT,
            vendor TEXT,
            device_identity TEXT,
            UNIQUE(mac, proto, port)
        );
        CREATE TABLE IF NOT EXISTS hints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            flow_id INTEGER NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
            domain TEXT NOT NULL,
            confidence INTEGER NOT NULL,
            source TEXT NOT NULL,
            detected_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS changes (
            version INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            change_type TEXT NOT NULL,
            fields TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_hints_flow_id ON hints(flow_id);
        ",
    )?;

    // Columns added after the initial release. Each is only added if a
    // pre-existing database doesn't already have it, so upgrading never
    // fails the open.
    let existing: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('flows')")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let optional_columns = [
        ("app_label", "TEXT"),
        ("vendor", "TEXT"),
        ("device_identity", "TEXT"),
    ];
    for (name, ty) in optional_columns {
        if !existing.iter().any(|c| c == name) {
            conn.execute_batch(&format!("ALTER TABLE flows ADD COLUMN {name} {ty}"))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mac: &str, port: u16, now: i64) -> NewFlow {
        NewFlow {
            mac: mac.to_string(),
            proto: "tcp".to_string(),
            port,
            src_ip: Some("192.168.1.10".to_string()),
            dst_ip: Some("1.1.1.1".to_string()),
            src_hostname: None,
            policy_label: None,
            state: FlowState::Pending,
            app_label: None,
            vendor: None,
            device_identity: None,
            now,
        }
    }

    #[tokio::test]
    async fn upsert_then_find_round_trips() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let flow = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 1000)).await.unwrap();
        assert_eq!(flow.occurrences, 1);

        let found = store
            .find("aa:bb:cc:dd:ee:01", "tcp", 443)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, flow.id);
    }

    #[tokio::test]
    async fn idempotent_upsert_bumps_occurrences_and_last_seen() {
        let store = FlowStore::open_in_memory().await.unwrap();
        store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 1000)).await.unwrap();
        let second = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 2000)).await.unwrap();
        let third = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 1500)).await.unwrap();

        assert_eq!(third.occurrences, 3);
        assert_eq!(second.last_seen, 2000);
        assert_eq!(third.last_seen, 1500); // last write wins regardless of timestamp ordering
    }

    #[tokio::test]
    async fn fingerprint_is_unique() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let a = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 1000)).await.unwrap();
        let b = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 1001)).await.unwrap();
        assert_eq!(a.id, b.id);

        let all = store.list(ListOptions::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_only_removes_pending_past_retention() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let old_pending = store
            .upsert(sample("aa:bb:cc:dd:ee:01", 1, 0))
            .await
            .unwrap();
        let old_allowed = store
            .upsert(sample("aa:bb:cc:dd:ee:02", 2, 0))
            .await
            .unwrap();
        store.update_state(old_allowed.id, FlowState::Allowed).await.unwrap();

        let removed = store.cleanup(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_pending.id).await.unwrap().is_none());
        assert!(store.get(old_allowed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hints_ordered_by_confidence_then_recency() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let flow = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 0)).await.unwrap();
        store
            .add_hint(flow.id, "reverse.example".to_string(), HintSource::ReverseDns)
            .await
            .unwrap();
        store
            .add_hint(flow.id, "sni.example".to_string(), HintSource::SniPeek)
            .await
            .unwrap();
        store
            .add_hint(flow.id, "dns.example".to_string(), HintSource::DnsSnoop)
            .await
            .unwrap();

        let best = store.best_hint(flow.id).await.unwrap().unwrap();
        assert_eq!(best.domain, "sni.example");
        assert_eq!(best.confidence, 100);

        let all = store.get_hints(flow.id).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].domain, "dns.example");
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let flow = store.upsert(sample("aa:bb:cc:dd:ee:01", 443, 0)).await.unwrap();
        store
            .add_hint(flow.id, "example.com".to_string(), HintSource::SniPeek)
            .await
            .unwrap();

        let snapshot = store.export_snapshot().await.unwrap();

        let restored = FlowStore::open_in_memory().await.unwrap();
        restored.import_snapshot(snapshot.clone()).await.unwrap();

        let flows = restored.list(ListOptions::default()).await.unwrap();
        assert_eq!(flows.len(), 1);
        let hints = restored.get_hints(flow.id).await.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(restored.get_version().await.unwrap(), snapshot.version);
    }

    #[tokio::test]
    async fn allow_all_pending_performs_bulk_transition() {
        let store = FlowStore::open_in_memory().await.unwrap();
        store.upsert(sample("aa:bb:cc:dd:ee:01", 1, 0)).await.unwrap();
        store.upsert(sample("aa:bb:cc:dd:ee:02", 2, 0)).await.unwrap();

        let n = store.allow_all_pending().await.unwrap();
        assert_eq!(n, 2);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn update_state_on_missing_flow_fails() {
        let store = FlowStore::open_in_memory().await.unwrap();
        let err = store.update_state(999, FlowState::Allowed).await;
        assert!(err.is_err());
    }
}
