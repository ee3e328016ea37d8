/// Relational store: inventory, scan history, and the metric time series.
///
/// SQLite via rusqlite, one connection behind a mutex. Writes are short
/// transactions; idempotency comes from `ON CONFLICT` clauses, not
/// application-level locking. Timestamps are unix seconds.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::Error;
use crate::types::{
    DeptId, Department, DiscoveredHost, HostId, HostStatus, HostSummary, IdentityReport, LabId,
    MetricsReport, ScanId,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS departments (
        dept_id      INTEGER PRIMARY KEY,
        dept_name    TEXT NOT NULL UNIQUE,
        subnet_cidr  TEXT
    );

    CREATE TABLE IF NOT EXISTS labs (
        lab_id       INTEGER PRIMARY KEY,
        lab_name     TEXT NOT NULL,
        lab_dept     INTEGER NOT NULL REFERENCES departments(dept_id)
    );

    CREATE TABLE IF NOT EXISTS systems (
        system_id    INTEGER PRIMARY KEY,
        lab_id       INTEGER REFERENCES labs(lab_id),
        dept_id      INTEGER NOT NULL REFERENCES departments(dept_id),
        hostname     TEXT,
        ip_address   TEXT NOT NULL UNIQUE,
        mac_address  TEXT,
        cpu_model    TEXT,
        cpu_cores    INTEGER,
        ram_total_gb REAL,
        disk_total_gb REAL,
        gpu_model    TEXT,
        gpu_memory_gb REAL,
        status       TEXT NOT NULL DEFAULT 'discovered',
        first_seen   INTEGER NOT NULL,
        last_seen    INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS network_scans (
        scan_id       INTEGER PRIMARY KEY AUTOINCREMENT,
        dept_id       INTEGER NOT NULL REFERENCES departments(dept_id),
        target_range  TEXT NOT NULL,
        scan_start    INTEGER NOT NULL,
        scan_end      INTEGER,
        status        TEXT NOT NULL,
        systems_found INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    );

    CREATE TABLE IF NOT EXISTS usage_metrics (
        system_id           INTEGER NOT NULL REFERENCES systems(system_id),
        timestamp           INTEGER NOT NULL,
        cpu_percent         REAL,
        cpu_temperature     REAL,
        ram_percent         REAL,
        disk_percent        REAL,
        disk_read_mbps      REAL,
        disk_write_mbps     REAL,
        network_sent_mbps   REAL,
        network_recv_mbps   REAL,
        gpu_percent         REAL,
        gpu_memory_used_gb  REAL,
        gpu_temperature     REAL,
        uptime_seconds      INTEGER,
        logged_in_users     INTEGER,
        collection_latency_ms INTEGER,
        PRIMARY KEY (system_id, timestamp)
    );
";

pub struct Store {
    conn: Mutex<Connection>,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Store {
    /// Open (or create) the database at `dsn` and ensure the schema
    /// exists. `:memory:` is accepted for tests.
    pub fn open(dsn: &str) -> Result<Store, Error> {
        let conn = Connection::open(dsn)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        info!(dsn = dsn, "store opened");
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    // ── Departments and labs ────────────────────────────────────────────

    pub fn add_department(&self, name: &str, subnet_cidr: Option<&str>) -> Result<DeptId, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO departments (dept_name, subnet_cidr) VALUES (?1, ?2)",
            params![name, subnet_cidr],
        )?;
        Ok(DeptId(conn.last_insert_rowid()))
    }

    pub fn add_lab(&self, name: &str, dept: DeptId) -> Result<LabId, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO labs (lab_name, lab_dept) VALUES (?1, ?2)",
            params![name, dept.0],
        )?;
        Ok(LabId(conn.last_insert_rowid()))
    }

    pub fn department_exists(&self, dept: DeptId) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT dept_id FROM departments WHERE dept_id = ?1",
                params![dept.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Departments eligible for a discovery pass.
    pub fn departments_with_subnet(&self) -> Result<Vec<Department>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT dept_id, dept_name, subnet_cidr FROM departments
             WHERE subnet_cidr IS NOT NULL ORDER BY dept_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Department {
                dept_id: DeptId(row.get(0)?),
                dept_name: row.get(1)?,
                subnet_cidr: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// First lab of a department ordered by lab_id, if any.
    pub fn first_lab(&self, dept: DeptId) -> Result<Option<LabId>, Error> {
        let conn = self.conn.lock().unwrap();
        let lab: Option<i64> = conn
            .query_row(
                "SELECT lab_id FROM labs WHERE lab_dept = ?1 ORDER BY lab_id LIMIT 1",
                params![dept.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(lab.map(LabId))
    }

    // ── Hosts ───────────────────────────────────────────────────────────

    /// Idempotent upsert keyed on `ip_address`, used by the discovery
    /// pipeline. Inserts an active row, or refreshes the mutable columns
    /// of an existing one. `first_seen` is never touched on update.
    pub fn upsert_host(
        &self,
        ip: &str,
        dept: DeptId,
        lab: Option<LabId>,
        identity: &IdentityReport,
    ) -> Result<HostId, Error> {
        self.upsert_host_at(ip, dept, lab, identity, HostStatus::Active, now_secs())
    }

    fn upsert_host_at(
        &self,
        ip: &str,
        dept: DeptId,
        lab: Option<LabId>,
        identity: &IdentityReport,
        insert_status: HostStatus,
        now: i64,
    ) -> Result<HostId, Error> {
        let conn = self.conn.lock().unwrap();
        let id: i64 = conn.query_row(
            "INSERT INTO systems (
                lab_id, dept_id, hostname, ip_address, mac_address,
                cpu_model, cpu_cores, ram_total_gb, disk_total_gb,
                gpu_model, gpu_memory_gb, status, first_seen, last_seen
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT (ip_address) DO UPDATE
            SET hostname      = excluded.hostname,
                mac_address   = excluded.mac_address,
                cpu_model     = excluded.cpu_model,
                cpu_cores     = excluded.cpu_cores,
                ram_total_gb  = excluded.ram_total_gb,
                disk_total_gb = excluded.disk_total_gb,
                gpu_model     = excluded.gpu_model,
                gpu_memory_gb = excluded.gpu_memory_gb,
                status        = 'active',
                last_seen     = excluded.last_seen
            RETURNING system_id",
            params![
                lab.map(|l| l.0),
                dept.0,
                identity.hostname,
                ip,
                identity.mac_address,
                identity.cpu_model,
                identity.cpu_cores,
                identity.ram_total_gb,
                identity.disk_total_gb,
                identity.gpu_model,
                identity.gpu_memory,
                insert_status.as_str(),
                now,
            ],
            |row| row.get(0),
        )?;
        Ok(HostId(id))
    }

    /// Worker-side upsert for discovery messages: first sight lands as
    /// `discovered`, any later sighting flips the row to `active`.
    pub fn ingest_host(&self, host: &DiscoveredHost) -> Result<HostId, Error> {
        self.upsert_host_at(
            &host.ip_address,
            host.dept_id,
            host.lab_id,
            &host.identity,
            HostStatus::Discovered,
            now_secs(),
        )
    }

    pub fn active_hosts(&self) -> Result<Vec<HostSummary>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT system_id, ip_address, COALESCE(hostname, '')
             FROM systems WHERE status = 'active' ORDER BY system_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HostSummary {
                system_id: HostId(row.get(0)?),
                ip_address: row.get(1)?,
                hostname: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_status_by_ip(&self, ip: &str, status: HostStatus) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE systems SET status = ?1, last_seen = ?2 WHERE ip_address = ?3",
            params![status.as_str(), now_secs(), ip],
        )?;
        Ok(())
    }

    pub fn host_status(&self, host: HostId) -> Result<Option<HostStatus>, Error> {
        let conn = self.conn.lock().unwrap();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM systems WHERE system_id = ?1",
                params![host.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| HostStatus::parse(&s)))
    }

    // ── Discovery scans ─────────────────────────────────────────────────

    pub fn open_scan(&self, dept: DeptId, target_range: &str) -> Result<ScanId, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO network_scans (dept_id, target_range, scan_start, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![dept.0, target_range, now_secs()],
        )?;
        Ok(ScanId(conn.last_insert_rowid()))
    }

    pub fn close_scan(&self, scan: ScanId, systems_found: usize) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE network_scans
             SET scan_end = ?1, status = 'completed', systems_found = ?2
             WHERE scan_id = ?3",
            params![now_secs(), systems_found as i64, scan.0],
        )?;
        Ok(())
    }

    pub fn fail_scan(&self, scan: ScanId, error: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE network_scans
             SET scan_end = ?1, status = 'failed', error_message = ?2
             WHERE scan_id = ?3",
            params![now_secs(), error, scan.0],
        )?;
        Ok(())
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    /// Insert one metric sample and touch the owning host row, in a single
    /// transaction. A duplicate `(system_id, timestamp)` is swallowed by
    /// the conflict clause; a missing host surfaces as a foreign-key error
    /// and rolls the whole message back.
    pub fn insert_metric(
        &self,
        host: HostId,
        timestamp: i64,
        sample: &MetricsReport,
    ) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO usage_metrics (
                system_id, timestamp,
                cpu_percent, cpu_temperature, ram_percent,
                disk_percent, disk_read_mbps, disk_write_mbps,
                network_sent_mbps, network_recv_mbps,
                gpu_percent, gpu_memory_used_gb, gpu_temperature,
                uptime_seconds, logged_in_users, collection_latency_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT (system_id, timestamp) DO NOTHING",
            params![
                host.0,
                timestamp,
                sample.cpu_percent,
                sample.cpu_temperature,
                sample.ram_percent,
                sample.disk_percent,
                sample.disk_read_mbps,
                sample.disk_write_mbps,
                sample.network_sent_mbps,
                sample.network_recv_mbps,
                sample.gpu_percent,
                sample.gpu_memory_used_gb,
                sample.gpu_temperature,
                sample.uptime_seconds,
                sample.logged_in_users,
                sample.collection_latency_ms,
            ],
        )?;
        tx.execute(
            "UPDATE systems SET last_seen = ?1, status = 'active' WHERE system_id = ?2",
            params![timestamp, host.0],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn metric_count(&self, host: HostId) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM usage_metrics WHERE system_id = ?1",
            params![host.0],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open(":memory:").unwrap()
    }

    fn identity(hostname: &str) -> IdentityReport {
        IdentityReport {
            hostname: Some(hostname.to_string()),
            cpu_cores: Some(8),
            ram_total_gb: Some(16.0),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_is_idempotent_and_preserves_first_seen() {
        let store = test_store();
        let dept = store.add_department("ISE", Some("10.30.0.0/24")).unwrap();

        let id1 = store
            .upsert_host_at("10.30.0.5", dept, None, &identity("ws05"), HostStatus::Active, 1000)
            .unwrap();
        let id2 = store
            .upsert_host_at("10.30.0.5", dept, None, &identity("ws05-renamed"), HostStatus::Active, 2000)
            .unwrap();
        assert_eq!(id1, id2);

        let conn = store.conn.lock().unwrap();
        let (count, hostname, first_seen, last_seen): (i64, String, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), hostname, first_seen, last_seen FROM systems
                 WHERE ip_address = '10.30.0.5'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(hostname, "ws05-renamed");
        assert_eq!(first_seen, 1000);
        assert_eq!(last_seen, 2000);
    }

    #[test]
    fn ingest_host_starts_discovered_then_activates() {
        let store = test_store();
        let dept = store.add_department("CSE", None).unwrap();
        let host = DiscoveredHost {
            ip_address: "10.40.0.9".into(),
            dept_id: dept,
            lab_id: None,
            identity: identity("ws09"),
        };

        let id = store.ingest_host(&host).unwrap();
        assert_eq!(store.host_status(id).unwrap(), Some(HostStatus::Discovered));

        let id2 = store.ingest_host(&host).unwrap();
        assert_eq!(id, id2);
        assert_eq!(store.host_status(id).unwrap(), Some(HostStatus::Active));
    }

    #[test]
    fn active_hosts_excludes_other_statuses() {
        let store = test_store();
        let dept = store.add_department("ECE", None).unwrap();
        store
            .upsert_host("10.1.0.1", dept, None, &identity("a"))
            .unwrap();
        store
            .upsert_host("10.1.0.2", dept, None, &identity("b"))
            .unwrap();
        store.set_status_by_ip("10.1.0.2", HostStatus::Offline).unwrap();

        let active = store.active_hosts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ip_address, "10.1.0.1");
        assert_eq!(active[0].hostname, "a");
    }

    #[test]
    fn lab_assignment_prefers_lowest_lab_id() {
        let store = test_store();
        let dept = store.add_department("ME", None).unwrap();
        assert!(store.first_lab(dept).unwrap().is_none());
        let lab1 = store.add_lab("lab-a", dept).unwrap();
        store.add_lab("lab-b", dept).unwrap();
        assert_eq!(store.first_lab(dept).unwrap(), Some(lab1));
    }

    #[test]
    fn scan_lifecycle_records_outcome() {
        let store = test_store();
        let dept = store.add_department("ISE", Some("10.30.0.0/24")).unwrap();

        let scan = store.open_scan(dept, "10.30.0.0/24").unwrap();
        store.close_scan(scan, 0).unwrap();

        let conn = store.conn.lock().unwrap();
        let (status, found): (String, i64) = conn
            .query_row(
                "SELECT status, systems_found FROM network_scans WHERE scan_id = ?1",
                params![scan.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "completed");
        assert_eq!(found, 0);
    }

    #[test]
    fn failed_scan_keeps_the_error() {
        let store = test_store();
        let dept = store.add_department("ISE", Some("10.30.0.0/24")).unwrap();
        let scan = store.open_scan(dept, "10.30.0.0/24").unwrap();
        store.fail_scan(scan, "department vanished").unwrap();

        let conn = store.conn.lock().unwrap();
        let (status, error): (String, String) = conn
            .query_row(
                "SELECT status, error_message FROM network_scans WHERE scan_id = ?1",
                params![scan.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "failed");
        assert_eq!(error, "department vanished");
    }

    #[test]
    fn metric_insert_requires_an_owner_row() {
        let store = test_store();
        let sample = MetricsReport {
            cpu_percent: Some(12.0),
            ..Default::default()
        };
        // No such host → foreign key violation, nothing written
        let result = store.insert_metric(HostId(999), 1000, &sample);
        assert!(result.is_err());
    }

    #[test]
    fn metric_insert_succeeds_after_owner_appears() {
        let store = test_store();
        let sample = MetricsReport {
            cpu_percent: Some(12.0),
            uptime_seconds: Some(3600),
            ..Default::default()
        };
        assert!(store.insert_metric(HostId(1), 1000, &sample).is_err());

        let dept = store.add_department("ISE", None).unwrap();
        let host = store
            .upsert_host("10.30.0.5", dept, None, &identity("ws05"))
            .unwrap();
        store.insert_metric(host, 1000, &sample).unwrap();
        assert_eq!(store.metric_count(host).unwrap(), 1);
    }

    #[test]
    fn duplicate_metric_is_swallowed() {
        let store = test_store();
        let dept = store.add_department("ISE", None).unwrap();
        let host = store
            .upsert_host("10.30.0.5", dept, None, &identity("ws05"))
            .unwrap();
        let sample = MetricsReport::default();
        store.insert_metric(host, 1000, &sample).unwrap();
        store.insert_metric(host, 1000, &sample).unwrap();
        assert_eq!(store.metric_count(host).unwrap(), 1);
    }

    #[test]
    fn metric_insert_touches_last_seen() {
        let store = test_store();
        let dept = store.add_department("ISE", None).unwrap();
        let host = store
            .upsert_host_at("10.30.0.5", dept, None, &identity("ws05"), HostStatus::Active, 500)
            .unwrap();
        store.set_status_by_ip("10.30.0.5", HostStatus::Offline).unwrap();

        store
            .insert_metric(host, 9000, &MetricsReport::default())
            .unwrap();
        assert_eq!(store.host_status(host).unwrap(), Some(HostStatus::Active));

        let conn = store.conn.lock().unwrap();
        let last_seen: i64 = conn
            .query_row(
                "SELECT last_seen FROM systems WHERE system_id = ?1",
                params![host.0],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_seen, 9000);
    }
}
