//! The persistent job index. One row per job, keyed by the auto-increment
//! id that becomes the job's [`JobId`]. This is the only component that
//! interprets job status; everything else passes the strings through.

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use corral_base::{JobId, JobStatus};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
};
use strum::IntoEnumIterator as _;

pub struct JobStore {
    conn: Mutex<Connection>,
}

/// One row of the index, in the shape the monitor endpoints serve.
#[derive(Debug, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub status: String,
    pub engine: String,
    pub created: Option<String>,
    pub started: Option<String>,
    pub finished: Option<String>,
    pub error: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub count: i64,
    pub max_index: Option<i64>,
}

/// Filters shared by the monitor queries. `engine` and `statuses` compose
/// by AND; a non-empty `statuses` is set membership.
#[derive(Debug, Default)]
pub struct JobFilter {
    pub engine: Option<String>,
    pub statuses: Vec<String>,
}

impl JobFilter {
    fn conditions(&self) -> (Vec<String>, Vec<Value>) {
        let mut conds = Vec::new();
        let mut args = Vec::new();
        if let Some(engine) = &self.engine {
            conds.push("engine = ?".to_string());
            args.push(Value::Text(engine.clone()));
        }
        if !self.statuses.is_empty() {
            let placeholders = vec!["?"; self.statuses.len()].join(",");
            conds.push(format!("status IN ({placeholders})"));
            args.extend(self.statuses.iter().map(|s| Value::Text(s.clone())));
        }
        (conds, args)
    }
}

fn now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening job index `{}`", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;",
        )
        .context("setting pragmas")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                status   TEXT NOT NULL,
                engine   TEXT NOT NULL,
                created  TEXT,
                started  TEXT,
                finished TEXT,
                error    TEXT,
                filename TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_engine_status ON jobs(engine, status);",
        )
        .context("creating job index schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new Received row and return the id it was assigned. A
    /// failure leaves no row behind.
    pub fn job_create(&self, engine: &str, filename: Option<&str>) -> Result<JobId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (status, engine, created, filename) VALUES (?1, ?2, ?3, ?4)",
            params![JobStatus::Received.as_db_str(), engine, now(), filename],
        )
        .context("inserting job row")?;
        Ok(JobId(conn.last_insert_rowid()))
    }

    /// Run an update that must affect exactly one row; anything else means
    /// the jid was stale or unknown.
    fn update_one(&self, query: &str, args: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(query, args)
            .with_context(|| format!("executing `{query}`"))?;
        if rows != 1 {
            bail!("unexpected number of rows updated (1 != {rows})");
        }
        Ok(())
    }

    pub fn job_set_started(&self, jid: JobId) -> Result<()> {
        self.update_one(
            "UPDATE jobs SET status = ?1, started = ?2 WHERE id = ?3",
            params![JobStatus::Running.as_db_str(), now(), jid.0],
        )
    }

    pub fn job_set_success(&self, jid: JobId) -> Result<()> {
        self.update_one(
            "UPDATE jobs SET status = ?1, finished = ?2 WHERE id = ?3",
            params![JobStatus::Success.as_db_str(), now(), jid.0],
        )
    }

    pub fn job_set_error(&self, jid: JobId, msg: &str) -> Result<()> {
        self.update_one(
            "UPDATE jobs SET status = ?1, finished = ?2, error = ?3 WHERE id = ?4",
            params![JobStatus::Fail.as_db_str(), now(), msg, jid.0],
        )
    }

    pub fn job_get_status(&self, jid: JobId) -> Result<JobStatus> {
        let conn = self.conn.lock().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![jid.0], |row| {
                row.get(0)
            })
            .with_context(|| format!("job {jid} not found"))?;
        JobStatus::from_db_str(&status).ok_or_else(|| anyhow!("unknown job status `{status}`"))
    }

    pub fn get_pagination(&self, filter: &JobFilter, min_id: i64) -> Result<Pagination> {
        let (mut conds, mut args) = filter.conditions();
        if min_id > 0 {
            conds.push("id >= ?".to_string());
            args.push(Value::Integer(min_id));
        }
        let mut query = "SELECT COUNT(*), MAX(id) FROM jobs".to_string();
        if !conds.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conds.join(" AND "));
        }
        let conn = self.conn.lock().unwrap();
        let pagination = conn.query_row(&query, params_from_iter(args), |row| {
            Ok(Pagination {
                count: row.get(0)?,
                max_index: row.get(1)?,
            })
        })?;
        Ok(pagination)
    }

    /// The monitor's window into the index: rows with `id <= max_idx`
    /// matching the filter, newest first, `limit` per page.
    pub fn get_jobs(
        &self,
        max_idx: i64,
        limit: i64,
        page: i64,
        filter: &JobFilter,
    ) -> Result<Vec<JobRecord>> {
        let (conds, filter_args) = filter.conditions();
        let mut query = "SELECT id, status, engine, created, started, finished, error, filename \
             FROM jobs WHERE id <= ?"
            .to_string();
        let mut args = vec![Value::Integer(max_idx)];
        for cond in conds {
            query.push_str(" AND ");
            query.push_str(&cond);
        }
        args.extend(filter_args);
        query.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");
        args.push(Value::Integer(limit));
        args.push(Value::Integer((page - 1) * limit));

        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(params_from_iter(args), |row| {
            Ok(JobRecord {
                id: row.get(0)?,
                status: row.get(1)?,
                engine: row.get(2)?,
                created: row.get(3)?,
                started: row.get(4)?,
                finished: row.get(5)?,
                error: row.get(6)?,
                filename: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// A dense engine×status matrix: every listed engine gets every known
    /// status key, zero-filled.
    pub fn engine_stats(&self, engines: &[String]) -> Result<HashMap<String, HashMap<String, i64>>> {
        let mut stats: HashMap<String, HashMap<String, i64>> = HashMap::new();
        for engine in engines {
            let per_status = stats.entry(engine.clone()).or_default();
            for status in JobStatus::iter() {
                per_status.insert(status.as_db_str().to_string(), 0);
            }
        }

        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("SELECT engine, status, COUNT(*) FROM jobs GROUP BY engine, status")?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (engine, status, count) = row?;
            if let Some(per_status) = stats.get_mut(&engine) {
                if let Some(slot) = per_status.get_mut(&status) {
                    *slot = count;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_jobs(specs: &[(&str, JobStatus)]) -> JobStore {
        let store = JobStore::open_in_memory().unwrap();
        for (engine, status) in specs {
            let jid = store.job_create(engine, None).unwrap();
            match status {
                JobStatus::Received => {}
                JobStatus::Running => store.job_set_started(jid).unwrap(),
                JobStatus::Success => {
                    store.job_set_started(jid).unwrap();
                    store.job_set_success(jid).unwrap();
                }
                JobStatus::Fail => {
                    store.job_set_started(jid).unwrap();
                    store.job_set_error(jid, "boom").unwrap();
                }
            }
        }
        store
    }

    #[test]
    fn create_assigns_increasing_ids_and_received_status() {
        let store = JobStore::open_in_memory().unwrap();
        let first = store.job_create("md5", Some("a.bin")).unwrap();
        let second = store.job_create("md5", None).unwrap();
        assert!(second.0 > first.0);
        assert_eq!(store.job_get_status(first).unwrap(), JobStatus::Received);
    }

    #[test]
    fn transitions_set_status_and_timestamps() {
        let store = JobStore::open_in_memory().unwrap();
        let jid = store.job_create("md5", None).unwrap();
        store.job_set_started(jid).unwrap();
        assert_eq!(store.job_get_status(jid).unwrap(), JobStatus::Running);
        store.job_set_success(jid).unwrap();
        assert_eq!(store.job_get_status(jid).unwrap(), JobStatus::Success);

        let jobs = store.get_jobs(jid.0, 1, 1, &JobFilter::default()).unwrap();
        let record = &jobs[0];
        assert!(record.created.is_some());
        assert!(record.started.is_some());
        assert!(record.finished.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn failure_records_the_error_string() {
        let store = JobStore::open_in_memory().unwrap();
        let jid = store.job_create("md5", None).unwrap();
        store.job_set_started(jid).unwrap();
        store.job_set_error(jid, "Job timed out").unwrap();
        assert_eq!(store.job_get_status(jid).unwrap(), JobStatus::Fail);

        let jobs = store.get_jobs(jid.0, 1, 1, &JobFilter::default()).unwrap();
        assert_eq!(jobs[0].error.as_deref(), Some("Job timed out"));
    }

    #[test]
    fn updates_against_unknown_jids_fail() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(store.job_set_started(JobId(42)).is_err());
        assert!(store.job_set_success(JobId(42)).is_err());
        assert!(store.job_set_error(JobId(42), "nope").is_err());
        assert!(store.job_get_status(JobId(42)).is_err());
    }

    #[test]
    fn pagination_counts_the_filtered_view() {
        let store = store_with_jobs(&[
            ("md5", JobStatus::Success),
            ("md5", JobStatus::Fail),
            ("zip", JobStatus::Success),
            ("zip", JobStatus::Received),
        ]);

        let all = store.get_pagination(&JobFilter::default(), 0).unwrap();
        assert_eq!(all.count, 4);
        assert_eq!(all.max_index, Some(4));

        let md5 = store
            .get_pagination(
                &JobFilter {
                    engine: Some("md5".to_string()),
                    statuses: vec![],
                },
                0,
            )
            .unwrap();
        assert_eq!(md5.count, 2);
        assert_eq!(md5.max_index, Some(2));

        let successes = store
            .get_pagination(
                &JobFilter {
                    engine: Some("zip".to_string()),
                    statuses: vec!["SUCCESS".to_string()],
                },
                0,
            )
            .unwrap();
        assert_eq!(successes.count, 1);

        let min_bound = store.get_pagination(&JobFilter::default(), 3).unwrap();
        assert_eq!(min_bound.count, 2);
    }

    #[test]
    fn pagination_over_an_empty_view_has_no_max_index() {
        let store = JobStore::open_in_memory().unwrap();
        let empty = store.get_pagination(&JobFilter::default(), 0).unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(empty.max_index, None);
    }

    #[test]
    fn get_jobs_windows_newest_first() {
        let store = store_with_jobs(&[
            ("md5", JobStatus::Received),
            ("md5", JobStatus::Received),
            ("md5", JobStatus::Received),
            ("md5", JobStatus::Received),
            ("md5", JobStatus::Received),
        ]);

        let first_page = store.get_jobs(4, 2, 1, &JobFilter::default()).unwrap();
        assert_eq!(
            first_page.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![4, 3]
        );
        let second_page = store.get_jobs(4, 2, 2, &JobFilter::default()).unwrap();
        assert_eq!(
            second_page.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![2, 1]
        );
    }

    #[test]
    fn get_jobs_composes_filters_with_and() {
        let store = store_with_jobs(&[
            ("md5", JobStatus::Success),
            ("zip", JobStatus::Success),
            ("md5", JobStatus::Fail),
        ]);
        let filter = JobFilter {
            engine: Some("md5".to_string()),
            statuses: vec!["SUCCESS".to_string(), "FAIL".to_string()],
        };
        let jobs = store.get_jobs(100, 10, 1, &filter).unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn engine_stats_matrix_is_dense_and_accurate() {
        let store = store_with_jobs(&[
            ("md5", JobStatus::Success),
            ("md5", JobStatus::Success),
            ("md5", JobStatus::Fail),
            ("zip", JobStatus::Running),
        ]);
        let stats = store
            .engine_stats(&["md5".to_string(), "zip".to_string(), "idle".to_string()])
            .unwrap();

        for engine in ["md5", "zip", "idle"] {
            let per_status = &stats[engine];
            for key in ["RECEIVED", "RUNNING", "FAIL", "SUCCESS"] {
                assert!(per_status.contains_key(key), "{engine} missing {key}");
            }
        }
        assert_eq!(stats["md5"]["SUCCESS"], 2);
        assert_eq!(stats["md5"]["FAIL"], 1);
        assert_eq!(stats["md5"]["RECEIVED"], 0);
        assert_eq!(stats["zip"]["RUNNING"], 1);
        assert_eq!(stats["idle"]["SUCCESS"], 0);
    }
}
