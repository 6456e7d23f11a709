//! SQLite task repository
//!
//! One table per lifecycle stage. Each move deletes the source row and
//! inserts the target row inside one transaction; if the delete matched
//! nothing the transaction is dropped and the move reports `false`.

use super::{Page, PageResult, StageCounts, TaskRepository};
use crate::state::{TaskStage, TaskState};
use crate::task::{FinishedTask, NewTask, RunningTask, TaskId, TaskInfo, WaitingTask};
use athena_foundation::{Error, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "athena.db";

const INFO_COLUMNS: &str = "task_id, task_type, command, submit_time, host, max_tries";
const RUNNING_COLUMNS: &str =
    "task_id, task_type, command, submit_time, host, max_tries, start_time, pid, try_number";
const FINISHED_COLUMNS: &str = "task_id, task_type, command, submit_time, host, max_tries, \
                                start_time, pid, try_number, end_time, state";

/// rusqlite-backed repository
#[derive(Clone)]
pub struct SqliteTaskRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskRepository {
    /// Open (or create) `athena.db` inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.initialize_schema()?;
        info!("Opened task database at {}", db_path.display());
        Ok(repo)
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.initialize_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS waiting_task (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                command TEXT NOT NULL,
                submit_time TEXT NOT NULL,
                host TEXT,
                max_tries INTEGER NOT NULL CHECK(max_tries >= 1)
            );

            CREATE INDEX IF NOT EXISTS idx_waiting_submit
                ON waiting_task(submit_time);

            CREATE TABLE IF NOT EXISTS running_task (
                task_id INTEGER PRIMARY KEY,
                task_type TEXT NOT NULL,
                command TEXT NOT NULL,
                submit_time TEXT NOT NULL,
                host TEXT,
                max_tries INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                pid INTEGER NOT NULL,
                try_number INTEGER NOT NULL CHECK(try_number >= 1)
            );

            CREATE TABLE IF NOT EXISTS finished_task (
                task_id INTEGER PRIMARY KEY,
                task_type TEXT NOT NULL,
                command TEXT NOT NULL,
                submit_time TEXT NOT NULL,
                host TEXT,
                max_tries INTEGER NOT NULL,
                start_time TEXT,
                pid INTEGER,
                try_number INTEGER NOT NULL,
                end_time TEXT NOT NULL,
                state TEXT NOT NULL CHECK(state IN ('SUCCESS', 'FAILED', 'LOST'))
            );

            CREATE INDEX IF NOT EXISTS idx_finished_end
                ON finished_task(end_time);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| Error::Storage(format!("Failed to record schema version: {}", e)))?;

        debug!("Task schema at version {}", CURRENT_SCHEMA_VERSION);
        Ok(())
    }

    fn count(conn: &Connection, stage: TaskStage) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", stage.table());
        let n: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| Error::Storage(format!("Failed to count {}: {}", stage.table(), e)))?;
        Ok(n as usize)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn fmt_time(t: &DateTime<Utc>) -> String {
    // fixed width so text order == time order
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn info_from_row(row: &Row<'_>) -> rusqlite::Result<TaskInfo> {
    let submit_time: String = row.get(3)?;
    Ok(TaskInfo {
        task_id: TaskId(row.get(0)?),
        task_type: row.get(1)?,
        command: row.get(2)?,
        submit_time: parse_time(3, &submit_time)?,
        host: row.get(4)?,
        max_tries: row.get(5)?,
    })
}

fn waiting_from_row(row: &Row<'_>) -> rusqlite::Result<WaitingTask> {
    Ok(WaitingTask {
        info: info_from_row(row)?,
    })
}

fn running_from_row(row: &Row<'_>) -> rusqlite::Result<RunningTask> {
    let start_time: String = row.get(6)?;
    Ok(RunningTask {
        info: info_from_row(row)?,
        start_time: parse_time(6, &start_time)?,
        pid: row.get(7)?,
        try_number: row.get(8)?,
    })
}

fn finished_from_row(row: &Row<'_>) -> rusqlite::Result<FinishedTask> {
    let start_time: Option<String> = row.get(6)?;
    let end_time: String = row.get(9)?;
    let state: String = row.get(10)?;
    Ok(FinishedTask {
        info: info_from_row(row)?,
        start_time: start_time.map(|s| parse_time(6, &s)).transpose()?,
        pid: row.get(7)?,
        try_number: row.get(8)?,
        end_time: parse_time(9, &end_time)?,
        state: state
            .parse::<TaskState>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, e.into()))?,
    })
}

fn insert_running(conn: &Connection, task: &RunningTask) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO running_task ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            RUNNING_COLUMNS
        ),
        params![
            task.info.task_id.0,
            task.info.task_type,
            task.info.command,
            fmt_time(&task.info.submit_time),
            task.info.host,
            task.info.max_tries,
            fmt_time(&task.start_time),
            task.pid,
            task.try_number,
        ],
    )
}

fn insert_finished(conn: &Connection, task: &FinishedTask) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO finished_task ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            FINISHED_COLUMNS
        ),
        params![
            task.info.task_id.0,
            task.info.task_type,
            task.info.command,
            fmt_time(&task.info.submit_time),
            task.info.host,
            task.info.max_tries,
            task.start_time.as_ref().map(fmt_time),
            task.pid,
            task.try_number,
            fmt_time(&task.end_time),
            task.state.as_str(),
        ],
    )
}

fn delete_from(conn: &Connection, stage: TaskStage, task_id: TaskId) -> rusqlite::Result<usize> {
    conn.execute(
        &format!("DELETE FROM {} WHERE task_id = ?1", stage.table()),
        params![task_id.0],
    )
}

// ============================================================================
// TaskRepository
// ============================================================================

impl TaskRepository for SqliteTaskRepository {
    fn submit(&self, task: NewTask) -> Result<WaitingTask> {
        let conn = self.lock()?;
        // stored with microsecond precision
        let submit_time = Utc::now().trunc_subsecs(6);
        conn.execute(
            r#"
            INSERT INTO waiting_task (task_type, command, submit_time, host, max_tries)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                task.task_type,
                task.command,
                fmt_time(&submit_time),
                task.host,
                task.max_tries,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to submit task: {}", e)))?;

        let task_id = TaskId(conn.last_insert_rowid());
        Ok(task.into_waiting(task_id, submit_time))
    }

    fn get_waiting_tasks(&self, page: &Page) -> Result<PageResult<WaitingTask>> {
        let conn = self.lock()?;
        let total = Self::count(&conn, TaskStage::Waiting)?;

        let sql = format!(
            "SELECT {} FROM waiting_task {} LIMIT ?1 OFFSET ?2",
            INFO_COLUMNS,
            page.order_by_sql()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let elements = stmt
            .query_map(
                params![page.size as i64, page.offset() as i64],
                waiting_from_row,
            )
            .map_err(|e| Error::Storage(format!("Failed to query waiting tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PageResult {
            elements,
            index: page.index,
            total,
        })
    }

    fn get_waiting_task(&self, task_id: TaskId) -> Result<Option<WaitingTask>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM waiting_task WHERE task_id = ?1", INFO_COLUMNS),
            params![task_id.0],
            waiting_from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get waiting task: {}", e)))
    }

    fn get_running_task(&self, task_id: TaskId) -> Result<Option<RunningTask>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM running_task WHERE task_id = ?1", RUNNING_COLUMNS),
            params![task_id.0],
            running_from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get running task: {}", e)))
    }

    fn get_all_running_tasks(&self) -> Result<Vec<RunningTask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM running_task ORDER BY task_id ASC",
                RUNNING_COLUMNS
            ))
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let tasks = stmt
            .query_map([], running_from_row)
            .map_err(|e| Error::Storage(format!("Failed to query running tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn get_finished_task(&self, task_id: TaskId) -> Result<Option<FinishedTask>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM finished_task WHERE task_id = ?1", FINISHED_COLUMNS),
            params![task_id.0],
            finished_from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get finished task: {}", e)))
    }

    fn get_finished_tasks(&self, page: &Page) -> Result<PageResult<FinishedTask>> {
        let conn = self.lock()?;
        let total = Self::count(&conn, TaskStage::Finished)?;

        let sql = format!(
            "SELECT {} FROM finished_task {} LIMIT ?1 OFFSET ?2",
            FINISHED_COLUMNS,
            page.order_by_sql()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;
        let elements = stmt
            .query_map(
                params![page.size as i64, page.offset() as i64],
                finished_from_row,
            )
            .map_err(|e| Error::Storage(format!("Failed to query finished tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PageResult {
            elements,
            index: page.index,
            total,
        })
    }

    fn move_to_running(&self, task: &RunningTask) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if delete_from(&tx, TaskStage::Waiting, task.task_id())? == 0 {
            return Ok(false);
        }
        insert_running(&tx, task)?;
        tx.commit()?;
        Ok(true)
    }

    fn update_running_task(&self, task: &RunningTask) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE running_task SET
                    host = ?2,
                    start_time = ?3,
                    pid = ?4,
                    try_number = ?5
                WHERE task_id = ?1
                "#,
                params![
                    task.info.task_id.0,
                    task.info.host,
                    fmt_time(&task.start_time),
                    task.pid,
                    task.try_number,
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to update running task: {}", e)))?;
        Ok(changed > 0)
    }

    fn move_to_finished(&self, task: &FinishedTask) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if delete_from(&tx, TaskStage::Running, task.task_id())? == 0 {
            return Ok(false);
        }
        insert_finished(&tx, task)?;
        tx.commit()?;
        Ok(true)
    }

    fn move_from_waiting_to_finished(&self, task: &FinishedTask) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if delete_from(&tx, TaskStage::Waiting, task.task_id())? == 0 {
            return Ok(false);
        }
        insert_finished(&tx, task)?;
        tx.commit()?;
        Ok(true)
    }

    fn assign_host(&self, task_id: TaskId, host: &str) -> Result<Option<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for stage in [TaskStage::Waiting, TaskStage::Running, TaskStage::Finished] {
            tx.execute(
                &format!(
                    "UPDATE {} SET host = ?2 WHERE task_id = ?1 AND (host IS NULL OR TRIM(host) = '')",
                    stage.table()
                ),
                params![task_id.0, host],
            )?;
            let stored: Option<Option<String>> = tx
                .query_row(
                    &format!("SELECT host FROM {} WHERE task_id = ?1", stage.table()),
                    params![task_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(stored) = stored {
                tx.commit()?;
                return Ok(stored);
            }
        }
        Ok(None)
    }

    fn counts(&self) -> Result<StageCounts> {
        let conn = self.lock()?;
        Ok(StageCounts {
            waiting: Self::count(&conn, TaskStage::Waiting)?,
            running: Self::count(&conn, TaskStage::Running)?,
            finished: Self::count(&conn, TaskStage::Finished)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{Sort, SortField};

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    #[test]
    fn test_schema_version() {
        let repo = SqliteTaskRepository::in_memory().expect("Failed to create repository");
        assert_eq!(repo.get_schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_submit_and_page() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        for i in 0..4 {
            repo.submit(NewTask::new("shell", format!("echo {}", i), 2))
                .expect("Failed to submit");
        }

        let page = repo.get_waiting_tasks(&Page::oldest_first(3)).unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.elements.len(), 3);
        assert_eq!(page.elements[0].info.command, "echo 0");
        assert_eq!(page.elements[2].info.command, "echo 2");

        let newest = repo
            .get_waiting_tasks(&Page::new(0, 1, vec![Sort::desc(SortField::TaskId)]))
            .unwrap();
        assert_eq!(newest.elements[0].info.command, "echo 3");
    }

    #[test]
    fn test_lifecycle_moves() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let waiting = repo.submit(NewTask::new("shell", "true", 3)).unwrap();
        let id = waiting.task_id();

        let mut running = waiting.start(4242, now());
        assert!(repo.move_to_running(&running).unwrap());
        assert!(!repo.move_to_running(&running).unwrap());

        running.restart(4343);
        assert!(repo.update_running_task(&running).unwrap());
        let stored = repo.get_running_task(id).unwrap().unwrap();
        assert_eq!(stored.try_number, 2);
        assert_eq!(stored.pid, 4343);
        assert_eq!(stored.start_time, running.start_time);

        let finished = running.finish(TaskState::Lost, now());
        assert!(repo.move_to_finished(&finished).unwrap());
        assert!(repo.get_running_task(id).unwrap().is_none());
        assert!(!repo.update_running_task(&stored).unwrap());

        let stored = repo.get_finished_task(id).unwrap().unwrap();
        assert_eq!(stored, finished);
        assert_eq!(repo.counts().unwrap().finished, 1);
    }

    #[test]
    fn test_launch_failure_move() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let waiting = repo.submit(NewTask::new("shell", "missing-binary", 3)).unwrap();
        let id = waiting.task_id();

        assert!(repo
            .move_from_waiting_to_finished(&waiting.fail_to_launch(now()))
            .unwrap());
        let finished = repo.get_finished_task(id).unwrap().unwrap();
        assert_eq!(finished.state, TaskState::Failed);
        assert!(finished.start_time.is_none());
        assert!(finished.pid.is_none());

        let page = repo.get_finished_tasks(&Page::oldest_first(10)).unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_assign_host() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let waiting = repo
            .submit(NewTask::new("shell", "true", 1).with_host("node-a"))
            .unwrap();
        let id = waiting.task_id();
        assert_eq!(repo.assign_host(id, "node-b").unwrap().as_deref(), Some("node-a"));

        let other = repo.submit(NewTask::new("shell", "true", 1)).unwrap();
        assert_eq!(
            repo.assign_host(other.task_id(), "node-b").unwrap().as_deref(),
            Some("node-b")
        );
        assert_eq!(repo.assign_host(TaskId(77), "node-b").unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = std::env::temp_dir().join(format!("athena-sqlite-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let id = {
            let repo = SqliteTaskRepository::open(&dir).unwrap();
            let waiting = repo.submit(NewTask::new("shell", "sleep 1", 2)).unwrap();
            repo.move_to_running(&waiting.clone().start(1, now()))
                .unwrap();
            waiting.task_id()
        };

        let repo = SqliteTaskRepository::open(&dir).unwrap();
        let running = repo.get_all_running_tasks().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id(), id);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
