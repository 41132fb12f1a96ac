/// SQL task store over `sqlx::AnyPool`
///
/// Accepts `sqlite:` and `postgres:` URLs. Only portable SQL is used:
/// `$N` placeholders, TEXT columns for timestamps (RFC 3339) and JSON
/// encoded lists, BIGINT for integers and flags.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info};

use shared::{DetectorError, Result};

use super::{StoreEngine, TaskStore};
use crate::models::task::SERVICE_TAG;
use crate::models::{
    Machine, MachineCriteria, MachineState, NewTask, Task, TaskCategory, TaskStatus,
};

const TASK_COLUMNS: &str = "id, category, target, options, package, platform, machine, tags, \
     priority, timeout, status, added_on, started_on, completed_on";

const MACHINE_COLUMNS: &str = "name, label, platform, ip, tags, interface, snapshot, service, state";

pub struct SqlTaskStore {
    pool: AnyPool,
    engine: StoreEngine,
}

impl SqlTaskStore {
    /// Connect and create the schema if it does not exist yet
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let engine = if url.starts_with("sqlite:") {
            StoreEngine::Sqlite
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            StoreEngine::Postgres
        } else {
            return Err(DetectorError::Database(format!(
                "unsupported database url scheme: {}",
                url
            )));
        };

        sqlx::any::install_default_drivers();

        let mut options = AnyPoolOptions::new().max_connections(max_connections);
        if url.contains(":memory:") {
            // Every connection to an in-memory database is a distinct database.
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options.connect(url).await?;
        info!(engine = %engine, "Task store connected");

        let store = Self { pool, engine };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let id_column = match self.engine {
            StoreEngine::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            StoreEngine::Postgres => "id BIGSERIAL PRIMARY KEY",
        };

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                {},
                category TEXT NOT NULL,
                target TEXT NOT NULL,
                options TEXT NOT NULL,
                package TEXT,
                platform TEXT,
                machine TEXT,
                tags TEXT NOT NULL,
                service BIGINT NOT NULL DEFAULT 0,
                priority BIGINT NOT NULL DEFAULT 1,
                timeout BIGINT,
                status TEXT NOT NULL,
                added_on TEXT NOT NULL,
                started_on TEXT,
                completed_on TEXT
            )
            "#,
            id_column
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                name TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                platform TEXT NOT NULL,
                ip TEXT NOT NULL,
                tags TEXT NOT NULL,
                interface TEXT,
                snapshot TEXT,
                service BIGINT NOT NULL DEFAULT 0,
                state TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)")
            .execute(&self.pool)
            .await?;

        debug!("Task store schema ready");
        Ok(())
    }

    fn row_to_task(row: &AnyRow) -> Result<Task> {
        let category: String = row.try_get("category")?;
        let status: String = row.try_get("status")?;
        let options: String = row.try_get("options")?;
        let tags: String = row.try_get("tags")?;
        let timeout: Option<i64> = row.try_get("timeout")?;
        let added_on: String = row.try_get("added_on")?;
        let started_on: Option<String> = row.try_get("started_on")?;
        let completed_on: Option<String> = row.try_get("completed_on")?;

        Ok(Task {
            id: row.try_get("id")?,
            category: category.parse()?,
            target: row.try_get("target")?,
            options: decode_json::<BTreeMap<String, String>>(&options)?,
            package: row.try_get("package")?,
            platform: row.try_get("platform")?,
            machine: row.try_get("machine")?,
            tags: decode_json::<Vec<String>>(&tags)?,
            priority: row.try_get("priority")?,
            timeout: timeout.map(|t| t.max(0) as u64),
            status: status.parse()?,
            added_on: parse_time(&added_on)?,
            started_on: started_on.as_deref().map(parse_time).transpose()?,
            completed_on: completed_on.as_deref().map(parse_time).transpose()?,
        })
    }

    fn row_to_machine(row: &AnyRow) -> Result<Machine> {
        let ip: String = row.try_get("ip")?;
        let tags: String = row.try_get("tags")?;
        let service: i64 = row.try_get("service")?;
        let state: String = row.try_get("state")?;

        Ok(Machine {
            name: row.try_get("name")?,
            label: row.try_get("label")?,
            platform: row.try_get("platform")?,
            ip: ip
                .parse::<IpAddr>()
                .map_err(|e| DetectorError::Database(format!("invalid machine ip '{}': {}", ip, e)))?,
            tags: decode_json::<Vec<String>>(&tags)?,
            interface: row.try_get("interface")?,
            snapshot: row.try_get("snapshot")?,
            service: service != 0,
            state: state.parse()?,
        })
    }

    async fn machines_in_state(&self, state: Option<MachineState>) -> Result<Vec<Machine>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {} FROM machines WHERE state = $1 ORDER BY name",
                    MACHINE_COLUMNS
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {} FROM machines ORDER BY name", MACHINE_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_machine).collect()
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| DetectorError::Database(format!("corrupt column: {}", e)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DetectorError::Database(e.to_string()))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DetectorError::Database(format!("invalid timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl TaskStore for SqlTaskStore {
    fn engine(&self) -> StoreEngine {
        self.engine
    }

    async fn add_task(&self, task: NewTask) -> Result<i64> {
        if task.target.trim().is_empty() {
            return Err(DetectorError::Operational("task target cannot be empty".to_string()));
        }
        let category = task.category.unwrap_or(TaskCategory::File);
        let service = task.tags.iter().any(|t| t == SERVICE_TAG);

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (category, target, options, package, platform, machine, tags,
                               service, priority, timeout, status, added_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(category.as_str())
        .bind(task.target)
        .bind(encode_json(&task.options)?)
        .bind(task.package)
        .bind(task.platform)
        .bind(task.machine)
        .bind(encode_json(&task.tags)?)
        .bind(service as i64)
        .bind(task.priority)
        .bind(task.timeout.map(|t| t as i64))
        .bind(TaskStatus::Pending.as_str())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        debug!(task_id = id, "Task added");
        Ok(id)
    }

    async fn view_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn fetch(&self, machine: Option<&str>, service: Option<bool>) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let mut sql = format!("SELECT {} FROM tasks WHERE status = $1", TASK_COLUMNS);
        match (machine, service) {
            (Some(_), _) => sql.push_str(" AND machine = $2"),
            (None, Some(only_service)) => {
                sql.push_str(" AND machine IS NULL");
                sql.push_str(if only_service { " AND service = 1" } else { " AND service = 0" });
            }
            (None, None) => {}
        }
        sql.push_str(" ORDER BY priority DESC, id ASC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(TaskStatus::Pending.as_str());
        if let Some(name) = machine {
            query = query.bind(name);
        }

        let Some(row) = query.fetch_optional(&mut *tx).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut task = Self::row_to_task(&row)?;

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE tasks SET status = $1, started_on = $2 WHERE id = $3 AND status = $4",
        )
        .bind(TaskStatus::Running.as_str())
        .bind(now.to_rfc3339())
        .bind(task.id)
        .bind(TaskStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        task.status = TaskStatus::Running;
        task.started_on = Some(now);
        Ok(Some(task))
    }

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        let Some(previous) = status.predecessor() else {
            return Err(DetectorError::Operational(format!(
                "task #{} cannot re-enter {}",
                task_id, status
            )));
        };
        let now = Utc::now().to_rfc3339();

        let query = match status {
            TaskStatus::Running => sqlx::query(
                "UPDATE tasks SET status = $1, started_on = $2 WHERE id = $3 AND status = $4",
            )
            .bind(status.as_str())
            .bind(now),
            TaskStatus::Completed => sqlx::query(
                "UPDATE tasks SET status = $1, completed_on = $2 WHERE id = $3 AND status = $4",
            )
            .bind(status.as_str())
            .bind(now),
            _ => sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2 AND status = $3")
                .bind(status.as_str()),
        };

        let updated = query
            .bind(task_id)
            .bind(previous.as_str())
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(DetectorError::Operational(format!(
                "task #{} is not {}, cannot move it to {}",
                task_id, previous, status
            )));
        }
        Ok(())
    }

    async fn register_machine(&self, machine: &Machine) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO machines ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            MACHINE_COLUMNS
        ))
        .bind(machine.name.clone())
        .bind(machine.label.clone())
        .bind(machine.platform.clone())
        .bind(machine.ip.to_string())
        .bind(encode_json(&machine.tags)?)
        .bind(machine.interface.clone())
        .bind(machine.snapshot.clone())
        .bind(machine.service as i64)
        .bind(machine.state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clean_machines(&self) -> Result<()> {
        sqlx::query("DELETE FROM machines").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.machines_in_state(None).await
    }

    async fn get_available_machines(&self) -> Result<Vec<Machine>> {
        self.machines_in_state(Some(MachineState::Free)).await
    }

    async fn lock_machine(&self, criteria: &MachineCriteria) -> Result<Option<Machine>> {
        let candidates = self.machines_in_state(Some(MachineState::Free)).await?;

        for mut machine in candidates.into_iter().filter(|m| criteria.matches(m)) {
            let updated = sqlx::query("UPDATE machines SET state = $1 WHERE name = $2 AND state = $3")
                .bind(MachineState::Starting.as_str())
                .bind(machine.name.clone())
                .bind(MachineState::Free.as_str())
                .execute(&self.pool)
                .await?;

            // Lost the race for this one, try the next candidate.
            if updated.rows_affected() == 0 {
                continue;
            }
            machine.state = MachineState::Starting;
            return Ok(Some(machine));
        }
        Ok(None)
    }

    async fn unlock_machine(&self, name: &str) -> Result<()> {
        self.set_machine_state(name, MachineState::Free).await
    }

    async fn set_machine_state(&self, name: &str, state: MachineState) -> Result<()> {
        let updated = sqlx::query("UPDATE machines SET state = $1 WHERE name = $2")
            .bind(state.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DetectorError::Machine(format!("unknown machine '{}'", name)));
        }
        Ok(())
    }
}
