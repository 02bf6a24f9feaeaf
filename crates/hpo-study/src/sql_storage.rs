//! SQL storage shared by all workers of a study.
//!
//! A `mysql` connection target is attached through DuckDB's MySQL extension so
//! every worker writes into the same database server. Any other target names a
//! DuckDB database file.

use chrono::{DateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use hpo_types::{Distribution, HpoError, HpoResult, ParameterValue, StudyError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionTarget;
use crate::storage::{check_running, trial_not_found, StudyRecord, StudyStorage};
use crate::trial::{FrozenTrial, ObjectiveDirection, StudyId, TrialId, TrialState};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS hpo_studies (
        id VARCHAR(36) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        direction VARCHAR(16) NOT NULL,
        created_at VARCHAR(40) NOT NULL
    );
    CREATE TABLE IF NOT EXISTS hpo_trials (
        id VARCHAR(36) PRIMARY KEY,
        study_id VARCHAR(36) NOT NULL,
        number BIGINT NOT NULL,
        state VARCHAR(16) NOT NULL,
        value DOUBLE,
        started_at VARCHAR(40) NOT NULL,
        finished_at VARCHAR(40),
        UNIQUE (study_id, number)
    );
    CREATE TABLE IF NOT EXISTS hpo_trial_params (
        trial_id VARCHAR(36) NOT NULL,
        name VARCHAR(255) NOT NULL,
        distribution TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (trial_id, name)
    );
    CREATE TABLE IF NOT EXISTS hpo_trial_values (
        trial_id VARCHAR(36) NOT NULL,
        step BIGINT NOT NULL,
        value DOUBLE NOT NULL,
        PRIMARY KEY (trial_id, step)
    );";

const NUMBER_RETRIES: usize = 8;

fn db_err(e: duckdb::Error) -> HpoError {
    StudyError::Storage {
        message: e.to_string(),
    }
    .into()
}

fn corrupt(what: &str, raw: &str) -> HpoError {
    StudyError::Storage {
        message: format!("unreadable {what}: {raw}"),
    }
    .into()
}

fn parse_uuid(raw: &str) -> HpoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| corrupt("id", raw))
}

fn parse_time(raw: &str) -> HpoResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", raw))
}

/// Quote `value` as a SQL string literal.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statements attaching the MySQL backend as schema `hpo`. Credentials go
/// through a temporary secret so they are never parsed as a connection string.
fn mysql_attach_sql(target: &ConnectionTarget) -> String {
    let mut secret = format!(
        "TYPE mysql, HOST {}, USER {}, PASSWORD {}, DATABASE {}",
        sql_literal(&target.host),
        sql_literal(&target.username),
        sql_literal(&target.password),
        sql_literal(&target.database)
    );
    if let Some(port) = target.port {
        secret.push_str(&format!(", PORT {port}"));
    }
    format!(
        "INSTALL mysql; LOAD mysql; \
         CREATE OR REPLACE TEMPORARY SECRET hpo_backend ({secret}); \
         ATTACH '' AS hpo (TYPE mysql, SECRET hpo_backend); USE hpo;"
    )
}

struct TrialRow {
    id: String,
    study_id: String,
    number: i64,
    state: String,
    value: Option<f64>,
    started_at: String,
    finished_at: Option<String>,
}

pub struct DuckDbStorage {
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for DuckDbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStorage").finish_non_exhaustive()
    }
}

impl DuckDbStorage {
    /// Connect to the backend named by `target` and create the tables.
    pub fn open(target: &ConnectionTarget) -> HpoResult<Self> {
        let connection = if target.is_mysql() {
            let connection = Connection::open_in_memory().map_err(db_err)?;
            connection
                .execute_batch(&mysql_attach_sql(target))
                .map_err(db_err)?;
            debug!(backend = %target.redacted(), "attached mysql backend");
            connection
        } else {
            Connection::open(&target.database).map_err(db_err)?
        };
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> HpoResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(connection: Connection) -> HpoResult<Self> {
        connection.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn study_by_name(conn: &Connection, name: &str) -> HpoResult<Option<StudyRecord>> {
        let row = conn
            .query_row(
                "SELECT id, name, direction, created_at FROM hpo_studies WHERE name = ?",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(id, name, direction, created_at)| {
            Ok(StudyRecord {
                id: parse_uuid(&id)?,
                direction: ObjectiveDirection::parse(&direction)
                    .ok_or_else(|| corrupt("direction", &direction))?,
                created_at: parse_time(&created_at)?,
                name,
            })
        })
        .transpose()
    }

    fn load_trials(conn: &Connection, column: &str, key: &str) -> HpoResult<Vec<FrozenTrial>> {
        let sql = format!(
            "SELECT id, study_id, number, state, value, started_at, finished_at
             FROM hpo_trials WHERE {column} = ? ORDER BY number"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(TrialRow {
                    id: row.get(0)?,
                    study_id: row.get(1)?,
                    number: row.get(2)?,
                    state: row.get(3)?,
                    value: row.get(4)?,
                    started_at: row.get(5)?,
                    finished_at: row.get(6)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|row| Self::hydrate(conn, row))
            .collect()
    }

    fn hydrate(conn: &Connection, row: TrialRow) -> HpoResult<FrozenTrial> {
        let mut trial = FrozenTrial {
            id: parse_uuid(&row.id)?,
            study_id: parse_uuid(&row.study_id)?,
            number: row.number as u64,
            state: TrialState::parse(&row.state).ok_or_else(|| corrupt("state", &row.state))?,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            value: row.value,
            started_at: parse_time(&row.started_at)?,
            finished_at: row.finished_at.as_deref().map(parse_time).transpose()?,
        };

        let mut stmt = conn
            .prepare("SELECT name, distribution, value FROM hpo_trial_params WHERE trial_id = ?")
            .map_err(db_err)?;
        let params_rows = stmt
            .query_map(params![row.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (name, distribution, value) in params_rows {
            let distribution: Distribution = serde_json::from_str(&distribution)?;
            let value: ParameterValue = serde_json::from_str(&value)?;
            trial.distributions.insert(name.clone(), distribution);
            trial.params.insert(name, value);
        }

        let mut stmt = conn
            .prepare("SELECT step, value FROM hpo_trial_values WHERE trial_id = ?")
            .map_err(db_err)?;
        let values = stmt
            .query_map(params![row.id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (step, value) in values {
            trial.intermediate_values.insert(step as u64, value);
        }

        Ok(trial)
    }

    fn trial(conn: &Connection, trial_id: TrialId) -> HpoResult<FrozenTrial> {
        Self::load_trials(conn, "id", &trial_id.to_string())?
            .pop()
            .ok_or_else(|| trial_not_found(trial_id).into())
    }
}

impl StudyStorage for DuckDbStorage {
    fn get_or_create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
    ) -> HpoResult<StudyRecord> {
        let conn = self.connection.lock();
        if let Some(existing) = Self::study_by_name(&conn, name)? {
            return Ok(existing);
        }

        let record = StudyRecord::new(name, direction);
        let inserted = conn.execute(
            "INSERT INTO hpo_studies (id, name, direction, created_at) VALUES (?, ?, ?, ?)",
            params![
                record.id.to_string(),
                record.name,
                record.direction.as_str(),
                record.created_at.to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => Ok(record),
            // Another worker created it between our lookup and insert.
            Err(e) => Self::study_by_name(&conn, name)?.ok_or_else(|| db_err(e)),
        }
    }

    fn find_study(&self, name: &str) -> HpoResult<Option<StudyRecord>> {
        Self::study_by_name(&self.connection.lock(), name)
    }

    fn delete_study(&self, name: &str) -> HpoResult<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let record = Self::study_by_name(&tx, name)?.ok_or_else(|| StudyError::NotFound {
            name: name.to_string(),
        })?;
        let id = record.id.to_string();
        tx.execute(
            "DELETE FROM hpo_trial_values WHERE trial_id IN (SELECT id FROM hpo_trials WHERE study_id = ?)",
            params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM hpo_trial_params WHERE trial_id IN (SELECT id FROM hpo_trials WHERE study_id = ?)",
            params![id],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM hpo_trials WHERE study_id = ?", params![id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM hpo_studies WHERE id = ?", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn list_studies(&self) -> HpoResult<Vec<StudyRecord>> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM hpo_studies ORDER BY name")
            .map_err(db_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = Self::study_by_name(&conn, &name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn create_trial(&self, study_id: StudyId) -> HpoResult<FrozenTrial> {
        let conn = self.connection.lock();
        let study = study_id.to_string();
        let known: Option<String> = conn
            .query_row(
                "SELECT id FROM hpo_studies WHERE id = ?",
                params![study],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if known.is_none() {
            return Err(StudyError::NotFound { name: study }.into());
        }

        // Numbers are unique per study; a concurrent worker taking the same
        // number makes the insert fail and we try the next one.
        let mut last_error = None;
        for attempt in 0..NUMBER_RETRIES {
            let next: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(number) + 1, 0) FROM hpo_trials WHERE study_id = ?",
                    params![study],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            let trial = FrozenTrial::new(study_id, next as u64);
            let inserted = conn.execute(
                "INSERT INTO hpo_trials (id, study_id, number, state, value, started_at, finished_at)
                 VALUES (?, ?, ?, ?, NULL, ?, NULL)",
                params![
                    trial.id.to_string(),
                    study,
                    next,
                    trial.state.as_str(),
                    trial.started_at.to_rfc3339()
                ],
            );
            match inserted {
                Ok(_) => return Ok(trial),
                Err(e) => {
                    warn!(attempt, number = next, "trial number taken, retrying: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.map(db_err).unwrap_or_else(|| {
            HpoError::Internal("trial number allocation did not run".into())
        }))
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        distribution: &Distribution,
        value: ParameterValue,
    ) -> HpoResult<()> {
        let conn = self.connection.lock();
        check_running(&Self::trial(&conn, trial_id)?)?;
        conn.execute(
            "INSERT INTO hpo_trial_params (trial_id, name, distribution, value) VALUES (?, ?, ?, ?)",
            params![
                trial_id.to_string(),
                name,
                serde_json::to_string(distribution)?,
                serde_json::to_string(&value)?
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn set_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> HpoResult<()> {
        let conn = self.connection.lock();
        let trial = Self::trial(&conn, trial_id)?;
        check_running(&trial)?;
        if trial.intermediate_values.contains_key(&step) {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO hpo_trial_values (trial_id, step, value) VALUES (?, ?, ?)",
            params![trial_id.to_string(), step as i64, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn finish_trial(
        &self,
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
    ) -> HpoResult<FrozenTrial> {
        let conn = self.connection.lock();
        let mut trial = Self::trial(&conn, trial_id)?;
        check_running(&trial)?;

        let finished_at = Utc::now();
        let updated = conn
            .execute(
                "UPDATE hpo_trials SET state = ?, value = ?, finished_at = ?
                 WHERE id = ? AND state = ?",
                params![
                    state.as_str(),
                    value,
                    finished_at.to_rfc3339(),
                    trial_id.to_string(),
                    TrialState::Running.as_str()
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            // Finished by someone else after we read it.
            return Err(StudyError::TrialAlreadyFinished {
                number: trial.number,
                state: Self::trial(&conn, trial_id)?.state.to_string(),
            }
            .into());
        }

        trial.state = state;
        trial.value = value;
        trial.finished_at = Some(finished_at);
        Ok(trial)
    }

    fn get_trial(&self, trial_id: TrialId) -> HpoResult<FrozenTrial> {
        Self::trial(&self.connection.lock(), trial_id)
    }

    fn get_all_trials(&self, study_id: StudyId) -> HpoResult<Vec<FrozenTrial>> {
        Self::load_trials(&self.connection.lock(), "study_id", &study_id.to_string())
    }
}
