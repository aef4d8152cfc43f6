use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::schema::{split_sql_statements, SCHEMA_VERSION, SQLITE_SCHEMA_SQL};
use super::{
    AttemptHistoryStore, AttemptQuery, AttemptTotals, LearnerProfileStore, ModelArtifactStore,
    SkillProficiencyStore, SortOrder, StoreError,
};
use crate::types::{ExerciseAttempt, LearnerProfile, ModelKind, SkillProficiency, TrainedModel};

pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adaptive-engine")
        .join("engine.db")
}

/// SQLite-backed implementation of every storage seam.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StoreError::Config(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::debug!(path = %path.display(), "sqlite store ready");
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let version: Option<String> = sqlx::query_scalar(
            r#"SELECT "value" FROM "_db_metadata" WHERE "key" = 'schema_version'"#,
        )
        .fetch_optional(&self.pool)
        .await
        .unwrap_or(None);

        if version.as_deref() == Some(SCHEMA_VERSION) {
            return Ok(());
        }

        for stmt in split_sql_statements(SQLITE_SCHEMA_SQL) {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"INSERT OR REPLACE INTO "_db_metadata" ("key", "value") VALUES ('schema_version', ?)"#,
        )
        .bind(SCHEMA_VERSION)
        .execute(&self.pool)
        .await?;

        tracing::info!(version = SCHEMA_VERSION, "sqlite schema applied");
        Ok(())
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn attempt_from_row(row: &SqliteRow) -> Result<ExerciseAttempt, StoreError> {
    let difficulty: i64 = row.try_get("difficulty")?;
    let difficulty = u8::try_from(difficulty)
        .map_err(|_| StoreError::InvalidRecord(format!("difficulty {difficulty} out of range")))?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(ExerciseAttempt {
        user_id: row.try_get("userId")?,
        skill_domain: row.try_get("skillDomain")?,
        difficulty,
        is_correct: row.try_get::<i64, _>("isCorrect")? != 0,
        time_taken_seconds: row.try_get("timeTakenSeconds")?,
        strategy_used: row.try_get("strategyUsed")?,
        timestamp: parse_ts(&timestamp)?,
    })
}

fn proficiency_from_row(row: &SqliteRow) -> Result<SkillProficiency, StoreError> {
    let completed: i64 = row.try_get("exercisesCompleted")?;
    Ok(SkillProficiency {
        user_id: row.try_get("userId")?,
        skill_domain: row.try_get("skillDomain")?,
        proficiency: row.try_get("proficiency")?,
        exercises_completed: u32::try_from(completed.max(0)).unwrap_or(u32::MAX),
        success_rate: row.try_get("successRate")?,
        last_practiced: parse_opt_ts(row.try_get("lastPracticed")?)?,
        mastery_date: parse_opt_ts(row.try_get("masteryDate")?)?,
    })
}

fn model_from_row(row: &SqliteRow) -> Result<TrainedModel, StoreError> {
    let kind: String = row.try_get("modelType")?;
    let model_type = ModelKind::parse(&kind)
        .ok_or_else(|| StoreError::InvalidRecord(format!("unknown model type {kind:?}")))?;
    let hyperparameters: String = row.try_get("hyperparameters")?;
    let metrics: String = row.try_get("metrics")?;
    let training_date: String = row.try_get("trainingDate")?;

    Ok(TrainedModel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        model_type,
        hyperparameters: serde_json::from_str(&hyperparameters)?,
        training_date: parse_ts(&training_date)?,
        metrics: serde_json::from_str(&metrics)?,
        artifact_reference: row.try_get("artifactReference")?,
        is_active: row.try_get::<i64, _>("isActive")? != 0,
    })
}

const ATTEMPT_COLUMNS: &str = r#""userId","skillDomain","difficulty","isCorrect","timeTakenSeconds","strategyUsed","timestamp""#;
const MODEL_COLUMNS: &str = r#""id","name","version","modelType","hyperparameters","trainingDate","metrics","artifactReference","isActive""#;

#[async_trait]
impl AttemptHistoryStore for SqliteStore {
    async fn append(&self, attempt: ExerciseAttempt) -> Result<(), StoreError> {
        if attempt.user_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord("attempt without user id".to_string()));
        }
        sqlx::query(&format!(
            r#"INSERT INTO "exercise_attempts" ({ATTEMPT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"#
        ))
        .bind(&attempt.user_id)
        .bind(&attempt.skill_domain)
        .bind(i64::from(attempt.difficulty))
        .bind(attempt.is_correct as i64)
        .bind(attempt.time_taken_seconds)
        .bind(&attempt.strategy_used)
        .bind(format_ts(&attempt.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, query: &AttemptQuery) -> Result<Vec<ExerciseAttempt>, StoreError> {
        let mut sql = format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM "exercise_attempts" WHERE "userId" = ?"#
        );
        if query.skill_domain.is_some() {
            sql.push_str(r#" AND "skillDomain" = ?"#);
        }
        if query.since.is_some() {
            sql.push_str(r#" AND "timestamp" >= ?"#);
        }
        sql.push_str(match query.order {
            SortOrder::NewestFirst => r#" ORDER BY "timestamp" DESC, "id" DESC"#,
            SortOrder::OldestFirst => r#" ORDER BY "timestamp" ASC, "id" ASC"#,
        });
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(&query.user_id);
        if let Some(domain) = &query.skill_domain {
            q = q.bind(domain);
        }
        if let Some(since) = &query.since {
            q = q.bind(format_ts(since));
        }
        if let Some(limit) = query.limit {
            q = q.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn totals(&self, user_id: &str) -> Result<AttemptTotals, StoreError> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS "total", COALESCE(SUM("isCorrect"), 0) AS "correct"
               FROM "exercise_attempts" WHERE "userId" = ?"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let correct: i64 = row.try_get("correct")?;
        Ok(AttemptTotals {
            total: total.max(0) as u64,
            correct: correct.max(0) as u64,
        })
    }
}

#[async_trait]
impl SkillProficiencyStore for SqliteStore {
    async fn get(
        &self,
        user_id: &str,
        skill_domain: &str,
    ) -> Result<Option<SkillProficiency>, StoreError> {
        let row = sqlx::query(
            r#"SELECT * FROM "skill_proficiencies" WHERE "userId" = ? AND "skillDomain" = ? LIMIT 1"#,
        )
        .bind(user_id)
        .bind(skill_domain)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(proficiency_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SkillProficiency>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM "skill_proficiencies" WHERE "userId" = ? ORDER BY "skillDomain""#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(proficiency_from_row).collect()
    }

    async fn upsert(&self, proficiency: SkillProficiency) -> Result<(), StoreError> {
        if !(0.0..=1.0).contains(&proficiency.proficiency) {
            return Err(StoreError::InvalidRecord(format!(
                "proficiency {} outside [0, 1]",
                proficiency.proficiency
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO "skill_proficiencies"
                ("userId","skillDomain","proficiency","exercisesCompleted","successRate","lastPracticed","masteryDate")
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT ("userId","skillDomain") DO UPDATE SET
                "proficiency" = excluded."proficiency",
                "exercisesCompleted" = excluded."exercisesCompleted",
                "successRate" = excluded."successRate",
                "lastPracticed" = excluded."lastPracticed",
                "masteryDate" = excluded."masteryDate"
            "#,
        )
        .bind(&proficiency.user_id)
        .bind(&proficiency.skill_domain)
        .bind(proficiency.proficiency)
        .bind(i64::from(proficiency.exercises_completed))
        .bind(proficiency.success_rate)
        .bind(proficiency.last_practiced.as_ref().map(format_ts))
        .bind(proficiency.mastery_date.as_ref().map(format_ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LearnerProfileStore for SqliteStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<LearnerProfile>, StoreError> {
        let row = sqlx::query(
            r#"SELECT "userId","gradeLevel","learningStyle" FROM "learner_profiles" WHERE "userId" = ? LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(LearnerProfile {
            user_id: row.try_get("userId")?,
            grade_level: row.try_get("gradeLevel")?,
            learning_style: row.try_get("learningStyle")?,
        }))
    }

    async fn upsert_profile(&self, profile: LearnerProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "learner_profiles" ("userId","gradeLevel","learningStyle")
            VALUES (?, ?, ?)
            ON CONFLICT ("userId") DO UPDATE SET
                "gradeLevel" = excluded."gradeLevel",
                "learningStyle" = excluded."learningStyle"
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.grade_level)
        .bind(&profile.learning_style)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ModelArtifactStore for SqliteStore {
    async fn save(&self, record: &TrainedModel, blob: &[u8]) -> Result<(), StoreError> {
        let hyperparameters = serde_json::to_string(&record.hyperparameters)?;
        let metrics = serde_json::to_string(&record.metrics)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"UPDATE "trained_models" SET "isActive" = 0 WHERE "name" = ?"#)
            .bind(&record.name)
            .execute(&mut *tx)
            .await?;

        let seq: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX("seq"), 0) + 1 FROM "trained_models" WHERE "name" = ?"#,
        )
        .bind(&record.name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"INSERT INTO "trained_models" ({MODEL_COLUMNS}, "artifact", "seq")
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)"#
        ))
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(record.model_type.as_str())
        .bind(hyperparameters)
        .bind(format_ts(&record.training_date))
        .bind(metrics)
        .bind(&record.artifact_reference)
        .bind(blob)
        .bind(seq)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_active(
        &self,
        name: &str,
    ) -> Result<Option<(Vec<u8>, TrainedModel)>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT {MODEL_COLUMNS}, "artifact" FROM "trained_models"
               WHERE "name" = ? AND "isActive" = 1 LIMIT 1"#
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let blob: Vec<u8> = row.try_get("artifact")?;
        Ok(Some((blob, model_from_row(&row)?)))
    }

    async fn list(&self, name: &str) -> Result<Vec<TrainedModel>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {MODEL_COLUMNS} FROM "trained_models" WHERE "name" = ? ORDER BY "seq" DESC"#
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(model_from_row).collect()
    }
}
