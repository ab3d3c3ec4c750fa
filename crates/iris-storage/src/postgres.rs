//! Postgres-backed [`IssueStore`].
//!
//! Commits run as SERIALIZABLE transactions. The per-repository version row is locked with
//! `FOR UPDATE` before anything is written, so two batches for the same repository
//! serialize while batches for disjoint repositories commit independently.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::{
    Category, ClassificationResult, Fingerprint, IssueRecord, IssueState, Priority, ScoreBreakdown,
    TriagedIssue,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info_span, Instrument};

use crate::{
    BatchWrite, CommitReceipt, IssueStore, RepositorySnapshot, RepositoryWrite, RetryDisposition, StoreError,
    StoreStats,
};

/// Persisted schema consumed by downstream report generators.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS repository_versions (
        repository TEXT PRIMARY KEY,
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS issues (
        id BIGINT PRIMARY KEY,
        repository TEXT NOT NULL,
        number BIGINT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL,
        labels JSONB NOT NULL DEFAULT '[]',
        author TEXT,
        assignee TEXT,
        milestone TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        closed_at TIMESTAMPTZ,
        comment_count INTEGER NOT NULL DEFAULT 0,
        reaction_count INTEGER NOT NULL DEFAULT 0,
        url TEXT,
        fingerprint TEXT NOT NULL,
        score_keyword DOUBLE PRECISION NOT NULL,
        score_pattern DOUBLE PRECISION NOT NULL,
        score_label DOUBLE PRECISION NOT NULL,
        score_state DOUBLE PRECISION NOT NULL,
        score_activity DOUBLE PRECISION NOT NULL,
        score_total DOUBLE PRECISION NOT NULL,
        category TEXT NOT NULL,
        priority TEXT NOT NULL,
        stack JSONB NOT NULL DEFAULT '[]',
        confidence DOUBLE PRECISION NOT NULL,
        duplicate_of BIGINT,
        duplicate_similarity DOUBLE PRECISION,
        first_seen_at TIMESTAMPTZ NOT NULL,
        last_ingested_at TIMESTAMPTZ NOT NULL,
        UNIQUE (repository, number)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_issues_repository ON issues(repository)",
    "CREATE INDEX IF NOT EXISTS idx_issues_score_total ON issues(score_total DESC)",
    "CREATE INDEX IF NOT EXISTS idx_issues_category ON issues(category)",
    "CREATE INDEX IF NOT EXISTS idx_issues_duplicate_of ON issues(duplicate_of)",
];

const SELECT_ISSUE_COLUMNS: &str = r#"
    SELECT id, repository, number, title, body, state, labels, author, assignee, milestone,
           created_at, updated_at, closed_at, comment_count, reaction_count, url, fingerprint,
           score_keyword, score_pattern, score_label, score_state, score_activity, score_total,
           category, priority, stack, confidence, duplicate_of, duplicate_similarity,
           first_seen_at, last_ingested_at
      FROM issues
"#;

const UPSERT_ISSUE: &str = r#"
    INSERT INTO issues (
        id, repository, number, title, body, state, labels, author, assignee, milestone,
        created_at, updated_at, closed_at, comment_count, reaction_count, url, fingerprint,
        score_keyword, score_pattern, score_label, score_state, score_activity, score_total,
        category, priority, stack, confidence, duplicate_of, duplicate_similarity,
        first_seen_at, last_ingested_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31)
    ON CONFLICT (id) DO UPDATE SET
        title = excluded.title,
        body = excluded.body,
        state = excluded.state,
        labels = excluded.labels,
        author = excluded.author,
        assignee = excluded.assignee,
        milestone = excluded.milestone,
        updated_at = excluded.updated_at,
        closed_at = excluded.closed_at,
        comment_count = excluded.comment_count,
        reaction_count = excluded.reaction_count,
        url = excluded.url,
        fingerprint = excluded.fingerprint,
        score_keyword = excluded.score_keyword,
        score_pattern = excluded.score_pattern,
        score_label = excluded.score_label,
        score_state = excluded.score_state,
        score_activity = excluded.score_activity,
        score_total = excluded.score_total,
        category = excluded.category,
        priority = excluded.priority,
        stack = excluded.stack,
        confidence = excluded.confidence,
        duplicate_of = excluded.duplicate_of,
        duplicate_similarity = excluded.duplicate_similarity,
        last_ingested_at = excluded.last_ingested_at
    RETURNING (xmax = 0) AS inserted
"#;

/// Transient SQLSTATEs: serialization failure, deadlock, unique race, lock not available.
pub fn classify_sqlstate(code: &str) -> RetryDisposition {
    match code {
        "40001" | "40P01" | "23505" | "55P03" => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

fn map_sqlx_error(err: sqlx::Error, scope: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if classify_sqlstate(&code) == RetryDisposition::Retryable {
                StoreError::conflict(scope, format!("sqlstate {code}: {}", db.message()))
            } else if code.starts_with("08") || code.starts_with("57P") {
                StoreError::Unavailable(format!("sqlstate {code}: {}", db.message()))
            } else {
                StoreError::Backend(format!("sqlstate {code}: {}", db.message()))
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Backend(format!("identifier {id} exceeds BIGINT")))
}

fn to_db_count(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Backend(format!("{column} {value} exceeds INTEGER")))
}

fn from_db_id(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Decode(format!("negative {column} {value}")))
}

fn decode_err(err: sqlx::Error) -> StoreError {
    map_sqlx_error(err, "decode")
}

fn row_to_issue(row: &PgRow) -> Result<TriagedIssue, StoreError> {
    let state: String = row.try_get("state").map_err(decode_err)?;
    let category: String = row.try_get("category").map_err(decode_err)?;
    let priority: String = row.try_get("priority").map_err(decode_err)?;
    let labels: Json<Vec<String>> = row.try_get("labels").map_err(decode_err)?;
    let stack: Json<Vec<String>> = row.try_get("stack").map_err(decode_err)?;
    let comment_count: i32 = row.try_get("comment_count").map_err(decode_err)?;
    let reaction_count: i32 = row.try_get("reaction_count").map_err(decode_err)?;
    let duplicate_of: Option<i64> = row.try_get("duplicate_of").map_err(decode_err)?;
    let fingerprint: String = row.try_get("fingerprint").map_err(decode_err)?;

    let record = IssueRecord {
        id: from_db_id(row.try_get("id").map_err(decode_err)?, "id")?,
        repository: row.try_get("repository").map_err(decode_err)?,
        number: from_db_id(row.try_get("number").map_err(decode_err)?, "number")?,
        title: row.try_get("title").map_err(decode_err)?,
        body: row.try_get("body").map_err(decode_err)?,
        state: state
            .parse::<IssueState>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        labels: labels.0,
        author: row.try_get("author").map_err(decode_err)?,
        assignee: row.try_get("assignee").map_err(decode_err)?,
        milestone: row.try_get("milestone").map_err(decode_err)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_err)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode_err)?,
        closed_at: row.try_get("closed_at").map_err(decode_err)?,
        comment_count: comment_count.max(0) as u32,
        reaction_count: reaction_count.max(0) as u32,
        url: row.try_get("url").map_err(decode_err)?,
    };

    Ok(TriagedIssue {
        record,
        fingerprint: Fingerprint::from_hex(fingerprint),
        score: ScoreBreakdown {
            keyword: row.try_get("score_keyword").map_err(decode_err)?,
            pattern: row.try_get("score_pattern").map_err(decode_err)?,
            label: row.try_get("score_label").map_err(decode_err)?,
            state: row.try_get("score_state").map_err(decode_err)?,
            activity: row.try_get("score_activity").map_err(decode_err)?,
            total: row.try_get("score_total").map_err(decode_err)?,
        },
        classification: ClassificationResult {
            category: category
                .parse::<Category>()
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            priority: priority
                .parse::<Priority>()
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            stack: stack.0.into_iter().collect(),
            confidence: row.try_get("confidence").map_err(decode_err)?,
        },
        duplicate_of: duplicate_of.map(|v| from_db_id(v, "duplicate_of")).transpose()?,
        duplicate_similarity: row.try_get("duplicate_similarity").map_err(decode_err)?,
        first_seen_at: row.try_get("first_seen_at").map_err(decode_err)?,
        last_ingested_at: row.try_get("last_ingested_at").map_err(decode_err)?,
    })
}

fn rows_to_issues(rows: &[PgRow]) -> Result<Vec<TriagedIssue>, StoreError> {
    rows.iter().map(row_to_issue).collect()
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes the pipeline writes to, if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(e, "schema"))?;
        }
        Ok(())
    }

    async fn apply_repository(
        tx: &mut Transaction<'_, Postgres>,
        write: &RepositoryWrite,
        receipt: &mut CommitReceipt,
    ) -> Result<(), StoreError> {
        let scope = write.repository.as_str();

        sqlx::query(
            "INSERT INTO repository_versions (repository, version) VALUES ($1, 0) ON CONFLICT (repository) DO NOTHING",
        )
        .bind(&write.repository)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(e, scope))?;

        let current: i64 =
            sqlx::query_scalar("SELECT version FROM repository_versions WHERE repository = $1 FOR UPDATE")
                .bind(&write.repository)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error(e, scope))?;
        if from_db_id(current, "version")? != write.expected_version {
            return Err(StoreError::conflict(
                scope,
                format!("expected version {} but found {}", write.expected_version, current),
            ));
        }

        for issue in &write.upserts {
            let record = &issue.record;
            if record.repository != write.repository {
                return Err(StoreError::Backend(format!(
                    "record {} belongs to {} but was written under {}",
                    record.id, record.repository, write.repository
                )));
            }
            let stack: Vec<&String> = issue.classification.stack.iter().collect();
            let inserted: bool = sqlx::query_scalar(UPSERT_ISSUE)
                .bind(to_db_id(record.id)?)
                .bind(&record.repository)
                .bind(to_db_id(record.number)?)
                .bind(&record.title)
                .bind(&record.body)
                .bind(record.state.as_str())
                .bind(Json(&record.labels))
                .bind(&record.author)
                .bind(&record.assignee)
                .bind(&record.milestone)
                .bind(record.created_at)
                .bind(record.updated_at)
                .bind(record.closed_at)
                .bind(to_db_count(record.comment_count, "comment_count")?)
                .bind(to_db_count(record.reaction_count, "reaction_count")?)
                .bind(&record.url)
                .bind(issue.fingerprint.as_str())
                .bind(issue.score.keyword)
                .bind(issue.score.pattern)
                .bind(issue.score.label)
                .bind(issue.score.state)
                .bind(issue.score.activity)
                .bind(issue.score.total)
                .bind(issue.classification.category.as_str())
                .bind(issue.classification.priority.as_str())
                .bind(Json(stack))
                .bind(issue.classification.confidence)
                .bind(issue.duplicate_of.map(to_db_id).transpose()?)
                .bind(issue.duplicate_similarity)
                .bind(issue.first_seen_at)
                .bind(issue.last_ingested_at)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error(e, scope))?;
            if inserted {
                receipt.inserted += 1;
            } else {
                receipt.updated += 1;
            }
        }

        for update in &write.membership {
            let result = sqlx::query(
                "UPDATE issues SET duplicate_of = $2, duplicate_similarity = $3 WHERE id = $1 AND repository = $4",
            )
            .bind(to_db_id(update.id)?)
            .bind(update.duplicate_of.map(to_db_id).transpose()?)
            .bind(update.duplicate_similarity)
            .bind(&write.repository)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(e, scope))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Backend(format!(
                    "membership update for unknown record {} in {}",
                    update.id, write.repository
                )));
            }
            receipt.membership_updates += 1;
        }

        let version: i64 = sqlx::query_scalar(
            "UPDATE repository_versions SET version = version + 1, updated_at = now() WHERE repository = $1 RETURNING version",
        )
        .bind(&write.repository)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(e, scope))?;
        receipt
            .versions
            .insert(write.repository.clone(), from_db_id(version, "version")?);
        Ok(())
    }

    async fn fetch_issues(&self, sql: &str) -> Result<Vec<TriagedIssue>, StoreError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "query"))?;
        rows_to_issues(&rows)
    }

    async fn count_by(&self, sql: &str) -> Result<BTreeMap<String, usize>, StoreError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "stats"))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key").map_err(decode_err)?;
            let n: i64 = row.try_get("n").map_err(decode_err)?;
            out.insert(key, n.max(0) as usize);
        }
        Ok(out)
    }
}

#[async_trait]
impl IssueStore for PgStore {
    async fn load_repository(&self, repository: &str) -> Result<RepositorySnapshot, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM repository_versions WHERE repository = $1")
                .bind(repository)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(e, repository))?;
        let issues = self.get_by_repository(repository).await?;
        Ok(RepositorySnapshot {
            repository: repository.to_string(),
            version: from_db_id(version.unwrap_or(0), "version")?,
            issues,
        })
    }

    async fn commit(&self, write: &BatchWrite) -> Result<CommitReceipt, StoreError> {
        let span = info_span!("pg_commit", batch_id = %write.batch_id, repositories = write.repositories.len());
        async move {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(e, "begin"))?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(e, "begin"))?;

            let mut receipt = CommitReceipt::default();
            for repo_write in &write.repositories {
                // Dropping `tx` on the error path rolls the whole batch back.
                Self::apply_repository(&mut tx, repo_write, &mut receipt).await?;
            }

            tx.commit().await.map_err(|e| map_sqlx_error(e, "commit"))?;
            debug!(
                inserted = receipt.inserted,
                updated = receipt.updated,
                membership_updates = receipt.membership_updates,
                "postgres commit applied"
            );
            Ok(receipt)
        }
        .instrument(span)
        .await
    }

    async fn get_by_repository(&self, repository: &str) -> Result<Vec<TriagedIssue>, StoreError> {
        let sql = format!("{SELECT_ISSUE_COLUMNS} WHERE repository = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(repository)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, repository))?;
        rows_to_issues(&rows)
    }

    async fn get_by_score_range(&self, min: f64, max: f64) -> Result<Vec<TriagedIssue>, StoreError> {
        let sql = format!(
            "{SELECT_ISSUE_COLUMNS} WHERE score_total >= $1 AND score_total <= $2 ORDER BY score_total DESC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(min)
            .bind(max)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "query"))?;
        rows_to_issues(&rows)
    }

    async fn get_by_category(&self, category: Category) -> Result<Vec<TriagedIssue>, StoreError> {
        let sql = format!("{SELECT_ISSUE_COLUMNS} WHERE category = $1 ORDER BY score_total DESC, id ASC");
        let rows = sqlx::query(&sql)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "query"))?;
        rows_to_issues(&rows)
    }

    async fn search(&self, text: &str, limit: usize) -> Result<Vec<TriagedIssue>, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_ISSUE_COLUMNS} WHERE title ILIKE $1 OR body ILIKE $1 ORDER BY score_total DESC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(escape_like(text))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "search"))?;
        rows_to_issues(&rows)
    }

    async fn top_by_score(&self, limit: usize) -> Result<Vec<TriagedIssue>, StoreError> {
        let sql = format!(
            "{SELECT_ISSUE_COLUMNS} WHERE duplicate_of IS NULL ORDER BY score_total DESC, id ASC LIMIT {}",
            i64::try_from(limit).unwrap_or(i64::MAX)
        );
        self.fetch_issues(&sql).await
    }

    async fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE state = 'open') AS open,
                   COUNT(*) FILTER (WHERE duplicate_of IS NOT NULL) AS duplicates,
                   COALESCE(AVG(score_total), 0)::DOUBLE PRECISION AS average_score
              FROM issues
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "stats"))?;

        let total: i64 = row.try_get("total").map_err(decode_err)?;
        let open: i64 = row.try_get("open").map_err(decode_err)?;
        let duplicates: i64 = row.try_get("duplicates").map_err(decode_err)?;

        Ok(StoreStats {
            total: total.max(0) as usize,
            open: open.max(0) as usize,
            closed: (total - open).max(0) as usize,
            duplicates: duplicates.max(0) as usize,
            average_score: row.try_get("average_score").map_err(decode_err)?,
            by_category: self
                .count_by("SELECT category AS key, COUNT(*) AS n FROM issues GROUP BY category")
                .await?,
            by_priority: self
                .count_by("SELECT priority AS key, COUNT(*) AS n FROM issues GROUP BY priority")
                .await?,
            by_stack: self
                .count_by(
                    "SELECT tag AS key, COUNT(*) AS n FROM issues, jsonb_array_elements_text(stack) AS tag GROUP BY tag",
                )
                .await?,
            by_repository: self
                .count_by("SELECT repository AS key, COUNT(*) AS n FROM issues GROUP BY repository")
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_and_deadlock_states_are_retryable() {
        assert_eq!(classify_sqlstate("40001"), RetryDisposition::Retryable);
        assert_eq!(classify_sqlstate("40P01"), RetryDisposition::Retryable);
        assert_eq!(classify_sqlstate("23505"), RetryDisposition::Retryable);
        assert_eq!(classify_sqlstate("42P01"), RetryDisposition::NonRetryable);
        assert_eq!(classify_sqlstate(""), RetryDisposition::NonRetryable);
    }

    #[test]
    fn pool_failures_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut, "acme/widgets"),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound, "acme/widgets"),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("100%_done"), "%100\\%\\_done%");
        assert_eq!(escape_like("leak"), "%leak%");
    }

    #[test]
    fn schema_carries_the_duplicate_reference() {
        let issues = SCHEMA_STATEMENTS
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS issues"))
            .expect("issues table");
        assert!(issues.contains("duplicate_of BIGINT"));
        assert!(issues.contains("fingerprint TEXT NOT NULL"));
        assert!(issues.contains("UNIQUE (repository, number)"));
    }

    #[test]
    fn identifiers_outside_bigint_are_rejected() {
        assert!(to_db_id(u64::MAX).is_err());
        assert_eq!(to_db_id(7).unwrap(), 7);
        assert!(from_db_id(-1, "id").is_err());
    }

    #[test]
    fn counts_outside_integer_are_rejected() {
        assert!(matches!(
            to_db_count(u32::MAX, "comment_count"),
            Err(StoreError::Backend(msg)) if msg.contains("comment_count")
        ));
        assert_eq!(to_db_count(12, "reaction_count").unwrap(), 12);
    }
}
