/// SQLite-backed data store.
///
/// The core consumes this layout, it does not own it: jurisdictions keyed by
/// stable id, ordinance chunks with a nullable JSON embedding column, and
/// rulesets/rules/citations with JSON condition trees seeded
/// administratively. Everything here is read-only at request time; the
/// migration exists so local databases and tests can be created in place.
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

use crate::error::AppError;
use crate::model::{Jurisdiction, OrdinanceChunk, RuleCitation};
use crate::rules::{Condition, Rule};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jurisdictions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'city'
);

CREATE TABLE IF NOT EXISTS ordinance_chunks (
    id TEXT PRIMARY KEY,
    jurisdiction_id TEXT NOT NULL REFERENCES jurisdictions(id),
    chapter TEXT NOT NULL,
    section TEXT,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT,
    source_url TEXT
);
CREATE INDEX IF NOT EXISTS idx_chunks_jurisdiction
    ON ordinance_chunks(jurisdiction_id);

CREATE TABLE IF NOT EXISTS rulesets (
    id TEXT PRIMARY KEY,
    jurisdiction_id TEXT NOT NULL REFERENCES jurisdictions(id),
    category TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    ruleset_id TEXT NOT NULL REFERENCES rulesets(id),
    key TEXT NOT NULL,
    subcategory TEXT,
    description TEXT NOT NULL,
    outcome TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    condition TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_citations (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL REFERENCES rules(id),
    ordinance_number TEXT NOT NULL,
    section TEXT NOT NULL,
    title TEXT,
    text TEXT NOT NULL,
    url TEXT,
    page_number INTEGER
);
"#;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at the given path.
    pub async fn connect(path: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// An in-memory database, useful for local experiments and tests. A
    /// single connection keeps every query on the same in-memory instance.
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn jurisdiction(&self, id: &str) -> Result<Option<Jurisdiction>, AppError> {
        let row = sqlx::query("SELECT id, name, state, kind FROM jurisdictions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| jurisdiction_from_row(&r)).transpose()
    }

    /// Case-insensitive lookup by display name, optionally narrowed by state.
    pub async fn find_jurisdiction(
        &self,
        name: &str,
        state: Option<&str>,
    ) -> Result<Option<Jurisdiction>, AppError> {
        let row = sqlx::query(
            "SELECT id, name, state, kind FROM jurisdictions \
             WHERE name = ?1 COLLATE NOCASE \
               AND (?2 IS NULL OR state = ?2 COLLATE NOCASE) \
             LIMIT 1",
        )
        .bind(name)
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| jurisdiction_from_row(&r)).transpose()
    }

    /// Every ordinance chunk for a jurisdiction. Embeddings that fail to
    /// parse are treated as missing (the chunk is then excluded from
    /// similarity scoring, same as a never-embedded chunk).
    pub async fn chunks(&self, jurisdiction_id: &str) -> Result<Vec<OrdinanceChunk>, AppError> {
        let rows = sqlx::query(
            "SELECT id, chapter, section, title, content, embedding, source_url \
             FROM ordinance_chunks WHERE jurisdiction_id = ?1",
        )
        .bind(jurisdiction_id)
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let raw_embedding: Option<String> = row.try_get("embedding")?;
            let embedding = raw_embedding.and_then(|raw| parse_embedding(&id, &raw));
            chunks.push(OrdinanceChunk {
                chapter: row.try_get("chapter")?,
                section: row.try_get("section")?,
                title: row.try_get("title")?,
                content: row.try_get("content")?,
                source_url: row.try_get("source_url")?,
                embedding,
                id,
            });
        }
        Ok(chunks)
    }

    /// Rules for the active ruleset of a jurisdiction/category, optionally
    /// narrowed to a subcategory, with their citations. Ordered by priority
    /// descending (the evaluator re-sorts anyway; storage order must not
    /// matter).
    pub async fn load_rules(
        &self,
        jurisdiction_id: &str,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<Vec<Rule>, AppError> {
        let rows = sqlx::query(
            "SELECT r.id, r.key, r.description, r.outcome, r.priority, r.condition \
             FROM rules r \
             JOIN rulesets rs ON rs.id = r.ruleset_id \
             WHERE rs.jurisdiction_id = ?1 AND rs.category = ?2 AND rs.is_active = 1 \
               AND (?3 IS NULL OR r.subcategory = ?3) \
             ORDER BY r.priority DESC",
        )
        .bind(jurisdiction_id)
        .bind(category)
        .bind(subcategory)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id: String = row.try_get("id")?;
            let raw_condition: String = row.try_get("condition")?;
            let condition = match serde_json::from_str::<serde_json::Value>(&raw_condition) {
                Ok(value) => Condition::from_value(&value),
                Err(e) => {
                    warn!(rule = %rule_id, error = %e, "rule condition is not valid JSON");
                    Condition::Invalid(format!("condition is not valid JSON: {e}"))
                }
            };

            rules.push(Rule {
                key: row.try_get("key")?,
                description: row.try_get("description")?,
                outcome: row.try_get("outcome")?,
                priority: row.try_get("priority")?,
                citations: self.rule_citations(&rule_id).await?,
                condition,
            });
        }
        Ok(rules)
    }

    async fn rule_citations(&self, rule_id: &str) -> Result<Vec<RuleCitation>, AppError> {
        let rows = sqlx::query(
            "SELECT ordinance_number, section, title, text, url, page_number \
             FROM rule_citations WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RuleCitation {
                    ordinance_number: row.try_get("ordinance_number")?,
                    section: row.try_get("section")?,
                    title: row.try_get("title")?,
                    text: row.try_get("text")?,
                    url: row.try_get("url")?,
                    page_number: row.try_get("page_number")?,
                })
            })
            .collect()
    }
}

fn jurisdiction_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Jurisdiction, AppError> {
    Ok(Jurisdiction {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        state: row.try_get("state")?,
        kind: row.try_get("kind")?,
    })
}

/// Parse a stored embedding (JSON array of floats). Unparseable data is
/// reported and treated as absent rather than poisoning the request.
fn parse_embedding(chunk_id: &str, raw: &str) -> Option<Vec<f32>> {
    serde_json::from_str::<Vec<f32>>(raw)
        .inspect_err(|e| warn!(chunk = %chunk_id, error = %e, "chunk has invalid embedding"))
        .ok()
}

#[cfg(test)]
impl Store {
    pub(crate) async fn insert_jurisdiction(&self, id: &str, name: &str, state: &str, kind: &str) {
        sqlx::query("INSERT INTO jurisdictions (id, name, state, kind) VALUES (?1, ?2, ?3, ?4)")
            .bind(id)
            .bind(name)
            .bind(state)
            .bind(kind)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_chunk(
        &self,
        id: &str,
        jurisdiction_id: &str,
        chapter: &str,
        section: Option<&str>,
        title: &str,
        content: &str,
        embedding: Option<&str>,
        source_url: Option<&str>,
    ) {
        sqlx::query(
            "INSERT INTO ordinance_chunks \
             (id, jurisdiction_id, chapter, section, title, content, embedding, source_url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(id)
        .bind(jurisdiction_id)
        .bind(chapter)
        .bind(section)
        .bind(title)
        .bind(content)
        .bind(embedding)
        .bind(source_url)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    pub(crate) async fn insert_ruleset(&self, id: &str, jurisdiction_id: &str, category: &str, active: bool) {
        sqlx::query("INSERT INTO rulesets (id, jurisdiction_id, category, is_active) VALUES (?1, ?2, ?3, ?4)")
            .bind(id)
            .bind(jurisdiction_id)
            .bind(category)
            .bind(active)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_rule(
        &self,
        id: &str,
        ruleset_id: &str,
        key: &str,
        subcategory: Option<&str>,
        description: &str,
        outcome: &str,
        priority: i64,
        condition: &serde_json::Value,
    ) {
        sqlx::query(
            "INSERT INTO rules \
             (id, ruleset_id, key, subcategory, description, outcome, priority, condition) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(id)
        .bind(ruleset_id)
        .bind(key)
        .bind(subcategory)
        .bind(description)
        .bind(outcome)
        .bind(priority)
        .bind(condition.to_string())
        .execute(&self.pool)
        .await
        .unwrap();
    }

    pub(crate) async fn insert_citation(
        &self,
        id: &str,
        rule_id: &str,
        ordinance_number: &str,
        section: &str,
        text: &str,
    ) {
        sqlx::query(
            "INSERT INTO rule_citations (id, rule_id, ordinance_number, section, text) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(rule_id)
        .bind(ordinance_number)
        .bind(section)
        .bind(text)
        .execute(&self.pool)
        .await
        .unwrap();
    }
}
