//! Template SQL Runner: loads named `.sql` templates from disk, substitutes
//! `{{placeholder}}` variables, and executes them against a Postgres pool.
//!
//! Loads a named SQL template from a fixed directory, renders it with
//! positional/keyed arguments, and executes it against either a pool (wraps
//! in a transaction that commits on success / rolls back on error) or an
//! already-open transaction (executes within it, no extra commit boundary).
//! Grounded on `original_source/geo_assistant/_sql/_sql_exec.py` (the later,
//! row-returning draft).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlRunnerError {
    #[error("template '{0}' not found in {1}")]
    TemplateNotFound(String, String),
    #[error("failed to read template '{0}': {1}")]
    TemplateReadError(String, std::io::Error),
    #[error("failed to render template '{0}': {1}")]
    RenderError(String, String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A loosely-typed row mapping: column name -> JSON value. Mirrors the
/// source's `list[dict]` return shape for statements that return rows.
pub type RowMapping = HashMap<String, Value>;

/// Keyed template arguments. Values are rendered via simple `{{ key }}`
/// substitution (see `render`), matching the Jinja-lite subset the
/// source's templates actually use (no control flow beyond substitution is
/// required by any shipped template).
#[derive(Debug, Clone, Default)]
pub struct TemplateArgs(HashMap<String, String>);

impl TemplateArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

pub struct SqlRunner {
    template_dir: PathBuf,
}

impl SqlRunner {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self { template_dir: template_dir.into() }
    }

    fn load_template(&self, template_name: &str) -> Result<String, SqlRunnerError> {
        let path = self.template_dir.join(format!("{template_name}.sql"));
        if !path.exists() {
            return Err(SqlRunnerError::TemplateNotFound(
                template_name.to_string(),
                self.template_dir.display().to_string(),
            ));
        }
        std::fs::read_to_string(&path)
            .map_err(|e| SqlRunnerError::TemplateReadError(template_name.to_string(), e))
    }

    fn render(&self, template: &str, args: &TemplateArgs) -> String {
        let mut rendered = template.to_string();
        for (key, value) in &args.0 {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
            rendered = rendered.replace(&format!("{{{{ {key} }}}}"), value);
        }
        rendered.trim().to_string()
    }

    /// Render `template_name` and execute it against a pool. Wraps execution
    /// in a transaction that commits on success and rolls back on any error.
    pub async fn run(
        &self,
        template_name: &str,
        pool: &PgPool,
        args: &TemplateArgs,
    ) -> Result<Option<Vec<RowMapping>>, SqlRunnerError> {
        let template = self.load_template(template_name)?;
        let sql = self.render(&template, args);
        tracing::debug!(template = template_name, sql = %sql, "executing template sql");

        let mut tx = pool.begin().await?;
        let result = Self::execute(&mut tx, &sql).await;
        match result {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Render `template_name` and execute it within an already-open
    /// transaction, without introducing its own commit boundary.
    pub async fn run_in_tx(
        &self,
        template_name: &str,
        tx: &mut Transaction<'_, Postgres>,
        args: &TemplateArgs,
    ) -> Result<Option<Vec<RowMapping>>, SqlRunnerError> {
        let template = self.load_template(template_name)?;
        let sql = self.render(&template, args);
        tracing::debug!(template = template_name, sql = %sql, "executing template sql (in tx)");
        Self::execute(tx, &sql).await
    }

    async fn execute(
        tx: &mut Transaction<'_, Postgres>,
        sql: &str,
    ) -> Result<Option<Vec<RowMapping>>, SqlRunnerError> {
        // `sqlx::query` uses the extended protocol, which rejects a string
        // carrying more than one statement (several templates, e.g.
        // `buffer`/`postprocess`, render a `;`-separated sequence). Simple
        // query protocol via `raw_sql` accepts the whole batch.
        let rows = sqlx::raw_sql(sql).fetch_all(&mut **tx).await?;
        if rows.is_empty() {
            // Cannot distinguish "DDL" from "SELECT returning zero rows"
            // from an empty Vec alone; callers that need that distinction
            // should describe it in the template name (e.g. `*_count`).
            return Ok(None);
        }
        Ok(Some(rows.iter().map(row_to_mapping).collect()))
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }
}

fn row_to_mapping(row: &PgRow) -> RowMapping {
    use sqlx::Column;
    use sqlx::TypeInfo;
    use sqlx::ValueRef;

    let mut mapping = RowMapping::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let raw = row.try_get_raw(column.ordinal());
        let value = match raw {
            Ok(raw) if !raw.is_null() => {
                // Best-effort textual decode; templates emitted by this
                // crate only ever select plain scalar columns.
                match column.type_info().name() {
                    "INT4" | "INT8" | "INT2" => row
                        .try_get::<i64, _>(column.ordinal())
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "FLOAT4" | "FLOAT8" | "NUMERIC" => row
                        .try_get::<f64, _>(column.ordinal())
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "BOOL" => row
                        .try_get::<bool, _>(column.ordinal())
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    _ => row
                        .try_get::<String, _>(column.ordinal())
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                }
            }
            _ => Value::Null,
        };
        mapping.insert(name, value);
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_braced_and_spaced_placeholders() {
        let runner = SqlRunner::new("templates");
        let args = TemplateArgs::new().with("schema", "analysis_1").with("table", "parcels");
        let rendered = runner.render("SELECT * FROM {{schema}}.{{ table }}", &args);
        assert_eq!(rendered, "SELECT * FROM analysis_1.parcels");
    }

    #[test]
    fn missing_template_is_a_distinct_error() {
        let runner = SqlRunner::new("/nonexistent/path/for/sure");
        let err = runner.load_template("buffer").unwrap_err();
        assert!(matches!(err, SqlRunnerError::TemplateNotFound(_, _)));
    }
}
