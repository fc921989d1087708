//! Setup actions: the closed sum type, normalization, and bifurcation.
//!
//! An action is static-safe iff re-running it against a pristine database
//! is indistinguishable from running it once (pure DDL, or row insertion
//! into an empty table). The static prefix of a fixture's action list can
//! therefore be memoized into a template database; everything from the
//! first dynamic action onward runs per test, in declared order.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use sqlx::PgConnection;

use crate::error::{Error, Result};

/// Postgres schema addressed by unqualified table names.
pub(crate) const DEFAULT_PG_SCHEMA: &str = "public";

/// A table described by an Arrow schema.
#[derive(Debug, Clone)]
pub struct TableSpec {
    schema: Option<String>,
    name: String,
    columns: SchemaRef,
}

impl TableSpec {
    /// A table in the default schema.
    pub fn new(name: impl Into<String>, columns: Schema) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Arc::new(columns),
        }
    }

    /// A table in an explicit Postgres schema.
    pub fn in_schema(schema: impl Into<String>, name: impl Into<String>, columns: Schema) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
            columns: Arc::new(columns),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The Postgres schema, with the default made explicit.
    pub fn pg_schema(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_PG_SCHEMA)
    }

    pub fn columns(&self) -> &SchemaRef {
        &self.columns
    }

    /// `schema.table`, usable as a dedup key and filter subject.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.pg_schema(), self.name)
    }
}

/// Ordered set of tables to create, schemas first.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    tables: Vec<TableSpec>,
}

impl SchemaDefinition {
    pub fn new(tables: Vec<TableSpec>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }
}

/// Rows to bulk-insert into one table.
///
/// Rows are carried as an Arrow record batch: plain values with no
/// session identity, bound column by column at insert time.
#[derive(Debug, Clone)]
pub struct RowBatch {
    table: TableSpec,
    rows: RecordBatch,
}

impl RowBatch {
    pub fn new(table: TableSpec, rows: RecordBatch) -> Self {
        Self { table, rows }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub fn rows(&self) -> &RecordBatch {
        &self.rows
    }
}

/// Raw SQL statements executed in declared order.
#[derive(Debug, Clone)]
pub struct RawStatement {
    statements: Vec<String>,
    static_safe: bool,
}

impl RawStatement {
    /// Statements with observable effects; always run per test.
    pub fn new<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            static_safe: false,
        }
    }

    /// Statements safe to memoize into a template database.
    pub fn static_safe<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            static_safe: true,
        }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn is_static_safe(&self) -> bool {
        self.static_safe
    }
}

type SetupFuture<'c> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'c>>;
type SetupFn = Box<dyn for<'c> Fn(&'c mut PgConnection) -> SetupFuture<'c> + Send + Sync>;

/// An async setup closure run against a live connection.
pub struct Callable {
    func: SetupFn,
}

impl Callable {
    pub fn new<F>(func: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> SetupFuture<'c> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }

    pub(crate) async fn invoke(&self, conn: &mut PgConnection) -> anyhow::Result<()> {
        (self.func)(conn).await
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").finish_non_exhaustive()
    }
}

/// One setup step. The set of kinds is closed; execution dispatches
/// through a single exhaustive match.
#[derive(Debug)]
pub enum Action {
    /// Schema and table DDL.
    Ddl(SchemaDefinition),
    /// Bulk row insertion.
    Rows(RowBatch),
    /// Raw SQL, dynamic unless declared static-safe.
    Sql(RawStatement),
    /// Async setup callable; always dynamic.
    Call(Callable),
}

impl Action {
    pub fn ddl(tables: Vec<TableSpec>) -> Self {
        Action::Ddl(SchemaDefinition::new(tables))
    }

    pub fn rows(table: TableSpec, rows: RecordBatch) -> Self {
        Action::Rows(RowBatch::new(table, rows))
    }

    /// A single dynamic SQL statement.
    pub fn sql(statement: impl Into<String>) -> Self {
        Action::Sql(RawStatement::new([statement.into()]))
    }

    /// A single static-safe SQL statement.
    pub fn sql_static(statement: impl Into<String>) -> Self {
        Action::Sql(RawStatement::static_safe([statement.into()]))
    }

    pub fn call<F>(func: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> SetupFuture<'c> + Send + Sync + 'static,
    {
        Action::Call(Callable::new(func))
    }

    /// True iff re-execution against a pristine database has no observable
    /// difference from single execution.
    pub fn is_static_safe(&self) -> bool {
        match self {
            Action::Ddl(_) => true,
            Action::Rows(_) => true,
            Action::Sql(stmt) => stmt.is_static_safe(),
            Action::Call(_) => false,
        }
    }
}

fn validate_table(table: &TableSpec) -> Result<()> {
    if table.name().is_empty() {
        return Err(Error::InvalidAction("table name must not be empty".into()));
    }
    if table.columns().fields().is_empty() {
        return Err(Error::InvalidAction(format!(
            "table {} defines no columns",
            table.qualified_name()
        )));
    }
    Ok(())
}

fn validate_rows(batch: &RowBatch) -> Result<()> {
    let declared = batch.table().columns();
    let actual = batch.rows().schema();
    let matches = declared.fields().len() == actual.fields().len()
        && declared
            .fields()
            .iter()
            .zip(actual.fields().iter())
            .all(|(d, a)| d.name() == a.name() && d.data_type() == a.data_type());
    if !matches {
        return Err(Error::InvalidAction(format!(
            "row batch columns do not match table {}",
            batch.table().qualified_name()
        )));
    }
    Ok(())
}

/// Validate the action list and materialize each referenced table exactly
/// once, preserving declared order.
///
/// A `RowBatch` implies its table's DDL; the first reference wins and
/// later references (from other batches or explicit definitions) are
/// dropped, so a table is created once no matter how many actions mention
/// it.
pub(crate) fn normalize(actions: Vec<Action>) -> Result<Vec<Action>> {
    let mut out = Vec::with_capacity(actions.len());
    let mut materialized: HashSet<String> = HashSet::new();

    for action in actions {
        match action {
            Action::Ddl(def) => {
                if def.tables().is_empty() {
                    return Err(Error::InvalidAction(
                        "schema definition names no tables".into(),
                    ));
                }
                let mut fresh = Vec::new();
                for table in def.tables() {
                    validate_table(table)?;
                    if materialized.insert(table.qualified_name()) {
                        fresh.push(table.clone());
                    }
                }
                if !fresh.is_empty() {
                    out.push(Action::Ddl(SchemaDefinition::new(fresh)));
                }
            }
            Action::Rows(batch) => {
                validate_table(batch.table())?;
                validate_rows(&batch)?;
                if materialized.insert(batch.table().qualified_name()) {
                    out.push(Action::Ddl(SchemaDefinition::new(vec![batch
                        .table()
                        .clone()])));
                }
                out.push(Action::Rows(batch));
            }
            Action::Sql(stmt) => {
                if stmt.statements().is_empty()
                    || stmt.statements().iter().any(|s| s.trim().is_empty())
                {
                    return Err(Error::InvalidAction(
                        "raw statement list is empty or contains a blank statement".into(),
                    ));
                }
                out.push(Action::Sql(stmt));
            }
            Action::Call(callable) => out.push(Action::Call(callable)),
        }
    }

    Ok(out)
}

/// Split into the static prefix and dynamic suffix.
///
/// The split point is the first non-static-safe action; everything after
/// it is dynamic even if individually static-safe, so declared ordering
/// survives template memoization.
pub(crate) fn bifurcate(mut actions: Vec<Action>) -> (Vec<Action>, Vec<Action>) {
    let split = actions
        .iter()
        .position(|action| !action.is_static_safe())
        .unwrap_or(actions.len());
    let dynamic = actions.split_off(split);
    (actions, dynamic)
}

/// Wildcard table selection for DDL.
///
/// A bare pattern addresses the default schema only; a dotted pattern
/// matches against `schema.table`. Either side may use glob wildcards.
pub(crate) struct TableFilter {
    patterns: Vec<TablePattern>,
}

enum TablePattern {
    Bare(glob::Pattern),
    Qualified(glob::Pattern, glob::Pattern),
}

impl TableFilter {
    pub(crate) fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let pattern = match raw.split_once('.') {
                Some((schema, name)) => {
                    TablePattern::Qualified(compile_pattern(schema)?, compile_pattern(name)?)
                }
                None => TablePattern::Bare(compile_pattern(raw)?),
            };
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    pub(crate) fn matches(&self, table: &TableSpec) -> bool {
        self.patterns.iter().any(|pattern| match pattern {
            TablePattern::Bare(name) => {
                table.pg_schema() == DEFAULT_PG_SCHEMA && name.matches(table.name())
            }
            TablePattern::Qualified(schema, name) => {
                schema.matches(table.pg_schema()) && name.matches(table.name())
            }
        })
    }
}

fn compile_pattern(raw: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(raw)
        .map_err(|e| Error::InvalidAction(format!("invalid table pattern {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};

    fn users_table() -> TableSpec {
        TableSpec::new(
            "users",
            Schema::new(vec![Field::new("id", DataType::Int32, false)]),
        )
    }

    fn users_rows() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)])),
            vec![Arc::new(Int32Array::from(vec![1, 2]))],
        )
        .unwrap()
    }

    #[test]
    fn test_bifurcation_splits_at_first_dynamic_action() {
        let actions = vec![
            Action::sql_static("CREATE TABLE a (id INT)"),
            Action::sql_static("CREATE TABLE b (id INT)"),
            Action::sql("INSERT INTO a SELECT generate_series(1, 10)"),
            Action::sql_static("CREATE TABLE c (id INT)"),
        ];
        let (static_actions, dynamic_actions) = bifurcate(actions);
        // the trailing static-safe action stays dynamic to preserve order
        assert_eq!(static_actions.len(), 2);
        assert_eq!(dynamic_actions.len(), 2);
        assert!(static_actions.iter().all(Action::is_static_safe));
        assert!(!dynamic_actions[0].is_static_safe());
        assert!(dynamic_actions[1].is_static_safe());
    }

    #[test]
    fn test_all_static_actions_have_empty_dynamic_suffix() {
        let (static_actions, dynamic_actions) =
            bifurcate(vec![Action::sql_static("CREATE TABLE a (id INT)")]);
        assert_eq!(static_actions.len(), 1);
        assert!(dynamic_actions.is_empty());
    }

    #[test]
    fn test_normalize_materializes_row_batch_table_once() {
        let actions = vec![
            Action::rows(users_table(), users_rows()),
            Action::rows(users_table(), users_rows()),
        ];
        let normalized = normalize(actions).unwrap();
        let ddl_count = normalized
            .iter()
            .filter(|a| matches!(a, Action::Ddl(_)))
            .count();
        assert_eq!(ddl_count, 1);
        assert_eq!(normalized.len(), 3);
        assert!(matches!(normalized[0], Action::Ddl(_)));
    }

    #[test]
    fn test_normalize_respects_explicit_definition() {
        let actions = vec![
            Action::ddl(vec![users_table()]),
            Action::rows(users_table(), users_rows()),
        ];
        let normalized = normalize(actions).unwrap();
        // no second definition inserted for the batch
        assert_eq!(normalized.len(), 2);
        assert!(matches!(normalized[0], Action::Ddl(_)));
        assert!(matches!(normalized[1], Action::Rows(_)));
    }

    #[test]
    fn test_normalize_rejects_empty_schema_definition() {
        let result = normalize(vec![Action::ddl(vec![])]);
        assert!(matches!(result, Err(Error::InvalidAction(_))));
    }

    #[test]
    fn test_normalize_rejects_mismatched_row_batch() {
        let other_table = TableSpec::new(
            "users",
            Schema::new(vec![Field::new("name", DataType::Utf8, true)]),
        );
        let result = normalize(vec![Action::rows(other_table, users_rows())]);
        assert!(matches!(result, Err(Error::InvalidAction(_))));
    }

    #[test]
    fn test_normalize_rejects_blank_statement() {
        let result = normalize(vec![Action::sql("   ")]);
        assert!(matches!(result, Err(Error::InvalidAction(_))));
    }

    #[test]
    fn test_table_filter_bare_name_is_default_schema_only() {
        let filter = TableFilter::new(&["users".to_string()]).unwrap();
        assert!(filter.matches(&users_table()));

        let qualified = TableSpec::in_schema(
            "reports",
            "users",
            Schema::new(vec![Field::new("id", DataType::Int32, false)]),
        );
        assert!(!filter.matches(&qualified));
    }

    #[test]
    fn test_table_filter_qualified_wildcard() {
        let filter = TableFilter::new(&["reports.*".to_string()]).unwrap();
        let qualified = TableSpec::in_schema(
            "reports",
            "totals",
            Schema::new(vec![Field::new("id", DataType::Int32, false)]),
        );
        assert!(filter.matches(&qualified));
        assert!(!filter.matches(&users_table()));
    }

    #[test]
    fn test_table_filter_rejects_invalid_pattern() {
        let result = TableFilter::new(&["[".to_string()]);
        assert!(matches!(result, Err(Error::InvalidAction(_))));
    }
}
