//! Deterministic execution of setup actions against a provisioned database.
//!
//! A pipeline is built once per fixture definition: the action list is
//! validated, normalized, and bifurcated up front, so an invalid list
//! fails before anything touches a database. Execution then runs the
//! static prefix and dynamic suffix in declared order and hands the test
//! a ready handle with credentials attached.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, StringArray,
};
use arrow::datatypes::DataType as ArrowDataType;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tracing::{debug, warn};

use crate::actions::{
    bifurcate, normalize, Action, RowBatch, SchemaDefinition, TableFilter, TableSpec,
    DEFAULT_PG_SCHEMA,
};
use crate::config::ServiceConfig;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::provision::quote_ident;

/// How the ready handle exposes the provisioned database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Pool-oriented handle.
    #[default]
    Engine,
    /// Single-connection handle.
    Session,
}

/// Vendor-dialect emulation collaborator, consulted per raw statement.
///
/// When a statement matches, the shim performs the emulated operation in
/// place of a plain execute. The engine only defines the seam.
#[async_trait]
pub trait DialectShim: Send + Sync {
    /// Whether this shim wants to handle the statement.
    fn matches(&self, sql: &str) -> bool;

    /// Perform the emulated operation.
    async fn apply(&self, conn: &mut PgConnection, sql: &str) -> anyhow::Result<()>;
}

/// Execution switches for one pipeline.
#[derive(Clone, Default)]
pub struct PipelineOptions {
    pub session: SessionMode,
    /// Run setup actions inside the transaction later exposed to the test,
    /// so transaction-scoped artifacts stay visible. Forces a
    /// single-connection handle: a pool cannot share one open transaction.
    pub transaction_sharing: bool,
    /// Restrict DDL to tables matching these patterns (bare name =
    /// default schema; `schema.name`; glob wildcards on either side).
    pub tables: Option<Vec<String>>,
    pub shim: Option<Arc<dyn DialectShim>>,
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("session", &self.session)
            .field("transaction_sharing", &self.transaction_sharing)
            .field("tables", &self.tables)
            .field("shim", &self.shim.is_some())
            .finish()
    }
}

/// A classified, ordered, validated action plan.
pub struct Pipeline {
    static_actions: Vec<Action>,
    dynamic_actions: Vec<Action>,
    filter: Option<TableFilter>,
    session: SessionMode,
    transaction_sharing: bool,
    shim: Option<Arc<dyn DialectShim>>,
}

impl Pipeline {
    /// Classify and order the actions. Fails fast: nothing executes if any
    /// action is invalid.
    pub fn new(actions: Vec<Action>, options: PipelineOptions) -> Result<Self> {
        let filter = match options.tables.as_deref() {
            Some(patterns) => Some(TableFilter::new(patterns)?),
            None => None,
        };
        let normalized = normalize(actions)?;
        let (static_actions, dynamic_actions) = bifurcate(normalized);
        debug!(
            "pipeline split: {} static / {} dynamic action(s)",
            static_actions.len(),
            dynamic_actions.len()
        );
        Ok(Self {
            static_actions,
            dynamic_actions,
            filter,
            session: options.session,
            transaction_sharing: options.transaction_sharing,
            shim: options.shim,
        })
    }

    /// Replace the dialect shim collaborator.
    pub fn with_shim(mut self, shim: Arc<dyn DialectShim>) -> Self {
        self.shim = Some(shim);
        self
    }

    /// Whether any actions were classified static.
    pub fn has_static(&self) -> bool {
        !self.static_actions.is_empty()
    }

    /// Execute only the static prefix (template population path).
    pub async fn run_static(&self, conn: &mut PgConnection) -> Result<()> {
        for action in &self.static_actions {
            self.apply(conn, action).await?;
        }
        Ok(())
    }

    async fn run_dynamic(&self, conn: &mut PgConnection) -> Result<()> {
        for action in &self.dynamic_actions {
            self.apply(conn, action).await?;
        }
        Ok(())
    }

    /// Apply all actions against a fresh database and return a ready handle.
    pub async fn manage(&self, config: &ServiceConfig, database: &str) -> Result<ReadyHandle> {
        self.manage_inner(config, database, true).await
    }

    /// Apply only the dynamic suffix; the database was cloned from a
    /// template that already holds the static prefix.
    pub async fn manage_cloned(
        &self,
        config: &ServiceConfig,
        database: &str,
    ) -> Result<ReadyHandle> {
        self.manage_inner(config, database, false).await
    }

    async fn manage_inner(
        &self,
        config: &ServiceConfig,
        database: &str,
        include_static: bool,
    ) -> Result<ReadyHandle> {
        let url = config.url_for(database);
        let credentials = config.credentials_for(database);
        let mut conn = PgConnection::connect(&url).await?;

        if self.transaction_sharing {
            // Setup and test body share one transaction; it stays open and
            // belongs to the test from here on.
            sqlx::query("BEGIN").execute(&mut conn).await?;
            if include_static {
                self.run_static(&mut conn).await?;
            }
            self.run_dynamic(&mut conn).await?;
            return Ok(ReadyHandle {
                credentials,
                conn: HandleConn::Connection(Box::new(conn)),
                shared_transaction: true,
            });
        }

        // Autocommit: every action (and each callable's effect) commits as
        // it executes, so there is no final commit to issue.
        if include_static {
            self.run_static(&mut conn).await?;
        }
        self.run_dynamic(&mut conn).await?;
        conn.close().await?;

        let conn = match self.session {
            SessionMode::Engine => HandleConn::Pool(
                PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&url)
                    .await?,
            ),
            SessionMode::Session => {
                HandleConn::Connection(Box::new(PgConnection::connect(&url).await?))
            }
        };

        Ok(ReadyHandle {
            credentials,
            conn,
            shared_transaction: false,
        })
    }

    async fn apply(&self, conn: &mut PgConnection, action: &Action) -> Result<()> {
        match action {
            Action::Ddl(def) => self.apply_ddl(conn, def).await,
            Action::Rows(batch) => apply_rows(conn, batch).await,
            Action::Sql(stmt) => {
                for sql in stmt.statements() {
                    match self.shim.as_ref().filter(|shim| shim.matches(sql)) {
                        Some(shim) => {
                            debug!("delegating statement to dialect shim");
                            shim.apply(conn, sql).await.map_err(Error::Shim)?;
                        }
                        None => {
                            sqlx::query(sql).execute(&mut *conn).await?;
                        }
                    }
                }
                Ok(())
            }
            Action::Call(callable) => callable.invoke(conn).await.map_err(Error::Callable),
        }
    }

    async fn apply_ddl(&self, conn: &mut PgConnection, def: &SchemaDefinition) -> Result<()> {
        for table in def.tables() {
            if let Some(filter) = &self.filter {
                if !filter.matches(table) {
                    debug!("skipping table {} (filtered out)", table.qualified_name());
                    continue;
                }
            }
            if table.pg_schema() != DEFAULT_PG_SCHEMA {
                let sql = format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote_ident(table.pg_schema())
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
            let sql = create_table_sql(table);
            debug!("creating table: {}", sql);
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("static_actions", &self.static_actions.len())
            .field("dynamic_actions", &self.dynamic_actions.len())
            .field("session", &self.session)
            .field("transaction_sharing", &self.transaction_sharing)
            .finish_non_exhaustive()
    }
}

fn qualified_quoted(table: &TableSpec) -> String {
    format!(
        "{}.{}",
        quote_ident(table.pg_schema()),
        quote_ident(table.name())
    )
}

/// Build `CREATE TABLE IF NOT EXISTS` DDL from a table's Arrow schema.
fn create_table_sql(table: &TableSpec) -> String {
    let columns: Vec<String> = table
        .columns()
        .fields()
        .iter()
        .map(|field| {
            let pg_type = arrow_to_pg_type(field.data_type());
            let nullable = if field.is_nullable() { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(field.name()), pg_type, nullable)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_quoted(table),
        columns.join(", ")
    )
}

/// Convert an Arrow data type to a PostgreSQL column type.
fn arrow_to_pg_type(dt: &ArrowDataType) -> &'static str {
    match dt {
        ArrowDataType::Boolean => "BOOLEAN",
        ArrowDataType::Int8 | ArrowDataType::Int16 => "SMALLINT",
        ArrowDataType::Int32 => "INTEGER",
        ArrowDataType::Int64 => "BIGINT",
        ArrowDataType::Float32 => "REAL",
        ArrowDataType::Float64 => "DOUBLE PRECISION",
        ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => "TEXT",
        ArrowDataType::Binary | ArrowDataType::LargeBinary => "BYTEA",
        ArrowDataType::Date32 | ArrowDataType::Date64 => "DATE",
        ArrowDataType::Timestamp(_, _) => "TIMESTAMP",
        _ => "TEXT", // Fallback
    }
}

fn build_insert_sql(batch: &RowBatch) -> String {
    let schema = batch.rows().schema();
    let column_names: Vec<String> = schema
        .fields()
        .iter()
        .map(|field| quote_ident(field.name()))
        .collect();
    let placeholders: Vec<String> = (1..=column_names.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_quoted(batch.table()),
        column_names.join(", "),
        placeholders.join(", ")
    )
}

/// Insert a record batch row by row with bound parameters.
async fn apply_rows(conn: &mut PgConnection, batch: &RowBatch) -> Result<()> {
    let rows = batch.rows();
    if rows.num_rows() == 0 {
        return Ok(());
    }

    let insert_sql = build_insert_sql(batch);
    for row_idx in 0..rows.num_rows() {
        let mut query = sqlx::query(&insert_sql);
        for col_idx in 0..rows.num_columns() {
            query = bind_value(query, rows.column(col_idx), row_idx)?;
        }
        query.execute(&mut *conn).await?;
    }

    debug!(
        "inserted {} row(s) into {}",
        rows.num_rows(),
        batch.table().qualified_name()
    );
    Ok(())
}

/// Bind one Arrow array value to a sqlx query.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    array: &Arc<dyn Array>,
    row_idx: usize,
) -> Result<Query<'q, Postgres, PgArguments>> {
    if array.is_null(row_idx) {
        // Bind a typed NULL so parameter-type inference stays correct.
        let bound = match array.data_type() {
            ArrowDataType::Boolean => query.bind(None::<bool>),
            ArrowDataType::Int8 | ArrowDataType::Int16 => query.bind(None::<i16>),
            ArrowDataType::Int32 => query.bind(None::<i32>),
            ArrowDataType::Int64 => query.bind(None::<i64>),
            ArrowDataType::Float32 => query.bind(None::<f32>),
            ArrowDataType::Float64 => query.bind(None::<f64>),
            _ => query.bind(None::<String>),
        };
        return Ok(bound);
    }

    let bound = match array.data_type() {
        ArrowDataType::Boolean => {
            let arr = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Int8 => {
            let arr = array.as_any().downcast_ref::<Int8Array>().unwrap();
            query.bind(arr.value(row_idx) as i16)
        }
        ArrowDataType::Int16 => {
            let arr = array.as_any().downcast_ref::<Int16Array>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Int32 => {
            let arr = array.as_any().downcast_ref::<Int32Array>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Int64 => {
            let arr = array.as_any().downcast_ref::<Int64Array>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Float32 => {
            let arr = array.as_any().downcast_ref::<Float32Array>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Float64 => {
            let arr = array.as_any().downcast_ref::<Float64Array>().unwrap();
            query.bind(arr.value(row_idx))
        }
        ArrowDataType::Utf8 => {
            let arr = array.as_any().downcast_ref::<StringArray>().unwrap();
            query.bind(arr.value(row_idx).to_string())
        }
        ArrowDataType::LargeUtf8 => {
            let arr = array.as_any().downcast_ref::<LargeStringArray>().unwrap();
            query.bind(arr.value(row_idx).to_string())
        }
        other => {
            return Err(Error::InvalidAction(format!(
                "unsupported column type {other} for bulk insert"
            )))
        }
    };
    Ok(bound)
}

/// A provisioned database ready for the test body.
pub struct ReadyHandle {
    credentials: Credentials,
    conn: HandleConn,
    shared_transaction: bool,
}

enum HandleConn {
    Pool(PgPool),
    Connection(Box<PgConnection>),
    Closed,
}

impl ReadyHandle {
    /// Connection parameters for reconstructing independent clients.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The pool, when the pipeline ran in [`SessionMode::Engine`].
    pub fn pool(&self) -> Option<&PgPool> {
        match &self.conn {
            HandleConn::Pool(pool) => Some(pool),
            _ => None,
        }
    }

    /// The single connection, when running in [`SessionMode::Session`] or
    /// with transaction sharing.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        match &mut self.conn {
            HandleConn::Connection(conn) => Some(conn),
            _ => None,
        }
    }

    /// Whether the handle's connection still carries the setup transaction.
    pub fn shares_transaction(&self) -> bool {
        self.shared_transaction
    }

    /// Dispose connections. A shared setup transaction is rolled back so
    /// nothing stays open against the database about to be dropped.
    pub async fn dispose(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.conn, HandleConn::Closed) {
            HandleConn::Pool(pool) => pool.close().await,
            HandleConn::Connection(mut conn) => {
                if self.shared_transaction {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!("rollback on dispose failed: {}", e);
                    }
                }
                conn.close().await?;
            }
            HandleConn::Closed => {}
        }
        Ok(())
    }
}

impl fmt::Debug for ReadyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyHandle")
            .field("credentials", &self.credentials)
            .field("shared_transaction", &self.shared_transaction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn users_table() -> TableSpec {
        TableSpec::new(
            "users",
            Schema::new(vec![
                Field::new("id", DataType::Int32, false),
                Field::new("name", DataType::Utf8, true),
            ]),
        )
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql(&users_table()),
            "CREATE TABLE IF NOT EXISTS \"public\".\"users\" \
             (\"id\" INTEGER NOT NULL, \"name\" TEXT)"
        );
    }

    #[test]
    fn test_insert_sql_uses_positional_placeholders() {
        let rows = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)])),
            vec![Arc::new(Int32Array::from(vec![1]))],
        )
        .unwrap();
        let table = TableSpec::new(
            "users",
            Schema::new(vec![Field::new("id", DataType::Int32, false)]),
        );
        let batch = RowBatch::new(table, rows);
        assert_eq!(
            build_insert_sql(&batch),
            "INSERT INTO \"public\".\"users\" (\"id\") VALUES ($1)"
        );
    }

    #[test]
    fn test_pipeline_construction_fails_fast() {
        let result = Pipeline::new(vec![Action::sql("")], PipelineOptions::default());
        assert!(matches!(result, Err(Error::InvalidAction(_))));
    }

    #[test]
    fn test_pipeline_options_default() {
        let options = PipelineOptions::default();
        assert_eq!(options.session, SessionMode::Engine);
        assert!(!options.transaction_sharing);
        assert!(options.tables.is_none());
        assert!(options.shim.is_none());
    }
}
