//! Logical database provisioning inside the shared container.
//!
//! Unique names are delegated to the backing engine's own atomic id
//! generation: a counter table in the root database hands out identifiers
//! that are unique across OS processes without any application-level lock.
//! Each race this module has to survive (concurrent counter-table
//! creation, concurrent template population, cloning a template that is
//! still being populated) is handled by tolerating one specific SQLSTATE.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::Result;

/// Counter table backing engine-side unique name generation.
const COUNTER_TABLE: &str = "pmr_database_number";

/// Prefix for counter-derived per-test database names.
const DATABASE_PREFIX: &str = "pmr_db_";

/// Prefix for fixture template database names.
const TEMPLATE_PREFIX: &str = "pmr_template_";

/// Retry budget while a template is still being populated by another worker.
const TEMPLATE_BUSY_ATTEMPTS: u32 = 40;

/// Fixed backoff between clone attempts against a busy template.
const TEMPLATE_BUSY_INTERVAL: Duration = Duration::from_millis(250);

// SQLSTATE codes this module recovers from.
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_OBJECT: &str = "42710";
const DUPLICATE_DATABASE: &str = "42P04";
const UNIQUE_VIOLATION: &str = "23505";
const OBJECT_IN_USE: &str = "55006";

/// Outcome of a provisioning attempt.
///
/// `AlreadyExists` is a control-flow signal, not an error: on the
/// template-population path it means a concurrent worker created (and is
/// populating, or has populated) the same template. It never leaves the
/// provisioner/pipeline boundary as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    Created(String),
    AlreadyExists(String),
}

impl Provisioned {
    /// The provisioned database name, however it came to exist.
    pub fn name(&self) -> &str {
        match self {
            Provisioned::Created(name) => name,
            Provisioned::AlreadyExists(name) => name,
        }
    }
}

/// Knobs for [`produce_database`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProduceOptions<'a> {
    /// Clone source; defaults to the engine's built-in pristine template.
    pub template: Option<&'a str>,
    /// Use this exact name instead of deriving one from the counter.
    pub fixed_name: Option<&'a str>,
    /// Convert a duplicate-database failure into
    /// [`Provisioned::AlreadyExists`] (template-population path only).
    pub ignore_name_collision: bool,
}

/// Template database name for a stable fixture identifier.
pub fn template_name(fixture_id: &str) -> String {
    let slug: String = fixture_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{TEMPLATE_PREFIX}{slug}")
}

/// Quote an identifier for direct interpolation into DDL.
///
/// `CREATE DATABASE` and friends cannot take bound parameters, so every
/// interpolated identifier goes through here.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sqlstate_is(err: &sqlx::Error, codes: &[&str]) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| codes.contains(&code.as_ref()))
        .unwrap_or(false)
}

/// Connect a small pool to the root database of the shared container.
pub async fn connect_root(config: &ServiceConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.root_url())
        .await?;
    Ok(pool)
}

/// Derive a globally unique database name from the engine-side counter.
async fn next_database_name(root: &PgPool) -> Result<String> {
    let create = format!("CREATE TABLE IF NOT EXISTS {COUNTER_TABLE} (id BIGSERIAL PRIMARY KEY)");
    if let Err(e) = sqlx::query(&create).execute(root).await {
        // IF NOT EXISTS still races on the catalog; the loser sees one of
        // these and can proceed, the table exists either way.
        if !sqlstate_is(&e, &[DUPLICATE_TABLE, DUPLICATE_OBJECT, UNIQUE_VIOLATION]) {
            return Err(e.into());
        }
    }

    let insert = format!("INSERT INTO {COUNTER_TABLE} DEFAULT VALUES RETURNING id");
    let (id,): (i64,) = sqlx::query_as(&insert).fetch_one(root).await?;
    Ok(format!("{DATABASE_PREFIX}{id}"))
}

/// Create a uniquely named logical database inside the shared container.
///
/// With a template, creation retries while the template's populator is
/// still connected (the engine refuses to clone a database with active
/// users), so callers always clone a fully-populated template.
pub async fn produce_database(
    root: &PgPool,
    username: &str,
    opts: ProduceOptions<'_>,
) -> Result<Provisioned> {
    let name = match opts.fixed_name {
        Some(name) => name.to_string(),
        None => next_database_name(root).await?,
    };

    let template = opts.template.unwrap_or("template1");
    let create = format!(
        "CREATE DATABASE {} TEMPLATE {}",
        quote_ident(&name),
        quote_ident(template)
    );

    let mut busy_attempts = 0u32;
    loop {
        match sqlx::query(&create).execute(root).await {
            Ok(_) => break,
            Err(e) if sqlstate_is(&e, &[DUPLICATE_DATABASE]) && opts.ignore_name_collision => {
                debug!("database {} already exists, skipping creation", name);
                return Ok(Provisioned::AlreadyExists(name));
            }
            Err(e)
                if sqlstate_is(&e, &[OBJECT_IN_USE])
                    && busy_attempts < TEMPLATE_BUSY_ATTEMPTS =>
            {
                busy_attempts += 1;
                debug!(
                    "template {} busy, retrying clone ({}/{})",
                    template, busy_attempts, TEMPLATE_BUSY_ATTEMPTS
                );
                sleep(TEMPLATE_BUSY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let grant = format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        quote_ident(&name),
        quote_ident(username)
    );
    sqlx::query(&grant).execute(root).await?;

    info!("provisioned database {}", name);
    Ok(Provisioned::Created(name))
}

/// Drop a per-test database at teardown.
///
/// `WITH (FORCE)` terminates lingering connections so a leaked session
/// cannot wedge cleanup (requires Postgres 13+, satisfied by the default
/// image).
pub async fn drop_database(root: &PgPool, name: &str) -> Result<()> {
    let drop = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name));
    sqlx::query(&drop).execute(root).await?;
    debug!("dropped database {}", name);
    Ok(())
}

/// Whether a logical database is present in the container's listing.
pub async fn database_exists(root: &PgPool, name: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT datname::text FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(root)
            .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_name_is_slugged() {
        assert_eq!(template_name("users_fixture"), "pmr_template_users_fixture");
        assert_eq!(template_name("Users-Fixture.v2"), "pmr_template_users_fixture_v2");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_produce_options_default() {
        let opts = ProduceOptions::default();
        assert!(opts.template.is_none());
        assert!(opts.fixed_name.is_none());
        assert!(!opts.ignore_name_collision);
    }
}
