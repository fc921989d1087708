//! PMR: ephemeral Docker-backed Postgres databases for automated tests.
//!
//! One shared backing container per session, one isolated logical
//! database per test, and a deterministic pipeline of setup actions
//! executed before the test body receives a connection. Concurrent test
//! processes coordinate through the backing engine's own atomic
//! primitives (unique-name generation, template cloning) and a single
//! advisory-locked cleanup registry; the provisioning hot path takes no
//! application-level locks.
//!
//! # Features
//!
//! - `docker-tests`: enable integration tests that require a Docker daemon
//!
//! # Usage
//!
//! ```rust,ignore
//! use pmr::{
//!     acquire, Action, FixtureDefinition, FixtureOptions, PostgresHealthcheck, ServiceConfig,
//! };
//!
//! # async fn demo() -> pmr::Result<()> {
//! let config = ServiceConfig::postgres().build()?;
//! let _container = acquire(&config, &PostgresHealthcheck).await?;
//! let root = pmr::connect_root(&config).await?;
//!
//! let fixture = FixtureDefinition::new(
//!     "users_fixture",
//!     config,
//!     vec![Action::sql_static("CREATE TABLE users (id INT, name TEXT)")],
//!     FixtureOptions::default(),
//! )?;
//!
//! let mut instance = fixture.instantiate(&root).await?;
//! // run the test against instance.handle() ...
//! instance.teardown().await?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod config;
pub mod containers;
pub mod credentials;
pub mod error;
pub mod fixture;
pub mod pipeline;
pub mod provision;

// Re-exports for convenience
pub use actions::{Action, Callable, RawStatement, RowBatch, SchemaDefinition, TableSpec};
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use containers::cleanup::{lockfile_path, reap, register};
pub use containers::lifecycle::{
    acquire, is_docker_available, ContainerGuard, Healthcheck, LaunchOutcome,
    PostgresHealthcheck, Unreachable,
};
pub use credentials::Credentials;
pub use error::{Error, Result};
pub use fixture::{FixtureDefinition, FixtureInstance, FixtureOptions, FixtureState};
pub use pipeline::{DialectShim, Pipeline, PipelineOptions, ReadyHandle, SessionMode};
pub use provision::{
    connect_root, database_exists, drop_database, produce_database, template_name,
    ProduceOptions, Provisioned,
};
