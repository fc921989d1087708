//! Fixture orchestration: template amortization, per-test instantiation,
//! and teardown guarantees.
//!
//! A fixture definition is built once (validating its actions) and
//! instantiated once per test. With template caching, the static action
//! prefix is executed exactly once per fixture id into a template
//! database; every later instantiation clones the template and runs only
//! the dynamic suffix.

use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::config::ServiceConfig;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineOptions, ReadyHandle, SessionMode};
use crate::provision::{self, ProduceOptions, Provisioned};

/// Per-fixture behavior switches.
#[derive(Debug, Clone)]
pub struct FixtureOptions {
    /// Populate a template once per fixture id and clone it per test.
    pub template_caching: bool,
    /// Drop the per-test database at teardown. Disable to keep it around
    /// for inspection after the run.
    pub cleanup_database: bool,
    pub session: SessionMode,
    pub transaction_sharing: bool,
    /// DDL table-subset restriction, passed through to the pipeline.
    pub tables: Option<Vec<String>>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            template_caching: true,
            cleanup_database: true,
            session: SessionMode::Engine,
            transaction_sharing: false,
            tables: None,
        }
    }
}

/// Lifecycle of one fixture instantiation.
///
/// `TornDown` is terminal; no transition skips a stage, though
/// `TemplatePopulated` only appears in the process that actually
/// populated the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Created,
    DatabaseProvisioned,
    TemplatePopulated,
    ActionsApplied,
    Ready,
    TornDown,
}

impl FixtureState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(self, next: FixtureState) -> bool {
        use FixtureState::*;
        matches!(
            (self, next),
            (Created, DatabaseProvisioned)
                | (DatabaseProvisioned, TemplatePopulated)
                | (DatabaseProvisioned, ActionsApplied)
                | (TemplatePopulated, ActionsApplied)
                | (ActionsApplied, Ready)
                | (Ready, TornDown)
        )
    }
}

/// A named, reusable test-resource definition: configuration plus an
/// ordered action list.
#[derive(Debug)]
pub struct FixtureDefinition {
    id: String,
    config: ServiceConfig,
    pipeline: Pipeline,
    options: FixtureOptions,
}

impl FixtureDefinition {
    /// Build a definition, validating the action list up front.
    pub fn new(
        id: impl Into<String>,
        config: ServiceConfig,
        actions: Vec<Action>,
        options: FixtureOptions,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Config("fixture id must not be empty".to_string()));
        }
        let pipeline = Pipeline::new(
            actions,
            PipelineOptions {
                session: options.session,
                transaction_sharing: options.transaction_sharing,
                tables: options.tables.clone(),
                shim: None,
            },
        )?;
        Ok(Self {
            id,
            config,
            pipeline,
            options,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Provision an isolated database, apply the actions, and return the
    /// ready instance.
    pub async fn instantiate(&self, root: &PgPool) -> Result<FixtureInstance> {
        let username = self.config.username();
        let use_template = self.options.template_caching && self.pipeline.has_static();

        let mut populated_template = false;
        let database = if use_template {
            let template = provision::template_name(&self.id);
            let produced = provision::produce_database(
                root,
                username,
                ProduceOptions {
                    fixed_name: Some(&template),
                    ignore_name_collision: true,
                    ..Default::default()
                },
            )
            .await?;
            match produced {
                Provisioned::Created(name) => {
                    info!("populating template {}", name);
                    let mut conn = PgConnection::connect(&self.config.url_for(&name)).await?;
                    let populated = self.pipeline.run_static(&mut conn).await;
                    // Close before surfacing any error so a failed populate
                    // cannot hold the template busy for other workers.
                    conn.close().await?;
                    populated?;
                    populated_template = true;
                }
                Provisioned::AlreadyExists(name) => {
                    debug!("template {} already populated by a concurrent worker", name);
                }
            }
            provision::produce_database(
                root,
                username,
                ProduceOptions {
                    template: Some(&template),
                    ..Default::default()
                },
            )
            .await?
            .name()
            .to_string()
        } else {
            provision::produce_database(root, username, ProduceOptions::default())
                .await?
                .name()
                .to_string()
        };

        let mut instance = FixtureInstance {
            state: FixtureState::Created,
            database,
            root: root.clone(),
            cleanup_database: self.options.cleanup_database,
            handle: None,
        };
        instance.advance(FixtureState::DatabaseProvisioned);
        if populated_template {
            instance.advance(FixtureState::TemplatePopulated);
        }

        let handle = if use_template {
            self.pipeline.manage_cloned(&self.config, &instance.database).await?
        } else {
            self.pipeline.manage(&self.config, &instance.database).await?
        };
        instance.advance(FixtureState::ActionsApplied);
        instance.handle = Some(handle);
        instance.advance(FixtureState::Ready);
        Ok(instance)
    }
}

/// One test's provisioned database plus its ready handle.
#[derive(Debug)]
pub struct FixtureInstance {
    state: FixtureState,
    database: String,
    root: PgPool,
    cleanup_database: bool,
    handle: Option<ReadyHandle>,
}

impl FixtureInstance {
    pub fn state(&self) -> FixtureState {
        self.state
    }

    /// Name of this test's logical database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The ready handle; `None` once torn down.
    pub fn handle(&mut self) -> Option<&mut ReadyHandle> {
        self.handle.as_mut()
    }

    /// Connection parameters, while the instance is live.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.handle.as_ref().map(ReadyHandle::credentials)
    }

    fn advance(&mut self, next: FixtureState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal fixture transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("fixture {}: {:?} -> {:?}", self.database, self.state, next);
        self.state = next;
    }

    /// Dispose connections and drop the database (unless cleanup is
    /// disabled, in which case it persists for external inspection).
    pub async fn teardown(mut self) -> Result<()> {
        self.teardown_inner().await
    }

    async fn teardown_inner(&mut self) -> Result<()> {
        if self.state == FixtureState::TornDown {
            return Ok(());
        }
        if let Some(mut handle) = self.handle.take() {
            handle.dispose().await?;
        }
        if self.cleanup_database {
            provision::drop_database(&self.root, &self.database).await?;
        } else {
            info!(
                "cleanup disabled, database {} kept for inspection",
                self.database
            );
        }
        self.advance(FixtureState::TornDown);
        Ok(())
    }
}

impl Drop for FixtureInstance {
    fn drop(&mut self) {
        if self.state == FixtureState::TornDown {
            return;
        }
        warn!("fixture instance for {} dropped without teardown", self.database);
        if !self.cleanup_database {
            return;
        }
        // Best effort from a sync context; an abandoned database is
        // otherwise discarded with the container.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let root = self.root.clone();
            let database = self.database.clone();
            rt.spawn(async move {
                if let Err(e) = provision::drop_database(&root, &database).await {
                    warn!("failed to drop database {}: {}", database, e);
                }
            });
        }
    }
}
