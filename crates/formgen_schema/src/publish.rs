//! Publish Orchestrator.
//!
//! Drives one form version through the publish state machine:
//!
//! ```text
//! REQUESTED -> VALIDATED -> DDL_BUILT -> TABLE_CREATED -> REGISTERED -> ALIASED -> DONE
//!                                   \___________________\______________\____> FAILED
//! ```
//!
//! The first three states are pure. From `DDL_BUILT` on, every transition is
//! journaled in `form_publish_attempts`, and the transitions with side
//! effects are committed in the same transaction as their work. An attempt
//! that stopped after `TABLE_CREATED` is resumed by the next `publish` of the
//! same form without re-running DDL.

use chrono::Duration;
use formgen_db::{
    ActiveTable, AttemptFailure, DbError, Form, FormDb, FormStatus, FormVersion,
    NewPublishAttempt, NewRegistryEntry, PublishAttempt, PublishLease, PublishStage, PublishState,
};
use formgen_ids::{AttemptId, FormId};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ddl::{sha256_hex, DdlScript, DdlStatement, DdlSynthesizer};
use crate::error::{ConflictError, PublishError, ValidationError};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// A lease older than this is treated as abandoned by a crashed publisher.
    /// A live publisher renews its lease every third of this.
    pub lease_ttl: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::minutes(15),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub form_id: FormId,
    pub form_key: String,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    pub attempt_id: AttemptId,
    pub ddl_hash: String,
    /// True when an earlier interrupted attempt was completed instead of
    /// running DDL.
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub form_id: FormId,
    pub form_key: String,
    /// The cached status/version on the form row had drifted from the alias.
    pub projection_fixed: bool,
    /// Attempts of this form whose table exists but was never aliased.
    /// `publish` resumes them.
    pub pending_attempts: Vec<AttemptId>,
}

/// Everything needed to finish a publish once its table exists.
struct Generation<'a> {
    form: &'a Form,
    version: u32,
    attempt_id: AttemptId,
    table_name: String,
    view_name: String,
    ddl_hash: String,
    resumed: bool,
}

#[derive(Clone)]
pub struct PublishOrchestrator {
    db: FormDb,
    synthesizer: DdlSynthesizer,
    options: PublishOptions,
}

impl PublishOrchestrator {
    pub fn new(db: FormDb) -> Self {
        let synthesizer = DdlSynthesizer::new(db.dialect());
        Self {
            db,
            synthesizer,
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    pub fn db(&self) -> &FormDb {
        &self.db
    }

    pub fn synthesizer(&self) -> &DdlSynthesizer {
        &self.synthesizer
    }

    /// Build (but do not run) the script for a version, the latest by default.
    pub async fn preview(
        &self,
        form_id: &FormId,
        version: Option<u32>,
    ) -> Result<DdlScript, PublishError> {
        let form = self.load_form(form_id).await?;
        let version = self.load_version(&form, version).await?;
        Ok(self
            .synthesizer
            .synthesize(&form.key, version.version, &version.fields)?)
    }

    /// Publish the latest version of a form.
    ///
    /// Holds the form's publish lease for the duration; a concurrent call
    /// fails fast with `ConflictError::PublishInFlight`.
    pub async fn publish(&self, form_id: &FormId) -> Result<PublishOutcome, PublishError> {
        info!(form_id = %form_id, state = %PublishState::Requested, "Publish requested");
        let form = self.load_form(form_id).await?;

        let lease = match self
            .db
            .try_acquire_publish_lease(form_id, self.options.lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(DbError::Locked(_)) => {
                warn!(form_key = %form.key, "Publish already in progress");
                return Err(ConflictError::PublishInFlight { form_key: form.key }.into());
            }
            Err(e) => return Err(PublishError::store(PublishState::Requested, None, e)),
        };

        let heartbeat = spawn_lease_heartbeat(self.db.clone(), lease.clone(), self.options.lease_ttl);
        let result = self.publish_locked(form_id).await;
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }

        match self.db.release_publish_lease(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(form_key = %form.key, "Publish lease was taken over before release"),
            Err(e) => warn!(form_key = %form.key, error = %e, "Failed to release publish lease"),
        }

        match &result {
            Ok(outcome) => info!(
                form_key = %outcome.form_key,
                version = outcome.version,
                table = %outcome.table_name,
                view = %outcome.view_name,
                resumed = outcome.resumed,
                "Publish complete"
            ),
            Err(e) => error!(
                form_key = %form.key,
                stage = %e.stage(),
                attempt_id = ?e.attempt_id().map(|id| id.short()),
                error = %e,
                "Publish failed"
            ),
        }
        result
    }

    async fn publish_locked(&self, form_id: &FormId) -> Result<PublishOutcome, PublishError> {
        let store = |e: DbError| PublishError::store(PublishState::Requested, None, e);

        // Reload under the lease; status may have changed while waiting.
        let form = self.load_form(form_id).await?;
        if form.status == FormStatus::Archived {
            return Err(ValidationError::FormArchived(form.key).into());
        }
        let version = self.load_version(&form, None).await?;

        if let Some(alias) = self.db.get_alias(form_id).await.map_err(store)? {
            if alias.active_version >= version.version {
                return Err(ConflictError::AlreadyPublished {
                    form_key: form.key,
                    version: version.version,
                }
                .into());
            }
        }

        if let Some(attempt) = self
            .db
            .latest_attempt(form_id, version.version)
            .await
            .map_err(store)?
        {
            if attempt.needs_reconciliation() {
                return self.resume(&form, attempt).await;
            }
            if attempt.state == PublishState::DdlBuilt {
                // Journaled but the DDL transaction never committed.
                warn!(
                    attempt_id = %attempt.attempt_id,
                    table = %attempt.table_name,
                    "Abandoning publish attempt that never created its table"
                );
                self.record_failure(
                    &attempt.attempt_id,
                    AttemptFailure {
                        at_state: PublishState::DdlBuilt,
                        stage: PublishStage::Execution,
                        statement_index: None,
                        statement: None,
                        message: "abandoned before the table was created".to_string(),
                    },
                )
                .await;
            }
        }

        if let Some(entry) = self
            .db
            .get_entry(form_id, version.version)
            .await
            .map_err(store)?
        {
            // Registered outside an attempt we can resume: journal a new one
            // and finish aliasing.
            warn!(
                form_key = %form.key,
                version = version.version,
                table = %entry.table_name,
                "Registry entry without alias; resuming at aliasing"
            );
            let attempt = self
                .db
                .start_attempt(NewPublishAttempt {
                    form_id: form.id.clone(),
                    version: version.version,
                    table_name: entry.table_name.clone(),
                    view_name: entry.view_name.clone(),
                    ddl: entry.ddl.clone(),
                })
                .await
                .map_err(|e| PublishError::store(PublishState::Registered, None, e))?;
            self.db
                .advance_attempt(&attempt.attempt_id, PublishState::Registered)
                .await
                .map_err(|e| PublishError::store(PublishState::Registered, Some(&attempt.attempt_id), e))?;
            return self
                .alias(Generation {
                    form: &form,
                    version: version.version,
                    attempt_id: attempt.attempt_id,
                    table_name: entry.table_name,
                    view_name: entry.view_name,
                    ddl_hash: entry.ddl_hash,
                    resumed: true,
                })
                .await;
        }

        self.publish_fresh(&form, &version).await
    }

    async fn publish_fresh(
        &self,
        form: &Form,
        version: &FormVersion,
    ) -> Result<PublishOutcome, PublishError> {
        let script = self
            .synthesizer
            .synthesize(&form.key, version.version, &version.fields)
            .map_err(|e| {
                warn!(form_key = %form.key, version = version.version, error = %e, "Field list rejected");
                e
            })?;
        debug!(form_key = %form.key, version = version.version, state = %PublishState::Validated, "Fields validated");
        info!(
            form_key = %form.key,
            version = version.version,
            table = %script.table_name,
            statements = script.statements.len(),
            state = %PublishState::DdlBuilt,
            "DDL built"
        );

        if self
            .db
            .table_exists(&script.table_name)
            .await
            .map_err(|e| PublishError::store(PublishState::DdlBuilt, None, e))?
        {
            return Err(ConflictError::TableExists {
                table_name: script.table_name,
            }
            .into());
        }

        let ddl = script.sql();
        let ddl_hash = script.content_hash();
        let attempt = self
            .db
            .start_attempt(NewPublishAttempt {
                form_id: form.id.clone(),
                version: version.version,
                table_name: script.table_name.clone(),
                view_name: script.view_name.clone(),
                ddl: ddl.clone(),
            })
            .await
            .map_err(|e| PublishError::store(PublishState::DdlBuilt, None, e))?;
        let attempt_id = attempt.attempt_id;

        if let Err(e) = self
            .db
            .create_table_generation(&attempt_id, &script.table_statements())
            .await
        {
            let (statement_index, statement) = match &e {
                DbError::Ddl {
                    index, statement, ..
                } => (Some(*index), Some(statement.clone())),
                _ => (None, None),
            };
            self.record_failure(
                &attempt_id,
                AttemptFailure {
                    at_state: PublishState::DdlBuilt,
                    stage: PublishStage::Execution,
                    statement_index: statement_index.and_then(|i| u32::try_from(i).ok()),
                    statement: statement.clone(),
                    message: e.to_string(),
                },
            )
            .await;
            return Err(PublishError::Execution {
                attempt_id: Some(attempt_id),
                state: PublishState::DdlBuilt,
                statement_index,
                statement,
                source: e,
            });
        }
        info!(
            attempt_id = %attempt_id,
            table = %script.table_name,
            state = %PublishState::TableCreated,
            "Table created"
        );

        self.register(
            form,
            version.version,
            &attempt_id,
            NewRegistryEntry {
                form_id: form.id.clone(),
                version: version.version,
                table_name: script.table_name.clone(),
                view_name: script.view_name.clone(),
                ddl,
                ddl_hash: ddl_hash.clone(),
            },
        )
        .await?;

        self.alias(Generation {
            form,
            version: version.version,
            attempt_id,
            table_name: script.table_name,
            view_name: script.view_name,
            ddl_hash,
            resumed: false,
        })
        .await
    }

    /// Continue an attempt whose table exists. DDL never runs again.
    async fn resume(
        &self,
        form: &Form,
        attempt: PublishAttempt,
    ) -> Result<PublishOutcome, PublishError> {
        let attempt_id = attempt.attempt_id.clone();
        let attempt = if attempt.state == PublishState::Failed {
            self.db
                .reopen_attempt(&attempt_id)
                .await
                .map_err(|e| PublishError::store(attempt.reached_state(), Some(&attempt_id), e))?
        } else {
            attempt
        };
        info!(
            attempt_id = %attempt_id,
            form_key = %form.key,
            version = attempt.version,
            state = %attempt.state,
            "Resuming interrupted publish"
        );

        let store = |e: DbError| PublishError::store(attempt.state, Some(&attempt_id), e);

        if !self.db.table_exists(&attempt.table_name).await.map_err(store)? {
            let source = DbError::invalid_state(format!(
                "table {} recorded as created no longer exists",
                attempt.table_name
            ));
            // Nothing left to resume; the next publish starts over.
            self.record_failure(
                &attempt_id,
                AttemptFailure {
                    at_state: PublishState::DdlBuilt,
                    stage: PublishStage::Execution,
                    statement_index: None,
                    statement: None,
                    message: source.to_string(),
                },
            )
            .await;
            return Err(PublishError::Execution {
                attempt_id: Some(attempt_id),
                state: attempt.state,
                statement_index: None,
                statement: None,
                source,
            });
        }

        let entry = self
            .db
            .get_entry(&attempt.form_id, attempt.version)
            .await
            .map_err(store)?;
        let ddl_hash = match (attempt.state, entry) {
            (_, Some(entry)) if entry.table_name == attempt.table_name => {
                if attempt.state == PublishState::TableCreated {
                    self.db
                        .advance_attempt(&attempt_id, PublishState::Registered)
                        .await
                        .map_err(store)?;
                }
                entry.ddl_hash
            }
            (_, Some(_)) => {
                return Err(ConflictError::DuplicateRegistryEntry {
                    form_key: form.key.clone(),
                    version: attempt.version,
                }
                .into());
            }
            (PublishState::TableCreated, None) => {
                let ddl_hash = sha256_hex(attempt.ddl.as_bytes());
                self.register(
                    form,
                    attempt.version,
                    &attempt_id,
                    NewRegistryEntry {
                        form_id: attempt.form_id.clone(),
                        version: attempt.version,
                        table_name: attempt.table_name.clone(),
                        view_name: attempt.view_name.clone(),
                        ddl: attempt.ddl.clone(),
                        ddl_hash: ddl_hash.clone(),
                    },
                )
                .await?;
                ddl_hash
            }
            (state, None) => {
                return Err(PublishError::Integrity {
                    attempt_id,
                    table_name: attempt.table_name,
                    stage: PublishStage::Registration,
                    source: DbError::invalid_state(format!(
                        "attempt is at {} but the registry has no entry",
                        state
                    )),
                });
            }
        };

        self.alias(Generation {
            form,
            version: attempt.version,
            attempt_id,
            table_name: attempt.table_name,
            view_name: attempt.view_name,
            ddl_hash,
            resumed: true,
        })
        .await
    }

    /// `TABLE_CREATED -> REGISTERED`, journaled with the registry insert.
    async fn register(
        &self,
        form: &Form,
        version: u32,
        attempt_id: &AttemptId,
        entry: NewRegistryEntry,
    ) -> Result<(), PublishError> {
        let table_name = entry.table_name.clone();
        match self.db.register_generation(attempt_id, entry).await {
            Ok(_) => {
                info!(
                    attempt_id = %attempt_id,
                    form_key = %form.key,
                    version,
                    table = %table_name,
                    state = %PublishState::Registered,
                    "Table registered"
                );
                Ok(())
            }
            Err(e) => {
                self.record_failure(
                    attempt_id,
                    AttemptFailure {
                        at_state: PublishState::TableCreated,
                        stage: PublishStage::Registration,
                        statement_index: None,
                        statement: None,
                        message: e.to_string(),
                    },
                )
                .await;
                Err(PublishError::Integrity {
                    attempt_id: attempt_id.clone(),
                    table_name,
                    stage: PublishStage::Registration,
                    source: e,
                })
            }
        }
    }

    /// `REGISTERED -> ALIASED -> DONE`. The view is re-pointed in the same
    /// transaction as the alias.
    async fn alias(&self, generation: Generation<'_>) -> Result<PublishOutcome, PublishError> {
        let Generation {
            form,
            version,
            attempt_id,
            table_name,
            view_name,
            ddl_hash,
            resumed,
        } = generation;

        let view_statements = statement_sql(
            self.synthesizer
                .view_statements(&table_name, &view_name),
        );
        if let Err(e) = self
            .db
            .commit_alias(&attempt_id, &form.id, version, &view_statements)
            .await
        {
            self.record_failure(
                &attempt_id,
                AttemptFailure {
                    at_state: PublishState::Registered,
                    stage: PublishStage::Aliasing,
                    statement_index: None,
                    statement: None,
                    message: e.to_string(),
                },
            )
            .await;
            return Err(PublishError::Integrity {
                attempt_id,
                table_name,
                stage: PublishStage::Aliasing,
                source: e,
            });
        }
        info!(
            attempt_id = %attempt_id,
            form_key = %form.key,
            version,
            table = %table_name,
            view = %view_name,
            state = %PublishState::Aliased,
            "Alias switched"
        );

        // The alias is already live; a lost DONE write changes nothing.
        match self.db.advance_attempt(&attempt_id, PublishState::Done).await {
            Ok(()) => debug!(attempt_id = %attempt_id, state = %PublishState::Done, "Publish attempt done"),
            Err(e) => warn!(attempt_id = %attempt_id, error = %e, "Failed to mark publish attempt done"),
        }

        Ok(PublishOutcome {
            form_id: form.id.clone(),
            form_key: form.key.clone(),
            version,
            table_name,
            view_name,
            attempt_id,
            ddl_hash,
            resumed,
        })
    }

    async fn record_failure(&self, attempt_id: &AttemptId, failure: AttemptFailure) {
        warn!(
            attempt_id = %attempt_id,
            at_state = %failure.at_state,
            stage = %failure.stage,
            statement_index = ?failure.statement_index,
            error = %failure.message,
            state = %PublishState::Failed,
            "Publish attempt failed"
        );
        if let Err(e) = self.db.fail_attempt(attempt_id, &failure).await {
            error!(attempt_id = %attempt_id, error = %e, "Failed to journal publish failure");
        }
    }

    async fn load_form(&self, form_id: &FormId) -> Result<Form, PublishError> {
        self.db
            .get_form(form_id)
            .await
            .map_err(|e| PublishError::store(PublishState::Requested, None, e))?
            .ok_or_else(|| ValidationError::FormNotFound(form_id.to_string()).into())
    }

    async fn load_version(
        &self,
        form: &Form,
        version: Option<u32>,
    ) -> Result<FormVersion, PublishError> {
        let found = match version {
            Some(n) => self.db.get_version(&form.id, n).await,
            None => self.db.latest_version(&form.id).await,
        }
        .map_err(|e| PublishError::store(PublishState::Requested, None, e))?;
        found.ok_or_else(|| match version {
            Some(n) => ValidationError::FormNotFound(format!("{} version {}", form.key, n)).into(),
            None => ValidationError::NoVersions(form.key.clone()).into(),
        })
    }

    /// Attempts whose table exists but whose alias was never switched.
    pub async fn pending_reconciliation(&self) -> Result<Vec<PublishAttempt>, DbError> {
        self.db.unreconciled_attempts().await
    }

    /// Re-derive the form's cached status and version from its alias and
    /// report attempts still waiting to be resumed.
    pub async fn reconcile_form(&self, form_id: &FormId) -> Result<ReconcileReport, DbError> {
        let form = self.db.require_form(form_id).await?;
        let projection_fixed = self.db.sync_form_projection(form_id).await?;
        let pending_attempts: Vec<AttemptId> = self
            .db
            .unreconciled_attempts()
            .await?
            .into_iter()
            .filter(|a| &a.form_id == form_id)
            .map(|a| a.attempt_id)
            .collect();
        if projection_fixed || !pending_attempts.is_empty() {
            info!(
                form_key = %form.key,
                projection_fixed,
                pending = pending_attempts.len(),
                "Form reconciled"
            );
        }
        Ok(ReconcileReport {
            form_id: form.id,
            form_key: form.key,
            projection_fixed,
            pending_attempts,
        })
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>, DbError> {
        let mut reports = Vec::new();
        for form in self.db.list_forms().await? {
            reports.push(self.reconcile_form(&form.id).await?);
        }
        Ok(reports)
    }

    pub async fn resolve_active_table(&self, form_key: &str) -> Result<Option<ActiveTable>, DbError> {
        self.db.resolve_active_table(form_key).await
    }
}

/// Keep `lease` fresh while its publish runs, so a DDL transaction that
/// outlives the TTL is not taken over. Abort the handle when done.
fn spawn_lease_heartbeat(db: FormDb, lease: PublishLease, ttl: Duration) -> Option<JoinHandle<()>> {
    let period = (ttl / 3).to_std().ok().filter(|p| !p.is_zero())?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately, skip it
        interval.tick().await;
        loop {
            interval.tick().await;
            match db.renew_publish_lease(&lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(form_id = %lease.form_id, lease_id = %lease.lease_id, "Publish lease lost; heartbeat stopped");
                    return;
                }
                Err(e) => warn!(form_id = %lease.form_id, error = %e, "Failed to renew publish lease"),
            }
        }
    }))
}

fn statement_sql(statements: Vec<DdlStatement>) -> Vec<String> {
    statements.into_iter().map(|s| s.sql).collect()
}
