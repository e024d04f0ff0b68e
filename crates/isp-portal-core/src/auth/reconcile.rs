//! Once-per-session check that the stored credential still matches what
//! the server thinks, with self-healing when it doesn't.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::store::{IDENTITY_KEY, TOKEN_KEY};
use super::token::{Claims, Confirmation, TokenValidator};
use super::{AuthError, CredentialStore};
use crate::env::EnvironmentDescriptor;

/// Session flag recording that reconciliation has run to completion
pub const RECONCILE_FLAG_KEY: &str = "auth_reconcile_completed";

/// How often a session re-checks after the server couldn't be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Indeterminate runs allowed before the session gives up checking
    pub max_indeterminate_runs: u32,
    /// Minimum wait before the second run; doubles after each further run
    pub initial_interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_indeterminate_runs: 3,
            initial_interval_secs: 30,
        }
    }
}

impl RetryPolicy {
    fn interval_after(&self, runs: u32) -> Duration {
        let factor = 1u64 << runs.saturating_sub(1).min(16);
        Duration::from_secs(self.initial_interval_secs.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    TokenRejected { status: u16 },
    IdentityConflict { local: String, remote: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnchangedReason {
    NoCredential,
    Indeterminate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    Checking,
    Healthy,
    Corrupted(CorruptionReason),
    Corrected,
    Unchanged(UnchangedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    Started,
    NoCredential,
    Confirmed { local: String, remote: String },
    Rejected { status: u16 },
    Indeterminate(String),
    Cleared,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Invalid reconcile transition from {state:?} on {event:?}")]
    InvalidTransition {
        state: ReconcileState,
        event: ReconcileEvent,
    },
}

impl ReconcileState {
    /// The only way a reconcile run changes state.
    pub fn on(self, event: ReconcileEvent) -> Result<Self, ReconcileError> {
        use ReconcileEvent as E;
        use ReconcileState as S;

        match (self, event) {
            (S::Idle, E::Started) => Ok(S::Checking),
            (S::Checking, E::NoCredential) => Ok(S::Unchanged(UnchangedReason::NoCredential)),
            (S::Checking, E::Indeterminate(reason)) => {
                Ok(S::Unchanged(UnchangedReason::Indeterminate(reason)))
            }
            (S::Checking, E::Rejected { status }) => {
                Ok(S::Corrupted(CorruptionReason::TokenRejected { status }))
            }
            (S::Checking, E::Confirmed { local, remote }) => {
                if local == remote {
                    Ok(S::Healthy)
                } else {
                    Ok(S::Corrupted(CorruptionReason::IdentityConflict { local, remote }))
                }
            }
            (S::Corrupted(_), E::Cleared) => Ok(S::Corrected),
            (state, event) => Err(ReconcileError::InvalidTransition { state, event }),
        }
    }

    /// Healthy and Corrected end reconciliation for the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcileState::Healthy | ReconcileState::Corrected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LocalDevelopment,
    AlreadyCompleted,
    /// An earlier run was indeterminate and the retry interval hasn't passed
    RetryNotDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Finished {
        state: ReconcileState,
        /// Advisory: the UI should reload its view of the session
        reload_recommended: bool,
    },
}

impl ReconcileOutcome {
    pub fn state(&self) -> Option<&ReconcileState> {
        match self {
            ReconcileOutcome::Finished { state, .. } => Some(state),
            ReconcileOutcome::Skipped(_) => None,
        }
    }

    pub fn reload_recommended(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Finished {
                reload_recommended: true,
                ..
            }
        )
    }
}

/// Findings from a read-only inspection of the stored credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DiagnosticResult {
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl DiagnosticResult {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    fn recommend(&mut self, recommendation: &str) {
        if !self.recommendations.iter().any(|r| r == recommendation) {
            self.recommendations.push(recommendation.to_string());
        }
    }
}

#[derive(Debug, Default)]
struct RetryTracker {
    indeterminate_runs: u32,
    last_run: Option<Instant>,
}

pub struct AuthReconciler {
    store: Arc<CredentialStore>,
    validator: Arc<TokenValidator>,
    env: Arc<EnvironmentDescriptor>,
    policy: RetryPolicy,
    tracker: Mutex<RetryTracker>,
    /// Held for a whole run so concurrent callers see the first run's result
    running: tokio::sync::Mutex<()>,
}

impl AuthReconciler {
    pub fn new(
        store: Arc<CredentialStore>,
        validator: Arc<TokenValidator>,
        env: Arc<EnvironmentDescriptor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            validator,
            env,
            policy,
            tracker: Mutex::new(RetryTracker::default()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one reconciliation pass if this session still needs one.
    pub async fn run(&self) -> ReconcileOutcome {
        if !self.env.is_public_deployment() {
            debug!("Local development deployment, skipping reconciliation");
            return ReconcileOutcome::Skipped(SkipReason::LocalDevelopment);
        }
        let _running = self.running.lock().await;
        if self.is_completed().await {
            return ReconcileOutcome::Skipped(SkipReason::AlreadyCompleted);
        }
        if !self.retry_due() {
            debug!("Reconcile retry not due yet");
            return ReconcileOutcome::Skipped(SkipReason::RetryNotDue);
        }

        match self.check().await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Unreachable with the transitions above; treat like no change
                warn!(error = %e, "Reconcile state machine rejected a transition");
                ReconcileOutcome::Finished {
                    state: ReconcileState::Unchanged(UnchangedReason::Indeterminate(e.to_string())),
                    reload_recommended: false,
                }
            }
        }
    }

    async fn check(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let state = ReconcileState::Idle.on(ReconcileEvent::Started)?;
        info!("Reconciling stored credential with server");

        let Some(credential) = self.store.current().await else {
            let state = state.on(ReconcileEvent::NoCredential)?;
            self.mark_completed().await;
            return Ok(ReconcileOutcome::Finished {
                state,
                reload_recommended: false,
            });
        };

        let event = match self.validator.confirm_with_server(credential.token()).await {
            Confirmation::Confirmed(remote) => ReconcileEvent::Confirmed {
                local: credential.username().to_string(),
                remote: remote.username,
            },
            Confirmation::Rejected { status } => ReconcileEvent::Rejected { status },
            Confirmation::Indeterminate(reason) => ReconcileEvent::Indeterminate(reason),
        };
        let state = state.on(event)?;

        match state {
            ReconcileState::Healthy => {
                info!(username = %credential.username(), "Stored credential is healthy");
                self.mark_completed().await;
                Ok(ReconcileOutcome::Finished {
                    state,
                    reload_recommended: false,
                })
            }
            ReconcileState::Unchanged(_) => {
                self.record_indeterminate().await;
                Ok(ReconcileOutcome::Finished {
                    state,
                    reload_recommended: false,
                })
            }
            ReconcileState::Corrupted(reason) => {
                warn!(reason = ?reason, "Stored credential is corrupted, clearing");
                if let CorruptionReason::IdentityConflict { local, remote } = &reason {
                    self.store
                        .invalidate(
                            credential.token(),
                            AuthError::IdentityConflict {
                                local: local.clone(),
                                remote: remote.clone(),
                            },
                        )
                        .await;
                }
                self.clear_and_verify().await;
                let state = ReconcileState::Corrupted(reason).on(ReconcileEvent::Cleared)?;
                self.mark_completed().await;
                Ok(ReconcileOutcome::Finished {
                    state,
                    reload_recommended: true,
                })
            }
            other => Err(ReconcileError::InvalidTransition {
                state: other,
                event: ReconcileEvent::Cleared,
            }),
        }
    }

    async fn clear_and_verify(&self) {
        let report = self.store.clear().await;
        if !report.errors.is_empty() {
            warn!(errors = ?report.errors, "Some backends failed to clear");
        }
        if self.store.load().await.is_some() {
            warn!("Credential still present after clear, clearing again");
            self.store.clear().await;
        }
    }

    async fn is_completed(&self) -> bool {
        matches!(
            self.store.session_flags().get(RECONCILE_FLAG_KEY).await,
            Ok(Some(ref v)) if v == "true"
        )
    }

    async fn mark_completed(&self) {
        if let Err(e) = self.store.session_flags().set(RECONCILE_FLAG_KEY, "true").await {
            warn!(error = %AuthError::from(e), "Could not record reconcile completion");
        }
    }

    fn retry_due(&self) -> bool {
        let Ok(tracker) = self.tracker.lock() else {
            return true;
        };
        match tracker.last_run {
            Some(last) => last.elapsed() >= self.policy.interval_after(tracker.indeterminate_runs),
            None => true,
        }
    }

    fn bump_indeterminate_runs(&self) -> u32 {
        match self.tracker.lock() {
            Ok(mut tracker) => {
                tracker.indeterminate_runs += 1;
                tracker.last_run = Some(Instant::now());
                tracker.indeterminate_runs
            }
            Err(_) => self.policy.max_indeterminate_runs,
        }
    }

    async fn record_indeterminate(&self) {
        let runs = self.bump_indeterminate_runs();
        if runs >= self.policy.max_indeterminate_runs {
            info!(runs, "Server unreachable for every reconcile run, giving up for this session");
            self.mark_completed().await;
        } else {
            debug!(runs, "Reconcile indeterminate, will retry later");
        }
    }

    /// Inspect stored credential state without changing it.
    pub async fn diagnose(&self) -> DiagnosticResult {
        let mut result = DiagnosticResult::default();
        let keys = self.store.remaining_keys().await;
        let stored = |name: &str| keys.iter().any(|k| k.rsplit(": ").next() == Some(name));
        let has_token = stored(TOKEN_KEY);
        let has_identity = stored(IDENTITY_KEY);

        if !has_token {
            result.issues.push("No stored token".to_string());
        }
        if !has_identity {
            result.issues.push("No stored identity".to_string());
        }
        if !has_token || !has_identity {
            result.recommend("Sign in again");
        }

        let legacy: Vec<&String> = keys
            .iter()
            .filter(|k| {
                let key = k.rsplit(": ").next().unwrap_or_default();
                key != TOKEN_KEY && key != IDENTITY_KEY
            })
            .collect();
        if !legacy.is_empty() {
            result.issues.push(format!(
                "Leftover credential keys: {}",
                legacy.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
            ));
            result.recommend("Sign out to remove leftover credential keys");
        }

        match self.store.current().await {
            Some(credential) => match Claims::decode(credential.token()) {
                Ok(claims) => {
                    if let Some(subject) = claims.subject() {
                        if subject != credential.username() {
                            result.issues.push(format!(
                                "Token was issued for {} but the stored identity is {}",
                                subject,
                                credential.username()
                            ));
                            result.recommend("Sign out and sign in again");
                        }
                    }
                    if TokenValidator::is_locally_expired(&claims) {
                        result.issues.push("Token has expired".to_string());
                        result.recommend("Sign in again");
                    }
                }
                Err(e) => {
                    result.issues.push(format!("Token cannot be decoded: {}", e));
                    result.recommend("Sign out and sign in again");
                }
            },
            None if has_token || has_identity => {
                result
                    .issues
                    .push("Stored credential is partial or malformed".to_string());
                result.recommend("Sign out and sign in again");
            }
            None => {}
        }

        result
    }
}
