//! Flow Controller - Install State Machine
//!
//! Sequences one installation attempt:
//!
//! ```text
//! Idle -> AwaitingFileSelection -> AwaitingCredential -> Staging
//!      -> Installing -> Finalizing -> Succeeded | Failed -> Idle
//! ```
//!
//! The controller owns the chosen request and the credential broker; the
//! stager, runner and registrar only ever see borrowed handles. Whatever the
//! outcome, the staged files are rolled back and the session is ended before
//! control returns to `Idle`. State changes are published on a `watch`
//! channel for front-ends.

use crate::credentials::{AuthError, CredentialBroker};
use crate::registrar::{self, PinOutcome};
use crate::runner::{CommandRunner, ExecutionStatus, OutputLog};
use crate::stager::{BuildStager, StageError};
use dvr_common::config::{BuildConfig, InstallerConfig};
use dvr_common::request::{InstallRequest, RequestError};
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowState {
    Idle,
    AwaitingFileSelection,
    AwaitingCredential,
    Staging,
    Installing,
    Finalizing,
    Succeeded,
    Failed,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("An installation is already in progress ({0:?})")]
    Busy(FlowState),

    #[error("Cannot {step} while {state:?}")]
    UnexpectedStep { step: &'static str, state: FlowState },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Outcome of one attempt; the full log stays available regardless of result
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub product: String,
    pub archive: PathBuf,
    pub version: Option<String>,
    pub succeeded: bool,
    /// Runner classification, absent if the build never started
    pub status: Option<ExecutionStatus>,
    pub detail: Option<String>,
    pub warnings: Vec<String>,
    pub log: String,
}

impl InstallReport {
    /// User-facing result line
    pub fn banner(&self) -> String {
        if self.succeeded {
            format!("Successfully installed {}!", self.product)
        } else {
            format!(
                "Installation failed: {}",
                self.detail.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

pub struct InstallFlow {
    config: InstallerConfig,
    broker: CredentialBroker,
    stager: BuildStager,
    runner: CommandRunner,
    request: Option<InstallRequest>,
    state_tx: watch::Sender<FlowState>,
}

impl InstallFlow {
    pub fn new(config: InstallerConfig) -> Result<Self, FlowError> {
        let (state_tx, _) = watch::channel(FlowState::Idle);

        Ok(Self {
            broker: CredentialBroker::new(config.escalation.clone()),
            stager: BuildStager::new(&config)?,
            runner: CommandRunner::new(&config.build.shell),
            request: None,
            state_tx,
            config,
        })
    }

    pub fn state(&self) -> FlowState {
        *self.state_tx.borrow()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state_tx.subscribe()
    }

    /// The file chosen for the current attempt
    pub fn request(&self) -> Option<&InstallRequest> {
        self.request.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.broker.is_active()
    }

    fn set_state(&self, state: FlowState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Flow state {:?} -> {:?}", previous, state);
        }
    }

    /// The user asked to install: wait for a file
    pub fn start(&mut self) -> Result<(), FlowError> {
        match self.state() {
            FlowState::Idle => {
                self.set_state(FlowState::AwaitingFileSelection);
                Ok(())
            }
            FlowState::AwaitingFileSelection => Ok(()),
            state => Err(FlowError::Busy(state)),
        }
    }

    /// Accept the chosen archive.
    ///
    /// Rejected with `Busy` unless idle or waiting for a file. Skips the
    /// credential step when a session is already active.
    pub fn select_file(&mut self, path: impl Into<PathBuf>) -> Result<FlowState, FlowError> {
        match self.state() {
            FlowState::Idle | FlowState::AwaitingFileSelection => {}
            state => return Err(FlowError::Busy(state)),
        }

        let request = InstallRequest::new(path, &self.config.product)?;
        tracing::info!(
            "Selected {:?} ({})",
            request.source_archive(),
            request.product_name()
        );
        self.request = Some(request);

        let next = if self.broker.is_active() {
            FlowState::Staging
        } else {
            FlowState::AwaitingCredential
        };
        self.set_state(next);
        Ok(next)
    }

    /// Validate a password.
    ///
    /// While awaiting credentials, success moves on to `Staging` and an
    /// `AuthError` keeps the chosen file so the caller can re-prompt. Before
    /// a file is chosen this only opens the session, so the later file
    /// selection skips the prompt.
    pub async fn submit_password(&mut self, password: Zeroizing<String>) -> Result<(), FlowError> {
        match self.state() {
            FlowState::AwaitingCredential => {
                self.broker.begin_session(password).await?;
                self.set_state(FlowState::Staging);
                Ok(())
            }
            FlowState::Idle | FlowState::AwaitingFileSelection => {
                self.broker.begin_session(password).await?;
                Ok(())
            }
            state => Err(FlowError::UnexpectedStep {
                step: "accept a password",
                state,
            }),
        }
    }

    /// Abandon the attempt before anything was staged
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        match self.state() {
            FlowState::Idle
            | FlowState::AwaitingFileSelection
            | FlowState::AwaitingCredential
            | FlowState::Staging => {
                self.request = None;
                self.broker.end_session();
                self.set_state(FlowState::Idle);
                Ok(())
            }
            state => Err(FlowError::Busy(state)),
        }
    }

    /// Run the attempt to completion
    pub async fn run(&mut self) -> Result<InstallReport, FlowError> {
        self.run_with(|_| {}).await
    }

    /// Run the attempt, handing the live build log to `observer` once the
    /// build starts.
    ///
    /// Only errors for calling this in the wrong state; every outcome of the
    /// attempt itself is in the report.
    pub async fn run_with<F>(&mut self, observer: F) -> Result<InstallReport, FlowError>
    where
        F: FnOnce(&OutputLog),
    {
        let state = self.state();
        let request = match (state, self.request.take()) {
            (FlowState::Staging, Some(request)) => request,
            (_, request) => {
                self.request = request;
                return Err(FlowError::UnexpectedStep {
                    step: "start the installation",
                    state,
                });
            }
        };

        tracing::info!("Installing {}...", request.product_name());
        let report = self.install(&request, observer).await;

        self.broker.end_session();
        self.set_state(FlowState::Idle);
        Ok(report)
    }

    async fn install<F>(&self, request: &InstallRequest, observer: F) -> InstallReport
    where
        F: FnOnce(&OutputLog),
    {
        let mut report = InstallReport {
            product: request.product_name().to_string(),
            archive: request.source_archive().to_path_buf(),
            version: None,
            succeeded: false,
            status: None,
            detail: None,
            warnings: Vec::new(),
            log: String::new(),
        };

        // prepare cleans up after itself on failure
        let mut stage = match self.stager.prepare(request) {
            Ok(stage) => stage,
            Err(e) => {
                tracing::error!("Staging failed: {}", e);
                report.detail = Some(e.to_string());
                self.set_state(FlowState::Failed);
                return report;
            }
        };
        report.version = Some(stage.recipe_version().to_string());

        let escalation = match self.broker.escalation_capability() {
            Ok(escalation) => escalation,
            Err(e) => {
                report.detail = Some(e.to_string());
                self.set_state(FlowState::Failed);
                report.warnings.extend(stage.rollback());
                return report;
            }
        };

        let command = compose_install_command(
            &self.config.build,
            stage.staging_dir(),
            escalation.wrapper_path(),
        );
        tracing::debug!("Build command: {}", command);

        self.set_state(FlowState::Installing);
        let handle = self.runner.execute(&command, &escalation);
        let log = handle.log().clone();
        observer(&log);
        let status = handle.wait().await;

        if status.is_success() {
            self.set_state(FlowState::Finalizing);
            let package = &self.config.recipes.for_variant(request.variant()).package;
            match registrar::pin(&self.config.pin, package, &escalation).await {
                Ok(PinOutcome::Disabled) => tracing::debug!("Package pinning disabled"),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to pin {}: {}", package, e);
                    report
                        .warnings
                        .push(format!("Failed to pin {}: {}", package, e));
                }
            }
            report.succeeded = true;
            tracing::info!("Successfully installed {}!", report.product);
            self.set_state(FlowState::Succeeded);
        } else {
            report.detail = status.detail();
            tracing::error!("Installation failed: {}", report.detail.as_deref().unwrap_or_default());
            self.set_state(FlowState::Failed);
        }
        report.status = Some(status);

        report.warnings.extend(stage.rollback());
        report.log = log.snapshot();
        report
    }
}

fn quote(arg: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(arg))
}

fn quote_all(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compose the shell line run inside `staging`.
///
/// Repository refresh and dependency installs go through the escalation
/// wrapper; the build itself runs unprivileged and finds the wrapper via
/// `auth_env`.
pub fn compose_install_command(build: &BuildConfig, staging: &Path, wrapper: &Path) -> String {
    let staging = staging.to_string_lossy();
    let wrapper = wrapper.to_string_lossy();
    let wrapper = quote(&wrapper);

    let mut steps = vec![format!("cd {}", quote(&staging))];

    if !build.auth_env.is_empty() {
        steps.push(format!("export {}={}", build.auth_env, wrapper));
    }
    if !build.refresh.is_empty() {
        steps.push(format!("{} {}", wrapper, quote_all(&build.refresh)));
    }
    if !build.dependencies.is_empty() {
        steps.push(format!(
            "{} {} {}",
            wrapper,
            quote_all(&build.dependency_install),
            quote_all(&build.dependencies)
        ));
    }
    steps.push(quote_all(&build.build));

    steps.join(" && ")
}
