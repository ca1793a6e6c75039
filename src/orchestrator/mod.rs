//! Background control loop driving unlock sessions from sign-in stages.
//!
//! ```text
//! WaitingForTrigger ──CollectingCredential──▶ SelectingDevice
//!        ▲                                          │ consent, service record
//!        │ no device connects                       ▼
//!        └────────────────────────────────────  Connecting
//!                                                   │ REQUEST_NONCE sent
//!                                                   ▼
//!                                            NonceRequested ──session ends──▶ Finishing
//!
//! StoppingAuthentication / exit signal / stage stream closed ──▶ Done
//! ```
//!
//! One session runs at a time. The receive loop of that session is its own
//! task; the orchestrator only waits on it. Device selection and connect run
//! inline but give way to the exit signal and `StoppingAuthentication`.

mod registration;

pub use registration::register_device;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::auth::{AuthStage, Authenticator, StageEvent};
use crate::config::Config;
use crate::device::{DeviceCatalog, NotificationMessage, Notifier};
use crate::error::{FailureKind, ProximityError, Result};
use crate::protocol::{Dispatcher, SessionOutcome, SessionSelection};
use crate::transport::{self, Connection, Connector, FlowSignal};

/// Where the orchestrator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Waiting for the sign-in UI to ask for a credential
    WaitingForTrigger,
    /// Walking the paired devices
    SelectingDevice,
    /// Opening the stream to a device
    Connecting,
    /// `REQUEST_NONCE` sent, session running
    NonceRequested,
    /// Session ended, waiting for the host to stop
    Finishing,
    /// Loop exited
    Done,
}

/// What one [`Orchestrator::run`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Device chosen at startup
    pub selection: Option<SessionSelection>,
    /// Outcome of every session, in order
    pub outcomes: Vec<SessionOutcome>,
}

impl RunSummary {
    /// Whether any session authenticated
    pub fn authenticated(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, SessionOutcome::Authenticated { .. }))
    }
}

enum StageAction {
    Continue,
    Started(JoinHandle<SessionOutcome>),
    Exit,
}

/// Reacts to sign-in stages and sequences unlock sessions.
pub struct Orchestrator {
    authenticator: Arc<dyn Authenticator>,
    catalog: Arc<dyn DeviceCatalog>,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn Connector>,
    config: Config,
    state: OrchestratorState,
    selection: Option<SessionSelection>,
    exit: FlowSignal,
    ready: FlowSignal,
}

impl Orchestrator {
    /// Create an orchestrator over the host capabilities.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        catalog: Arc<dyn DeviceCatalog>,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn Connector>,
        config: Config,
    ) -> Self {
        Self {
            authenticator,
            catalog,
            notifier,
            connector,
            config,
            state: OrchestratorState::WaitingForTrigger,
            selection: None,
            exit: FlowSignal::new(),
            ready: FlowSignal::new(),
        }
    }

    /// Completing this signal stops [`run`](Self::run).
    pub fn exit_signal(&self) -> FlowSignal {
        self.exit.clone()
    }

    /// Completed once [`run`](Self::run) has subscribed to stage events.
    pub fn ready_signal(&self) -> FlowSignal {
        self.ready.clone()
    }

    /// Current state
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Run until the host stops authentication or the exit signal fires.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let devices = self
            .authenticator
            .list_registered_devices(self.config.session.startup_scope)
            .await?;
        let Some(first) = devices.first() else {
            tracing::info!("No registered companion device, nothing to do");
            self.state = OrchestratorState::Done;
            self.ready.complete();
            return Ok(RunSummary::default());
        };

        let selection = SessionSelection::from(first);
        tracing::info!(
            device_id = %selection.device_id,
            name = %selection.device_name,
            "Using first registered device"
        );
        self.selection = Some(selection);

        let mut stages = self.authenticator.subscribe_stages();
        self.ready.complete();

        let mut session: Option<JoinHandle<SessionOutcome>> = None;
        let mut outcomes = Vec::new();

        loop {
            tokio::select! {
                () = self.exit.completed() => {
                    tracing::info!("Exit requested");
                    break;
                }
                outcome = join_session(&mut session) => {
                    session = None;
                    self.state = OrchestratorState::Finishing;
                    outcomes.push(outcome);
                }
                event = stages.recv() => match event {
                    Ok(event) => match self.on_stage(event, session.is_some(), &mut stages).await {
                        StageAction::Continue => {}
                        StageAction::Started(handle) => session = Some(handle),
                        StageAction::Exit => break,
                    },
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Stage events lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Stage stream closed");
                        break;
                    }
                },
            }
        }
        drop(stages);

        if let Some(handle) = session {
            let bound = self.config.session.session_timeout();
            outcomes.push(await_bounded(handle, bound).await);
        }

        self.state = OrchestratorState::Done;
        Ok(RunSummary {
            selection: self.selection.clone(),
            outcomes,
        })
    }

    async fn on_stage(
        &mut self,
        event: StageEvent,
        session_running: bool,
        stages: &mut broadcast::Receiver<StageEvent>,
    ) -> StageAction {
        tracing::debug!(stage = ?event.stage, scenario = ?event.scenario, "Authentication stage");

        match event.stage {
            AuthStage::WaitingForUserConfirmation => {
                let name = self
                    .selection
                    .as_ref()
                    .map(|s| s.device_name.clone())
                    .unwrap_or_default();
                if let Err(e) = self
                    .notifier
                    .show(&name, NotificationMessage::LookingForDevice)
                    .await
                {
                    tracing::warn!("Notification failed: {}", e);
                }
                StageAction::Continue
            }
            AuthStage::CollectingCredential if session_running => {
                tracing::debug!("Session already running");
                StageAction::Continue
            }
            AuthStage::CollectingCredential => {
                let exit = self.exit.clone();
                let attempt = tokio::select! {
                    biased;
                    () = exit.completed() => {
                        tracing::info!("Exit requested while connecting");
                        return StageAction::Exit;
                    }
                    () = stop_requested(stages) => {
                        tracing::info!("Authentication stopped while connecting");
                        return StageAction::Exit;
                    }
                    attempt = self.perform_authentication() => attempt,
                };
                self.on_attempt(attempt)
            }
            AuthStage::StoppingAuthentication => StageAction::Exit,
            _ => StageAction::Continue,
        }
    }

    fn on_attempt(&mut self, attempt: Result<Option<JoinHandle<SessionOutcome>>>) -> StageAction {
        match attempt {
            Ok(Some(handle)) => StageAction::Started(handle),
            Ok(None) => {
                tracing::warn!("No paired device offered the proximity service");
                StageAction::Continue
            }
            Err(e) => {
                tracing::error!("Authentication could not start: {}", e);
                self.state = OrchestratorState::WaitingForTrigger;
                StageAction::Continue
            }
        }
    }

    /// Find the first usable paired device, connect, send `REQUEST_NONCE` and
    /// start the session task.
    pub async fn perform_authentication(
        &mut self,
    ) -> Result<Option<JoinHandle<SessionOutcome>>> {
        self.state = OrchestratorState::SelectingDevice;
        let transport_config = &self.config.transport;

        for device in self.catalog.paired_devices().await? {
            if self.catalog.check_consent(&device).await?.is_denied() {
                tracing::debug!(device = %device.name, "Consent denied, skipping");
                continue;
            }

            let Some(service) = self
                .catalog
                .resolve_service(&device, transport_config.service_uuid)
                .await?
            else {
                tracing::debug!(device = %device.name, "Service not advertised");
                continue;
            };

            if let Err(e) = service.record.validate(transport_config.min_service_version) {
                tracing::warn!(device = %device.name, "Skipping device: {}", e);
                continue;
            }

            self.state = OrchestratorState::Connecting;
            let connection =
                match transport::connect(self.connector.as_ref(), &service.endpoint, transport_config)
                    .await
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        tracing::warn!(device = %device.name, "Connect failed: {}", e);
                        continue;
                    }
                };

            let mut dispatcher = Dispatcher::new(
                Arc::clone(&self.authenticator),
                &connection,
                self.selection.clone(),
                self.config.session.attempt_ttl(),
            );
            dispatcher.request_nonce().await?;
            self.state = OrchestratorState::NonceRequested;

            let bound = self.config.session.session_timeout();
            return Ok(Some(tokio::spawn(run_session(connection, dispatcher, bound))));
        }

        self.state = OrchestratorState::WaitingForTrigger;
        Ok(None)
    }
}

/// Run a connection's receive loop under `session_timeout` and report how the
/// session ended.
pub async fn run_session(
    connection: Connection,
    mut dispatcher: Dispatcher,
    session_timeout: Duration,
) -> SessionOutcome {
    let flow = connection.flow();
    let sender = connection.sender();

    let result = match tokio::time::timeout(session_timeout, connection.run(&mut dispatcher)).await {
        Ok(result) => result,
        Err(_) => {
            flow.complete();
            sender.close().await;
            Err(ProximityError::SessionTimeout(session_timeout))
        }
    };

    let outcome = dispatcher.finish(result);
    if outcome.is_success() {
        tracing::info!(?outcome, "Session finished");
    } else {
        tracing::warn!(?outcome, "Session finished");
    }
    outcome
}

/// Resolves once the host stops authentication or the stage stream closes.
async fn stop_requested(stages: &mut broadcast::Receiver<StageEvent>) {
    loop {
        match stages.recv().await {
            Ok(event) if event.stage == AuthStage::StoppingAuthentication => return,
            Ok(event) => tracing::debug!(stage = ?event.stage, "Stage ignored while connecting"),
            Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "Stage events lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn join_session(handle: &mut Option<JoinHandle<SessionOutcome>>) -> SessionOutcome {
    match handle {
        Some(handle) => handle.await.unwrap_or_else(|e| SessionOutcome::Failed {
            kind: FailureKind::Internal,
            reason: format!("session task failed: {e}"),
        }),
        None => std::future::pending().await,
    }
}

async fn await_bounded(mut handle: JoinHandle<SessionOutcome>, bound: Duration) -> SessionOutcome {
    match tokio::time::timeout(bound, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => SessionOutcome::Failed {
            kind: FailureKind::Internal,
            reason: format!("session task failed: {e}"),
        },
        Err(_) => {
            handle.abort();
            SessionOutcome::from_error(&ProximityError::SessionTimeout(bound))
        }
    }
}
