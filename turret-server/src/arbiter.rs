//! Motion Arbiter: the single owner of the actuator and the Position State.
//!
//! Every motion request, whatever its source, goes through one critical
//! section that cancels the running session, records the new target and
//! installs the new session. Last writer wins.
//!
//! # Architecture
//!
//! ```text
//!  manual /set ──┐
//!  sweep tick ───┼──▶ Arbiter::request_motion ──▶ hold loop (tokio task)
//!  tracking ─────┘        │ (std Mutex)                │
//!                         ▼                            ▼
//!                  PositionState              spawn_blocking(move_to)
//!                  active session             Actuator (std Mutex)
//! ```
//!
//! The hold loop checks its cancellation token while holding the actuator
//! lock, so once a newer request has been accepted the superseded loop can
//! not start another command.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use turret_core::{
    Actuator, ActuatorError, FaultVerdict, HoldPolicy, HoldTracker, MotionError, MotionRequest,
    MotionSource, Position, PositionState, SessionId, SessionState,
};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Published on the arbiter's event bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MotionEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session: SessionId,
        target: Position,
        source: MotionSource,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session: SessionId,
        outcome: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        fault: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HardwareFault {
        session: SessionId,
        consecutive: u32,
        message: String,
    },
}

/// Live view of one session, shared between its loop and its handles
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub commands: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl SessionStatus {
    fn running() -> Self {
        Self {
            state: SessionState::Running,
            commands: 0,
            fault: None,
        }
    }
}

/// Move a session into a terminal state unless it already is in one
fn finish(status: &watch::Sender<SessionStatus>, state: SessionState, fault: Option<String>) -> bool {
    status.send_if_modified(|s| {
        if s.state.is_terminal() {
            return false;
        }
        s.state = state;
        if fault.is_some() {
            s.fault = fault;
        }
        true
    })
}

/// Returned by [`Arbiter::request_motion`]; query or cancel the session with it
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    target: Position,
    source: MotionSource,
    deadline: Instant,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> Position {
        self.target
    }

    pub fn source(&self) -> MotionSource {
        self.source
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Wait until the session reaches a terminal state
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.status.clone();
        let done = match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(s) => Some(s.clone()),
            Err(_) => None,
        };
        done.unwrap_or_else(|| rx.borrow().clone())
    }

    /// Wait at most `timeout` for a state change; returns the current status
    pub async fn changed_within(&mut self, timeout: Duration) -> SessionStatus {
        let _ = tokio::time::timeout(timeout, self.status.changed()).await;
        self.status.borrow_and_update().clone()
    }
}

/// Summary of the active session for APIs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub target: Position,
    pub source: MotionSource,
    pub remaining_ms: u64,
    pub commands: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbiterSnapshot {
    pub position: Position,
    pub active_session: Option<SessionInfo>,
}

/// Counters for the diagnostics endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorHealth {
    pub driver: String,
    pub commands: u64,
    pub faults: u64,
    pub last_fault: Option<String>,
    pub last_fault_at: Option<DateTime<Utc>>,
    pub last_commanded: Option<Position>,
}

struct ActiveSession {
    id: SessionId,
    target: Position,
    source: MotionSource,
    deadline: Instant,
    token: CancellationToken,
    status: watch::Sender<SessionStatus>,
}

struct ArbiterState {
    position: PositionState,
    active: Option<ActiveSession>,
    next_id: u64,
}

struct ArbiterInner {
    state: Mutex<ArbiterState>,
    actuator: Arc<Mutex<Box<dyn Actuator>>>,
    policy: HoldPolicy,
    events: broadcast::Sender<MotionEvent>,
    health: Mutex<ActuatorHealth>,
}

#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<ArbiterInner>,
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Arbiter {{ policy: {:?} }}", self.inner.policy)
    }
}

impl Arbiter {
    pub fn new(actuator: Box<dyn Actuator>, policy: HoldPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let health = ActuatorHealth {
            driver: actuator.name().to_string(),
            ..Default::default()
        };
        Arbiter {
            inner: Arc::new(ArbiterInner {
                state: Mutex::new(ArbiterState {
                    position: PositionState::new(),
                    active: None,
                    next_id: 1,
                }),
                actuator: Arc::new(Mutex::new(actuator)),
                policy,
                events,
                health: Mutex::new(health),
            }),
        }
    }

    pub fn policy(&self) -> HoldPolicy {
        self.inner.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.inner.events.subscribe()
    }

    /// Last commanded position
    pub fn position(&self) -> Position {
        self.lock_state().position.get()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.lock_state().position.active_session()
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        let state = self.lock_state();
        ArbiterSnapshot {
            position: state.position.get(),
            active_session: state.active.as_ref().map(|a| SessionInfo {
                id: a.id,
                target: a.target,
                source: a.source,
                remaining_ms: a.deadline.saturating_duration_since(Instant::now()).as_millis()
                    as u64,
                commands: a.status.borrow().commands,
            }),
        }
    }

    pub fn health(&self) -> ActuatorHealth {
        self.lock_health().clone()
    }

    /// Accept a request: supersede the running session and start a new one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_motion(&self, request: MotionRequest) -> SessionHandle {
        let token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SessionStatus::running());
        let started = Instant::now();
        let deadline = started + request.duration;

        let (id, superseded) = {
            let mut state = self.lock_state();
            let id = SessionId(state.next_id);
            state.next_id += 1;

            let superseded = state.active.take().map(|old| {
                finish(&old.status, SessionState::Superseded, None);
                old.token.cancel();
                old.id
            });
            state.position.install_session(id, request.target);
            state.active = Some(ActiveSession {
                id,
                target: request.target,
                source: request.source,
                deadline,
                token: token.clone(),
                status: status_tx.clone(),
            });
            (id, superseded)
        };

        if let Some(old) = superseded {
            log::debug!("Session {} superseded by {}", old, id);
        }
        log::info!(
            "Session {} started: {} for {:?} ({})",
            id,
            request.target,
            request.duration,
            request.source
        );
        let _ = self.inner.events.send(MotionEvent::SessionStarted {
            session: id,
            target: request.target,
            source: request.source,
            duration_ms: request.duration.as_millis() as u64,
        });

        let inner = self.inner.clone();
        let target = request.target;
        tokio::spawn(async move {
            hold_loop(inner, id, target, started, request.duration, token, status_tx).await;
        });

        SessionHandle {
            id,
            target: request.target,
            source: request.source,
            deadline,
            status: status_rx,
        }
    }

    /// Validate raw angles and request motion to them
    pub fn request_angles(
        &self,
        pan: f64,
        tilt: f64,
        duration: Duration,
        source: MotionSource,
    ) -> Result<SessionHandle, MotionError> {
        let request = MotionRequest::from_angles(pan, tilt, duration, source)?;
        Ok(self.request_motion(request))
    }

    /// Hold (0, 0) for `duration`
    pub fn reset(&self, duration: Duration) -> SessionHandle {
        self.request_motion(MotionRequest::reset(duration))
    }

    /// Cancel the session behind `handle`.
    ///
    /// Idempotent; returns false if the handle is stale.
    pub fn cancel(&self, handle: &SessionHandle) -> bool {
        self.cancel_session(handle.id)
    }

    pub fn cancel_session(&self, id: SessionId) -> bool {
        let cancelled = {
            let mut state = self.lock_state();
            match state.active.take_if(|a| a.id == id) {
                Some(active) => {
                    state.position.release_session(id);
                    finish(&active.status, SessionState::Cancelled, None);
                    active.token.cancel();
                    true
                }
                None => false,
            }
        };
        if cancelled {
            log::info!("Session {} cancelled", id);
        }
        cancelled
    }

    /// Stop the running session and de-energise the actuator
    pub async fn shutdown(&self) {
        if let Some(id) = self.active_session() {
            self.cancel_session(id);
        }
        let actuator = self.inner.actuator.clone();
        let r = tokio::task::spawn_blocking(move || {
            actuator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release()
        })
        .await;
        match r {
            Ok(Ok(())) => log::debug!("Actuator released"),
            Ok(Err(e)) => log::warn!("Cannot release actuator: {}", e),
            Err(e) => log::warn!("Actuator release task failed: {}", e),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ArbiterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_health(&self) -> MutexGuard<'_, ActuatorHealth> {
        self.inner.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ArbiterInner {
    /// Issue one actuator command, unless `token` was cancelled first.
    ///
    /// `None` means the command was skipped.
    async fn command(
        &self,
        target: Position,
        token: &CancellationToken,
    ) -> Option<Result<(), ActuatorError>> {
        let actuator = self.actuator.clone();
        let token = token.clone();
        let r = tokio::task::spawn_blocking(move || {
            let mut actuator = actuator.lock().unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                return None;
            }
            Some(actuator.move_to(target))
        })
        .await
        .unwrap_or_else(|e| {
            Some(Err(ActuatorError::Device(format!(
                "actuator task failed: {}",
                e
            ))))
        });

        if let Some(result) = &r {
            let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            health.commands += 1;
            match result {
                Ok(()) => health.last_commanded = Some(target),
                Err(e) => {
                    health.faults += 1;
                    health.last_fault = Some(e.to_string());
                    health.last_fault_at = Some(Utc::now());
                }
            }
        }
        r
    }

    fn release(&self, id: SessionId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.active.as_ref().is_some_and(|a| a.id == id) {
            state.active = None;
            state.position.release_session(id);
        }
    }
}

async fn hold_loop(
    inner: Arc<ArbiterInner>,
    id: SessionId,
    target: Position,
    started: Instant,
    duration: Duration,
    token: CancellationToken,
    status: watch::Sender<SessionStatus>,
) {
    let mut tracker = HoldTracker::new(started, duration, inner.policy);
    let mut fault = None;

    loop {
        let Some(result) = inner.command(target, &token).await else {
            break;
        };
        match result {
            Ok(()) => {
                tracker.record_success();
                log::trace!("Session {} asserted {}", id, target);
            }
            Err(e) => {
                let message = e.to_string();
                let verdict = tracker.record_fault(message.clone());
                let consecutive = match verdict {
                    FaultVerdict::Continue { consecutive } => {
                        log::warn!("Session {}: {} ({} in a row)", id, message, consecutive);
                        consecutive
                    }
                    FaultVerdict::GiveUp { consecutive } => {
                        log::error!(
                            "Session {}: giving up after {} consecutive faults: {}",
                            id,
                            consecutive,
                            message
                        );
                        consecutive
                    }
                };
                let _ = inner.events.send(MotionEvent::HardwareFault {
                    session: id,
                    consecutive,
                    message: message.clone(),
                });
                if let FaultVerdict::GiveUp { .. } = verdict {
                    fault = Some(message);
                }
            }
        }
        let commands = tracker.commands();
        status.send_modify(|s| s.commands = commands);
        if fault.is_some() {
            break;
        }

        let Some(wait) = tracker.next_wait(Instant::now()) else {
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    // Superseded or cancelled sessions were already finished by the arbiter
    finish(&status, SessionState::Expired, fault);
    inner.release(id);

    let end = status.borrow().clone();
    log::info!("Session {} {} after {} commands", id, end.state, end.commands);
    let _ = inner.events.send(MotionEvent::SessionEnded {
        session: id,
        outcome: end.state,
        fault: end.fault,
    });
}
