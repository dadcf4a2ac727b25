//! Position State: the single record of what the platform was last told.
//!
//! This is a plain data holder. It does not drive hardware and has no
//! locking of its own; the arbiter keeps it inside its critical section so
//! that reading it, swapping the active session and recording a new target
//! happen as one step.

use serde::Serialize;

use crate::error::MotionError;
use crate::position::Position;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    commanded: Position,
    active_session: Option<SessionId>,
}

impl Default for PositionState {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionState {
    /// Start at the centre with no session
    pub fn new() -> Self {
        Self {
            commanded: Position::CENTER,
            active_session: None,
        }
    }

    /// Last commanded position
    pub fn get(&self) -> Position {
        self.commanded
    }

    /// Record a new commanded position
    pub fn set(&mut self, position: Position) {
        self.commanded = position;
    }

    /// Record a new commanded position from raw angles.
    ///
    /// Fails with `OutOfRange` and leaves the state untouched if either axis is
    /// outside [-90, 90].
    pub fn set_angles(&mut self, pan: f64, tilt: f64) -> Result<(), MotionError> {
        self.commanded = Position::new(pan, tilt)?;
        Ok(())
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active_session
    }

    /// Install `id` as the active session, returning the one it replaces
    pub fn install_session(&mut self, id: SessionId, target: Position) -> Option<SessionId> {
        self.commanded = target;
        self.active_session.replace(id)
    }

    /// Clear the active session if it is still `id`.
    ///
    /// Returns false when `id` was already replaced.
    pub fn release_session(&mut self, id: SessionId) -> bool {
        if self.active_session == Some(id) {
            self.active_session = None;
            true
        } else {
            false
        }
    }
}
