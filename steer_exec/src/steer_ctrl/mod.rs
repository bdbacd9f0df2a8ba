//! # Steering control module
//!
//! Steering control runs one control iteration for every telemetry record received from a
//! client. The cross-track error is passed through a PID controller, the output of which is
//! negated (a positive error needs steering in the negative direction) and saturated to the
//! steering actuator's range. The throttle is decided separately by [`ThrottlePolicy`].
//!
//! The time step for each iteration is the wall-clock time between the record and the previous
//! record which was successfully processed for the same client.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod params;
pub mod state;
pub mod throttle;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use params::{Params, Profile};
pub use state::*;
pub use throttle::{ThrottleAction, ThrottlePolicy};

use crate::pid::PidError;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Magnitude of a full scale steering demand.
pub const MAX_STEER_DEM: f64 = 1.0;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible errors that can occur during SteerCtrl operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SteerCtrlError {
    #[error("SteerCtrl has not been initialised")]
    NotInit,

    #[error("Invalid tuning profile: {0}")]
    InvalidProfile(ParamsError),

    #[error("Telemetry contains non-finite values (cte = {cte}, speed = {speed})")]
    NonFiniteInput { cte: f64, speed: f64 },

    #[error("No previous record time is known, this record has been used to seed the clock")]
    ClockNotSeeded,

    #[error("Controller rejected the update: {0}")]
    Pid(PidError),

    #[error("Controller produced a non-finite output ({0})")]
    NonFiniteOutput(f64),
}

/// Errors in the steering control parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("No profile named {0:?}, available profiles are {1:?}")]
    UnknownProfile(String, Vec<String>),

    #[error("{0}")]
    InvalidProfile(String),
}

impl From<PidError> for SteerCtrlError {
    fn from(e: PidError) -> Self {
        SteerCtrlError::Pid(e)
    }
}

impl From<ParamsError> for SteerCtrlError {
    fn from(e: ParamsError) -> Self {
        SteerCtrlError::InvalidProfile(e)
    }
}
