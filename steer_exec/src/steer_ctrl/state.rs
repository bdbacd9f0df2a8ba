//! Implementations for the SteerCtrl state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, trace};
use serde::Serialize;
use std::time::Instant;

// Internal
use super::{Profile, SteerCtrlError, ThrottleAction, ThrottlePolicy, MAX_STEER_DEM};
use crate::pid::{ErrorTerms, PidController};
use comms_if::sim::{SteerCmd, Telemetry};
use util::{
    archive::{ArchiveError, Archived, Archiver},
    maths,
    module::State,
    session::Session,
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Steering control module state
///
/// One instance exists for each connected client.
#[derive(Default)]
pub struct SteerCtrl {
    profile: Profile,

    pid: Option<PidController>,

    throttle: ThrottlePolicy,

    mode: CtrlMode,

    /// Time of the last successfully processed record
    prev_time: Option<Instant>,

    /// Sum of the time steps of all processed records
    elapsed_s: f64,

    pub(crate) report: StatusReport,

    last_input: Option<InputData>,

    last_output: Option<OutputData>,

    arch_trace: Archiver,
}

/// Data required to initialise SteerCtrl.
#[derive(Debug, Clone)]
pub struct InitData {
    /// The tuning profile to use
    pub profile: Profile,

    /// The time the client connected, if known. When `None` the first record only seeds the
    /// clock and is not used for control.
    pub start_time: Option<Instant>,
}

/// Input data to Steering Control.
#[derive(Debug, Clone, Copy)]
pub struct InputData {
    /// Cross-track error
    pub cte: f64,

    /// Vehicle speed
    pub speed: f64,

    /// Current steering angle of the vehicle.
    ///
    /// Units: degrees
    pub steering_angle: f64,

    /// Time the record was received
    pub timestamp: Instant,
}

/// Output command from SteerCtrl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutputData {
    /// Normalised steering demand, always within [-1, 1]
    pub steering_angle: f64,

    /// Throttle demand, negative values brake
    pub throttle: f64,
}

/// Status report for SteerCtrl processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusReport {
    /// Mode before this iteration was processed
    pub mode: CtrlMode,

    /// Time step used for the update.
    ///
    /// Units: seconds
    pub dt_s: f64,

    /// Controller error terms after the update
    pub terms: ErrorTerms,

    /// Steering demand before saturation
    pub raw_steer: f64,

    /// True if the steering demand had to be saturated
    pub steer_limited: bool,

    /// Branch taken by the throttle policy
    pub throttle_action: Option<ThrottleAction>,
}

/// Row of the per-client trace archive.
#[derive(Debug, Serialize)]
struct TraceRecord {
    time_s: f64,
    cte: f64,
    speed: f64,
    steering_angle: f64,
    steer_dem: f64,
    steer_dem_deg: f64,
    throttle: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Operating mode of SteerCtrl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CtrlMode {
    /// No record has been used for control yet
    Uninitialised,

    /// At least one record has been used for control
    Steady,
}

impl Default for CtrlMode {
    fn default() -> Self {
        CtrlMode::Uninitialised
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl State for SteerCtrl {
    type InitData = InitData;
    type InitError = SteerCtrlError;

    type InputData = InputData;
    type OutputData = OutputData;
    type StatusReport = StatusReport;
    type ProcError = SteerCtrlError;

    /// Initialise the SteerCtrl module.
    ///
    /// Any previous state, including the controller's error history, is discarded.
    fn init(&mut self, init_data: Self::InitData) -> Result<(), Self::InitError> {
        init_data.profile.validate()?;

        self.pid = Some(PidController::new(
            init_data.profile.gains(),
            init_data.profile.schedule(),
            init_data.profile.integral_window,
        )?);
        self.throttle = ThrottlePolicy::from_profile(&init_data.profile);
        self.profile = init_data.profile;

        self.mode = CtrlMode::Uninitialised;
        self.prev_time = init_data.start_time;
        self.elapsed_s = 0.0;
        self.report = StatusReport::default();
        self.last_input = None;
        self.last_output = None;

        Ok(())
    }

    /// Perform one control iteration.
    ///
    /// On error no command must be sent from this iteration, [`SteerCtrl::safe_output`] gives the
    /// command to use instead.
    fn proc(
        &mut self,
        input_data: &Self::InputData,
    ) -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError> {
        self.report = StatusReport {
            mode: self.mode,
            ..Default::default()
        };

        let pid = self.pid.as_mut().ok_or(SteerCtrlError::NotInit)?;

        if !input_data.cte.is_finite() || !input_data.speed.is_finite() {
            return Err(SteerCtrlError::NonFiniteInput {
                cte: input_data.cte,
                speed: input_data.speed,
            });
        }

        let prev_time = match self.prev_time {
            Some(t) => t,
            None => {
                self.prev_time = Some(input_data.timestamp);
                return Err(SteerCtrlError::ClockNotSeeded);
            }
        };

        // Negative if the record is older than the previous one, which the controller rejects
        let dt = match input_data.timestamp.checked_duration_since(prev_time) {
            Some(d) => d.as_secs_f64(),
            None => -(prev_time - input_data.timestamp).as_secs_f64(),
        };
        self.report.dt_s = dt;

        // Must be read before the update, afterwards it is equal to the new error
        let prev_error = pid.prev_error();

        // Kept so the update can be undone if it gives an unusable output
        let restore = pid.clone();

        self.report.terms = pid.observe(input_data.cte, dt)?;

        let raw_steer = -pid.command(input_data.speed);
        if !raw_steer.is_finite() {
            *pid = restore;
            self.report.terms = pid.terms();
            return Err(SteerCtrlError::NonFiniteOutput(raw_steer));
        }
        let (steer, steer_limited) = maths::saturate(raw_steer, MAX_STEER_DEM);
        self.report.raw_steer = raw_steer;
        self.report.steer_limited = steer_limited;

        let (throttle, action) = self
            .throttle
            .decide(prev_error, input_data.cte, input_data.speed);
        self.report.throttle_action = Some(action);

        self.prev_time = Some(input_data.timestamp);
        self.elapsed_s += dt;

        if self.mode == CtrlMode::Uninitialised {
            debug!("First telemetry record processed, SteerCtrl is now steady");
            self.mode = CtrlMode::Steady;
        }

        let output = OutputData {
            steering_angle: steer,
            throttle,
        };

        trace!(
            "SteerCtrl: cte = {:.4}, dt = {:.4} s, terms = {:?}, steer = {:.4}, throttle = {:.2}",
            input_data.cte,
            dt,
            self.report.terms,
            steer,
            throttle
        );

        self.last_input = Some(*input_data);
        self.last_output = Some(output);

        Ok((output, self.report))
    }
}

impl Archived for SteerCtrl {
    /// Write the trace of the last processed record.
    ///
    /// Does nothing if archiving is not enabled or no record has been processed yet.
    fn write(&mut self) -> Result<(), ArchiveError> {
        if !self.arch_trace.is_init() {
            return Ok(());
        }

        let (input, output) = match (self.last_input, self.last_output) {
            (Some(i), Some(o)) => (i, o),
            _ => return Ok(()),
        };

        let scale = self.profile.steer_angle_scale_deg;

        self.arch_trace.serialise(TraceRecord {
            time_s: self.elapsed_s,
            cte: input.cte,
            speed: input.speed,
            steering_angle: input.steering_angle,
            steer_dem: output.steering_angle,
            steer_dem_deg: maths::lin_map(
                (-MAX_STEER_DEM, MAX_STEER_DEM),
                (-scale, scale),
                output.steering_angle,
            ),
            throttle: output.throttle,
        })
    }
}

impl SteerCtrl {
    /// Start writing a trace of every processed record to the given session-relative archive
    /// path.
    pub fn enable_archive(&mut self, session: &Session, path: &str) -> Result<(), ArchiveError> {
        self.arch_trace = Archiver::from_path(session, path)?;

        Ok(())
    }

    /// The command to send when an iteration is rejected.
    ///
    /// Holds the last steering demand and cuts the throttle.
    pub fn safe_output(&self) -> OutputData {
        OutputData {
            steering_angle: self.last_output.map(|o| o.steering_angle).unwrap_or(0.0),
            throttle: 0.0,
        }
    }

    pub fn mode(&self) -> CtrlMode {
        self.mode
    }

    /// Total time covered by the processed records.
    ///
    /// Units: seconds
    pub fn elapsed_s(&self) -> f64 {
        self.elapsed_s
    }

    pub fn pid(&self) -> Option<&PidController> {
        self.pid.as_ref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

impl InputData {
    /// Build the input data from a telemetry record received at `timestamp`.
    pub fn from_telemetry(telem: &Telemetry, timestamp: Instant) -> Self {
        Self {
            cte: telem.cte,
            speed: telem.speed,
            steering_angle: telem.steering_angle,
            timestamp,
        }
    }
}

impl From<OutputData> for SteerCmd {
    fn from(o: OutputData) -> Self {
        SteerCmd {
            steering_angle: o.steering_angle,
            throttle: o.throttle,
        }
    }
}
