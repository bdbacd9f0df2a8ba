//! # PID controller
//!
//! A PID controller driven by a variable time step. Two things set it apart from a textbook
//! controller:
//!
//! - The integral term is the sum of the last `W` time-weighted error samples rather than the sum
//!   of every sample ever seen. A sustained one-sided error can therefore only build up a bounded
//!   integral, and once the error goes away the integral is completely forgotten after `W`
//!   further samples.
//! - The proportional and derivative gains are scheduled on speed. At higher speed the same
//!   steering correction has a larger lateral effect, so the proportional gain is reduced and the
//!   derivative gain increased linearly with speed.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Default number of samples held in the integral window.
pub const DEFAULT_INTEGRAL_WINDOW: usize = 20;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The three PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain
    pub k_p: f64,

    /// Integral gain
    pub k_i: f64,

    /// Derivative gain
    pub k_d: f64,
}

/// Linear speed scheduling of the proportional and derivative gains.
///
/// The effective gains are `k_p - k_p_per_speed * speed` and `k_d + k_d_per_speed * speed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedSchedule {
    /// Reduction in proportional gain per unit of speed
    pub k_p_per_speed: f64,

    /// Increase in derivative gain per unit of speed
    pub k_d_per_speed: f64,
}

/// The error terms of the controller after an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ErrorTerms {
    /// The most recent error
    pub proportional: f64,

    /// Sum of the time-weighted errors in the integral window
    pub integral: f64,

    /// Rate of change of the error over the last update
    pub derivative: f64,
}

/// A PID controller with a bounded integral window and speed scheduled gains.
#[derive(Debug, Clone, Serialize)]
pub struct PidController {
    gains: PidGains,

    schedule: SpeedSchedule,

    /// Previous error
    prev_error: f64,

    /// Sum of the samples in the window
    integral: f64,

    /// Derivative from the last update
    deriv: f64,

    /// Time-weighted error samples, oldest first
    #[serde(skip)]
    window: VecDeque<f64>,

    window_size: usize,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors which can occur in the [`PidController`].
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PidError {
    #[error("The integral window must hold at least one sample")]
    InvalidWindow,

    #[error("Gains must be finite, found {0:?}")]
    NonFiniteGain(PidGains),

    #[error("Speed schedule must be finite, found {0:?}")]
    NonFiniteSchedule(SpeedSchedule),

    #[error("Time step must be positive and finite, found {0} s")]
    NonPositiveDt(f64),

    #[error("Error must be finite, found {0}")]
    NonFiniteError(f64),

    #[error("Update would give non-finite terms (derivative = {deriv}, integral = {integral})")]
    NonFiniteTerms { deriv: f64, integral: f64 },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PidGains {
    /// Create a new set of gains.
    pub fn new(k_p: f64, k_i: f64, k_d: f64) -> Self {
        Self { k_p, k_i, k_d }
    }

    fn is_finite(&self) -> bool {
        self.k_p.is_finite() && self.k_i.is_finite() && self.k_d.is_finite()
    }
}

impl PidController {
    /// Create a new controller with the given gains, speed schedule, and integral window size.
    pub fn new(
        gains: PidGains,
        schedule: SpeedSchedule,
        window_size: usize,
    ) -> Result<Self, PidError> {
        if window_size == 0 {
            return Err(PidError::InvalidWindow);
        }
        if !schedule.k_p_per_speed.is_finite() || !schedule.k_d_per_speed.is_finite() {
            return Err(PidError::NonFiniteSchedule(schedule));
        }

        let mut pid = Self {
            gains,
            schedule,
            prev_error: 0.0,
            integral: 0.0,
            deriv: 0.0,
            window: VecDeque::with_capacity(window_size),
            window_size,
        };

        pid.configure(gains)?;

        Ok(pid)
    }

    /// Set the gains and discard all error history.
    ///
    /// This is not intended to be called part way through a session, the next `observe` behaves
    /// as the first one of a new session.
    pub fn configure(&mut self, gains: PidGains) -> Result<(), PidError> {
        if !gains.is_finite() {
            return Err(PidError::NonFiniteGain(gains));
        }

        self.gains = gains;
        self.prev_error = 0.0;
        self.integral = 0.0;
        self.deriv = 0.0;
        self.window.clear();

        Ok(())
    }

    /// Update the error terms with a new error measured `dt` seconds after the previous one.
    ///
    /// Invalid inputs, or inputs which would make any term non-finite, are rejected without
    /// changing the controller's state.
    pub fn observe(&mut self, error: f64, dt: f64) -> Result<ErrorTerms, PidError> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(PidError::NonPositiveDt(dt));
        }
        if !error.is_finite() {
            return Err(PidError::NonFiniteError(error));
        }

        let deriv = (error - self.prev_error) / dt;
        let sample = error * dt;

        // The oldest sample is evicted once the window is full
        let evict = (self.window.len() == self.window_size) as usize;

        // Summed from the buffer so evicted samples leave no rounding residue behind
        let integral = self.window.iter().skip(evict).sum::<f64>() + sample;

        if !deriv.is_finite() || !integral.is_finite() {
            return Err(PidError::NonFiniteTerms { deriv, integral });
        }

        if evict > 0 {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        self.prev_error = error;
        self.deriv = deriv;
        self.integral = integral;

        Ok(self.terms())
    }

    /// Get the controller output for the given speed.
    ///
    /// This does not modify the controller, repeated calls with the same speed return the same
    /// value until the next `observe`.
    pub fn command(&self, speed: f64) -> f64 {
        let (k_p, k_i, k_d) = self.effective_gains(speed);

        k_p * self.prev_error + k_i * self.integral + k_d * self.deriv
    }

    /// Get the speed scheduled `(k_p, k_i, k_d)` gains.
    pub fn effective_gains(&self, speed: f64) -> (f64, f64, f64) {
        (
            self.gains.k_p - self.schedule.k_p_per_speed * speed,
            self.gains.k_i,
            self.gains.k_d + self.schedule.k_d_per_speed * speed,
        )
    }

    /// Get the current error terms.
    pub fn terms(&self) -> ErrorTerms {
        ErrorTerms {
            proportional: self.prev_error,
            integral: self.integral,
            derivative: self.deriv,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn schedule(&self) -> SpeedSchedule {
        self.schedule
    }

    pub fn prev_error(&self) -> f64 {
        self.prev_error
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn deriv(&self) -> f64 {
        self.deriv
    }

    /// Number of samples currently in the integral window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EPS: f64 = 1e-12;

    fn pid(k_p: f64, k_i: f64, k_d: f64, window: usize) -> PidController {
        PidController::new(
            PidGains::new(k_p, k_i, k_d),
            SpeedSchedule::default(),
            window,
        )
        .unwrap()
    }

    #[test]
    fn test_first_update() {
        let mut pid = pid(0.1, 0.25, 0.03, DEFAULT_INTEGRAL_WINDOW);

        let terms = pid.observe(0.5, 0.1).unwrap();

        assert!((terms.proportional - 0.5).abs() < EPS);
        assert!((terms.derivative - 5.0).abs() < EPS);
        assert!((terms.integral - 0.05).abs() < EPS);

        let out = pid.command(0.0);
        assert!((out - 0.2125).abs() < EPS);
    }

    #[test]
    fn test_command_is_pure() {
        let mut pid = PidController::new(
            PidGains::new(0.2, 0.1, 0.05),
            SpeedSchedule {
                k_p_per_speed: 0.001,
                k_d_per_speed: 0.0005,
            },
            5,
        )
        .unwrap();

        pid.observe(0.3, 0.05).unwrap();
        pid.observe(-0.1, 0.07).unwrap();

        let before = pid.terms();
        let first = pid.command(17.5);
        for _ in 0..10 {
            assert_eq!(pid.command(17.5), first);
        }
        assert_eq!(pid.terms(), before);
    }

    #[test]
    fn test_integral_window() {
        const W: usize = 4;
        let mut pid = pid(0.0, 1.0, 0.0, W);

        let samples = [
            (1.0, 0.1),
            (2.0, 0.2),
            (-3.0, 0.05),
            (0.5, 0.3),
            (4.0, 0.1),
            (-1.0, 0.25),
            (0.25, 0.4),
        ];

        for (i, (cte, dt)) in samples.iter().enumerate() {
            pid.observe(*cte, *dt).unwrap();

            let first = (i + 1).saturating_sub(W);
            let expected: f64 = samples[first..=i].iter().map(|(c, d)| c * d).sum();

            assert!((pid.integral() - expected).abs() < EPS);
            assert_eq!(pid.window_len(), (i + 1).min(W));
        }
    }

    #[test]
    fn test_old_samples_forgotten() {
        const W: usize = 3;
        let mut pid = pid(0.0, 1.0, 0.0, W);

        // A large bias followed by exactly W zero samples
        for _ in 0..50 {
            pid.observe(10.0, 0.1).unwrap();
        }
        for _ in 0..W {
            pid.observe(0.0, 0.1).unwrap();
        }

        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn test_speed_schedule() {
        let mut pid = PidController::new(
            PidGains::new(0.1, 0.25, 0.03),
            SpeedSchedule {
                k_p_per_speed: 0.001,
                k_d_per_speed: 0.0002,
            },
            DEFAULT_INTEGRAL_WINDOW,
        )
        .unwrap();

        pid.observe(0.5, 0.1).unwrap();

        let mut last = pid.effective_gains(0.0);
        for speed in (1..100).map(|s| s as f64) {
            let (k_p, k_i, k_d) = pid.effective_gains(speed);
            assert!(k_p < last.0);
            assert_eq!(k_i, last.1);
            assert!(k_d > last.2);
            last = (k_p, k_i, k_d);
        }

        // Output matches the scheduled gains
        let speed = 30.0;
        let k_p = 0.1 - 0.001 * speed;
        let k_d = 0.03 + 0.0002 * speed;
        let expected = k_p * 0.5 + 0.25 * pid.integral() + k_d * pid.deriv();
        assert!((pid.command(speed) - expected).abs() < EPS);
    }

    #[test]
    fn test_configure_resets() {
        let mut pid = pid(0.1, 0.25, 0.03, 5);

        for i in 0..8 {
            pid.observe(i as f64 * 0.1, 0.05).unwrap();
        }

        pid.configure(PidGains::new(0.1, 0.25, 0.03)).unwrap();

        assert_eq!(pid.prev_error(), 0.0);
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.deriv(), 0.0);
        assert_eq!(pid.window_len(), 0);
        assert_eq!(pid.command(10.0), 0.0);

        // Behaves like a fresh controller
        let mut fresh = pid.clone();
        fresh.configure(PidGains::new(0.1, 0.25, 0.03)).unwrap();
        assert_eq!(pid.observe(0.5, 0.1).unwrap(), fresh.observe(0.5, 0.1).unwrap());
    }

    #[test]
    fn test_invalid_dt_rejected() {
        let mut pid = pid(0.1, 0.25, 0.03, 5);
        pid.observe(0.2, 0.1).unwrap();
        let before = pid.terms();

        for dt in [0.0, -0.1, f64::NAN, f64::INFINITY].iter() {
            assert!(matches!(pid.observe(0.4, *dt), Err(PidError::NonPositiveDt(_))));
        }
        assert!(matches!(pid.observe(f64::NAN, 0.1), Err(PidError::NonFiniteError(_))));

        assert_eq!(pid.terms(), before);
        assert_eq!(pid.window_len(), 1);
    }

    #[test]
    fn test_overflowing_update_rejected() {
        let mut pid = pid(0.1, 0.25, 0.03, 5);
        pid.observe(0.2, 0.1).unwrap();
        let before = pid.terms();

        // Derivative overflows
        assert!(matches!(
            pid.observe(1e308, 0.1),
            Err(PidError::NonFiniteTerms { .. })
        ));
        // Integral sample overflows
        assert!(matches!(
            pid.observe(1e308, 10.0),
            Err(PidError::NonFiniteTerms { .. })
        ));

        assert_eq!(pid.terms(), before);
        assert_eq!(pid.window_len(), 1);

        // Later updates are unaffected
        let terms = pid.observe(0.1, 0.1).unwrap();
        assert!((terms.integral - (0.02 + 0.01)).abs() < EPS);
    }

    #[test]
    fn test_large_dt_is_finite() {
        let mut pid = pid(0.1, 0.25, 0.03, 5);
        pid.observe(0.2, 0.05).unwrap();
        pid.observe(-0.3, 3600.0).unwrap();

        assert!(pid.command(50.0).is_finite());
    }

    #[test]
    fn test_invalid_construction() {
        assert_eq!(
            PidController::new(PidGains::new(0.1, 0.0, 0.0), SpeedSchedule::default(), 0)
                .unwrap_err(),
            PidError::InvalidWindow
        );
        assert!(matches!(
            PidController::new(PidGains::new(f64::NAN, 0.0, 0.0), SpeedSchedule::default(), 1),
            Err(PidError::NonFiniteGain(_))
        ));
    }
}
