//! Throttle policy
//!
//! A sudden jump in cross-track error between two consecutive records is taken as a sign that
//! control is about to be lost, so power is backed off independently of the steering correction.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;

use super::Profile;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Decides the throttle demand from the change in error between records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottlePolicy {
    nominal_throttle: f64,
    coast_threshold: f64,
    brake_threshold: f64,
    brake_throttle: f64,
    brake_min_speed: f64,
}

/// The branch taken by the throttle policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThrottleAction {
    Nominal,
    Coast,
    Brake,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ThrottlePolicy {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            nominal_throttle: profile.nominal_throttle,
            coast_threshold: profile.coast_threshold,
            brake_threshold: profile.brake_threshold,
            brake_throttle: profile.brake_throttle,
            brake_min_speed: profile.brake_min_speed,
        }
    }

    /// Get the throttle demand.
    ///
    /// `prev_error` must be the error from before the controller was updated with `error`.
    pub fn decide(&self, prev_error: f64, error: f64, speed: f64) -> (f64, ThrottleAction) {
        let delta = (prev_error - error).abs();

        let action = if !delta.is_finite() {
            ThrottleAction::Coast
        } else if delta > self.brake_threshold {
            // Braking while nearly stationary would reverse the vehicle
            if speed > self.brake_min_speed {
                ThrottleAction::Brake
            } else {
                ThrottleAction::Coast
            }
        } else if delta > self.coast_threshold {
            ThrottleAction::Coast
        } else {
            ThrottleAction::Nominal
        };

        (self.throttle(action), action)
    }

    /// Get the throttle demand for an action.
    pub fn throttle(&self, action: ThrottleAction) -> f64 {
        match action {
            ThrottleAction::Nominal => self.nominal_throttle,
            ThrottleAction::Coast => 0.0,
            ThrottleAction::Brake => self.brake_throttle,
        }
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from_profile(&Profile::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thresholds() {
        let policy = ThrottlePolicy::default();

        assert_eq!(policy.decide(0.0, 0.05, 20.0), (0.4, ThrottleAction::Nominal));
        assert_eq!(policy.decide(0.0, 0.15, 20.0), (0.0, ThrottleAction::Coast));
        assert_eq!(policy.decide(0.0, 0.25, 20.0), (-0.2, ThrottleAction::Brake));

        // Only the size of the jump matters
        assert_eq!(policy.decide(0.0, -0.25, 20.0), (-0.2, ThrottleAction::Brake));
        assert_eq!(policy.decide(1.0, 1.05, 20.0), (0.4, ThrottleAction::Nominal));
    }

    #[test]
    fn test_threshold_edges() {
        let policy = ThrottlePolicy::from_profile(&Profile {
            coast_threshold: 0.5,
            brake_threshold: 1.0,
            ..Default::default()
        });

        // Thresholds are exclusive
        assert_eq!(policy.decide(0.0, 0.5, 20.0).1, ThrottleAction::Nominal);
        assert_eq!(policy.decide(0.0, 1.0, 20.0).1, ThrottleAction::Coast);
        assert_eq!(policy.decide(0.0, 1.5, 20.0).1, ThrottleAction::Brake);
    }

    #[test]
    fn test_brake_speed_floor() {
        let policy = ThrottlePolicy::from_profile(&Profile {
            brake_min_speed: 5.0,
            ..Default::default()
        });

        assert_eq!(policy.decide(0.0, 0.25, 5.0), (0.0, ThrottleAction::Coast));
        assert_eq!(policy.decide(0.0, 0.25, 5.1), (-0.2, ThrottleAction::Brake));
    }

    #[test]
    fn test_non_finite_coasts() {
        let policy = ThrottlePolicy::default();

        assert_eq!(policy.decide(0.0, f64::NAN, 20.0), (0.0, ThrottleAction::Coast));
        assert_eq!(policy.decide(f64::INFINITY, 0.0, 20.0), (0.0, ThrottleAction::Coast));
    }
}
