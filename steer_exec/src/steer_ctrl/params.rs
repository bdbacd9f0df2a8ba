//! Steering control parameters
//!
//! Tuning is grouped into named profiles so that several tunings can live in the same parameter
//! file and be selected at startup.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Internal
use super::ParamsError;
use crate::pid::{PidGains, SpeedSchedule, DEFAULT_INTEGRAL_WINDOW};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for steering control
#[derive(Deserialize, Debug, Clone)]
pub struct Params {
    /// Name of the profile used when none is given on the command line
    pub default_profile: String,

    /// All available tuning profiles, by name
    pub profiles: BTreeMap<String, Profile>,
}

/// A single tuning profile.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Profile {
    // ---- PID ----
    /// Proportional gain
    pub k_p: f64,

    /// Integral gain
    pub k_i: f64,

    /// Derivative gain
    pub k_d: f64,

    /// Reduction in proportional gain per unit of speed
    #[serde(default)]
    pub k_p_per_speed: f64,

    /// Increase in derivative gain per unit of speed
    #[serde(default)]
    pub k_d_per_speed: f64,

    /// Number of samples in the integral window
    #[serde(default = "default_integral_window")]
    pub integral_window: usize,

    // ---- THROTTLE ----
    /// Throttle used while the error is changing smoothly
    #[serde(default = "default_nominal_throttle")]
    pub nominal_throttle: f64,

    /// Change in error between records above which the vehicle coasts
    #[serde(default = "default_coast_threshold")]
    pub coast_threshold: f64,

    /// Change in error between records above which the vehicle brakes
    #[serde(default = "default_brake_threshold")]
    pub brake_threshold: f64,

    /// Throttle used when braking, must not be positive
    #[serde(default = "default_brake_throttle")]
    pub brake_throttle: f64,

    /// Speed at or below which the vehicle coasts rather than brakes
    #[serde(default)]
    pub brake_min_speed: f64,

    // ---- OUTPUT ----
    /// Steering angle of the vehicle for a full scale demand, used for archiving only.
    ///
    /// Units: degrees
    #[serde(default = "default_steer_angle_scale_deg")]
    pub steer_angle_scale_deg: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Get the profile with the given name, or the default profile if `None`.
    ///
    /// The returned profile has been validated.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ParamsError> {
        let name = name.unwrap_or(self.default_profile.as_str());

        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ParamsError::UnknownProfile(name.into(), self.profile_names()))?;

        profile.validate()?;

        Ok((name, profile))
    }

    /// Names of all profiles, in order.
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}

impl Profile {
    /// Check that the profile describes a usable controller.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let finite = [
            ("k_p", self.k_p),
            ("k_i", self.k_i),
            ("k_d", self.k_d),
            ("k_p_per_speed", self.k_p_per_speed),
            ("k_d_per_speed", self.k_d_per_speed),
            ("nominal_throttle", self.nominal_throttle),
            ("coast_threshold", self.coast_threshold),
            ("brake_threshold", self.brake_threshold),
            ("brake_throttle", self.brake_throttle),
            ("brake_min_speed", self.brake_min_speed),
            ("steer_angle_scale_deg", self.steer_angle_scale_deg),
        ];
        for (name, val) in finite.iter() {
            if !val.is_finite() {
                return Err(ParamsError::InvalidProfile(format!(
                    "{} must be finite, found {}",
                    name, val
                )));
            }
        }

        if self.integral_window == 0 {
            return Err(ParamsError::InvalidProfile(
                "integral_window must be at least 1".into(),
            ));
        }
        if self.coast_threshold < 0.0 || self.coast_threshold > self.brake_threshold {
            return Err(ParamsError::InvalidProfile(format!(
                "expected 0 <= coast_threshold <= brake_threshold, found {} and {}",
                self.coast_threshold, self.brake_threshold
            )));
        }
        if self.brake_throttle > 0.0 {
            return Err(ParamsError::InvalidProfile(format!(
                "brake_throttle must not be positive, found {}",
                self.brake_throttle
            )));
        }

        Ok(())
    }

    pub fn gains(&self) -> PidGains {
        PidGains::new(self.k_p, self.k_i, self.k_d)
    }

    pub fn schedule(&self) -> SpeedSchedule {
        SpeedSchedule {
            k_p_per_speed: self.k_p_per_speed,
            k_d_per_speed: self.k_d_per_speed,
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            k_p: 0.1,
            k_i: 0.25,
            k_d: 0.03,
            k_p_per_speed: 0.0,
            k_d_per_speed: 0.0,
            integral_window: default_integral_window(),
            nominal_throttle: default_nominal_throttle(),
            coast_threshold: default_coast_threshold(),
            brake_threshold: default_brake_threshold(),
            brake_throttle: default_brake_throttle(),
            brake_min_speed: 0.0,
            steer_angle_scale_deg: default_steer_angle_scale_deg(),
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn default_integral_window() -> usize {
    DEFAULT_INTEGRAL_WINDOW
}

fn default_nominal_throttle() -> f64 {
    0.4
}

fn default_coast_threshold() -> f64 {
    0.1
}

fn default_brake_threshold() -> f64 {
    0.2
}

fn default_brake_throttle() -> f64 {
    -0.2
}

fn default_steer_angle_scale_deg() -> f64 {
    25.0
}

#[cfg(test)]
mod test {
    use super::*;

    const PARAMS: &str = r#"
        default_profile = "smooth"

        [profiles.smooth]
        k_p = 0.1
        k_i = 0.25
        k_d = 0.03

        [profiles.fast]
        k_p = 0.075
        k_i = 0.25
        k_d = 0.01
        k_p_per_speed = 0.0005
        k_d_per_speed = 0.0001
        integral_window = 10
        nominal_throttle = 0.8
        brake_min_speed = 5.0
    "#;

    #[test]
    fn test_load_profiles() {
        let params: Params = toml::from_str(PARAMS).unwrap();

        assert_eq!(params.profile_names(), vec!["fast", "smooth"]);

        let (name, smooth) = params.profile(None).unwrap();
        assert_eq!(name, "smooth");
        assert_eq!(smooth, &Profile::default());

        let (_, fast) = params.profile(Some("fast")).unwrap();
        assert_eq!(fast.integral_window, 10);
        assert_eq!(fast.nominal_throttle, 0.8);
        assert_eq!(fast.coast_threshold, 0.1);
        assert_eq!(fast.brake_min_speed, 5.0);
        assert_eq!(fast.schedule().k_p_per_speed, 0.0005);
    }

    #[test]
    fn test_shipped_params() {
        let params: Params = util::params::load_path(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../params/steer_ctrl.toml"
        ))
        .unwrap();

        for name in params.profile_names() {
            assert!(params.profile(Some(&name)).is_ok(), "profile {} is invalid", name);
        }
        assert_eq!(params.profile(None).unwrap().1, &Profile::default());
    }

    #[test]
    fn test_unknown_profile() {
        let params: Params = toml::from_str(PARAMS).unwrap();

        assert!(matches!(
            params.profile(Some("race")),
            Err(ParamsError::UnknownProfile(_, _))
        ));
    }

    #[test]
    fn test_invalid_profiles() {
        let bad = [
            Profile {
                integral_window: 0,
                ..Default::default()
            },
            Profile {
                coast_threshold: 0.3,
                brake_threshold: 0.2,
                ..Default::default()
            },
            Profile {
                brake_throttle: 0.5,
                ..Default::default()
            },
            Profile {
                k_d: f64::NAN,
                ..Default::default()
            },
        ];

        for p in bad.iter() {
            assert!(matches!(p.validate(), Err(ParamsError::InvalidProfile(_))));
        }
    }
}
