//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Map a value from one range into another.
pub fn lin_map<T>(source_range: (T, T), target_range: (T, T), value: T) -> T
where
    T: Float,
{
    target_range.0
        + ((value - source_range.0) * (target_range.1 - target_range.0)
            / (source_range.1 - source_range.0))
}

/// Clamp a value into the closed interval `[min, max]`.
///
/// `NaN` is passed through unchanged.
pub fn clamp<T>(value: T, min: T, max: T) -> T
where
    T: Float,
{
    if value > max {
        max
    } else if value < min {
        min
    } else {
        value
    }
}

/// Saturate a value into the symmetric interval `[-limit, limit]`.
///
/// The returned flag is true if the value had to be limited.
pub fn saturate<T>(value: T, limit: T) -> (T, bool)
where
    T: Float,
{
    let limit = limit.abs();
    let sat = clamp(value, -limit, limit);

    (sat, sat != value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lin_map() {
        assert_eq!(lin_map((-1f64, 1f64), (-25f64, 25f64), 0.5), 12.5);
        assert_eq!(lin_map((0f64, 10f64), (0f64, 1f64), 10.0), 1.0);
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(0.2125f64, 1.0), (0.2125, false));
        assert_eq!(saturate(3.7f64, 1.0), (1.0, true));
        assert_eq!(saturate(-12.0f64, 1.0), (-1.0, true));
        assert_eq!(saturate(1.0f64, 1.0), (1.0, false));
        assert_eq!(saturate(-1.0f64, -1.0), (-1.0, false));
    }

    #[test]
    fn test_saturate_keeps_sign() {
        for raw in [1.0001f64, 2.0, 1e9, f64::INFINITY].iter() {
            assert_eq!(saturate(*raw, 1.0).0, 1.0);
            assert_eq!(saturate(-*raw, 1.0).0, -1.0);
        }
    }
}
