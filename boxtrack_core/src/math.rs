//! Scalar angle helpers shared across the engine.
//!
//! Headings live in (-pi, pi]; every module that touches yaw goes
//! through these two functions so wrap behavior stays in one place.

use std::f64::consts::PI;

/// Wrap an angle into (-pi, pi] by iterative +-2pi adjustment.
pub fn wrap_angle(theta: f64) -> f64 {
    let mut t = theta;
    while t > PI {
        t -= 2.0 * PI;
    }
    while t < -PI {
        t += 2.0 * PI;
    }
    t
}

/// Signed angular difference `a - b`, wrapped into (-pi, pi].
pub fn angle_diff(a: f64, b: f64) -> f64 {
    wrap_angle(a - b)
}
