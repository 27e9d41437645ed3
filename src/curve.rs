// SPDX-License-Identifier: MIT OR Apache-2.0

//! Value transform: mapping raw slider values to effective multipliers.
//!
//! Every tuner exposes a mode selector with two regimes:
//!
//! - **Real** — identity. The raw value is used as the multiplier and the
//!   full destructive risk is on the user (tested up to 10.0).
//! - **Soft** — the raw value is compressed toward 1.0 through a
//!   curve chosen per target architecture ([`SoftCurve`]).
//!
//! The curve is a configuration parameter, never a hardcoded formula:
//! text-encoder weights sit much closer to catastrophic output collapse
//! (incoherent tokens) than image-backbone weights (merely degraded
//! image quality), so the text-encoder curve maps the whole `[0, 2]`
//! input domain into the narrow `[0.8, 1.2]` band, while the diffusion
//! curves allow a wider swing below identity.

use std::fmt;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Value-transform regime selected by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Compress toward identity through the configured [`SoftCurve`].
    #[default]
    Soft,
    /// Pass the raw value through unchanged.
    Real,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "Soft Value"),
            Self::Real => write!(f, "Real Value"),
        }
    }
}

// ---------------------------------------------------------------------------
// SoftCurve
// ---------------------------------------------------------------------------

/// Per-target-architecture compression curve used in [`Mode::Soft`].
///
/// All curves are continuous and pass through `(1.0, 1.0)`, so a slider
/// left at its default is always a no-op.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftCurve {
    /// Diffusion-backbone curve: concave quadratic below identity
    /// (`clamp(-1.02x² + 2.02x, 0, _)`, slope > 1 near 0), strongly
    /// damped linear above identity (`1 + (x-1)·0.133`).
    DiffusionQuadratic,
    /// Block-based diffusion curve: `1 + (x-1)·0.2`, linear and
    /// symmetric around identity.
    DiffusionLinear,
    /// Text-encoder curve: `0.8 + 0.2x`, mapping `[0, 2]` into the
    /// tight `[0.8, 1.2]` safety band.
    TextEncoder,
}

impl SoftCurve {
    /// Evaluate the curve at `raw`.
    #[must_use]
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Self::DiffusionQuadratic => {
                if raw <= 1.0 {
                    (-1.02 * raw * raw + 2.02 * raw).max(0.0)
                } else {
                    1.0 + (raw - 1.0) * 0.133
                }
            }
            Self::DiffusionLinear => 1.0 + (raw - 1.0) * 0.2,
            Self::TextEncoder => 0.8 + 0.2 * raw,
        }
    }
}

impl fmt::Display for SoftCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiffusionQuadratic => write!(f, "diffusion-quadratic"),
            Self::DiffusionLinear => write!(f, "diffusion-linear"),
            Self::TextEncoder => write!(f, "text-encoder"),
        }
    }
}

// ---------------------------------------------------------------------------
// ValueTransform
// ---------------------------------------------------------------------------

/// A mode paired with the curve the target architecture uses in Soft mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueTransform {
    /// Selected regime.
    pub mode: Mode,
    /// Curve applied when `mode` is [`Mode::Soft`].
    pub curve: SoftCurve,
}

impl ValueTransform {
    /// Create a transform.
    #[must_use]
    pub const fn new(mode: Mode, curve: SoftCurve) -> Self {
        Self { mode, curve }
    }

    /// Map a raw slider value to an effective multiplier.
    #[must_use]
    pub fn apply(&self, raw: f64) -> f64 {
        match self.mode {
            Mode::Real => raw,
            Mode::Soft => self.curve.apply(raw),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const CURVES: [SoftCurve; 3] = [
        SoftCurve::DiffusionQuadratic,
        SoftCurve::DiffusionLinear,
        SoftCurve::TextEncoder,
    ];

    #[test]
    fn real_mode_is_identity() {
        for curve in CURVES {
            let t = ValueTransform::new(Mode::Real, curve);
            let mut raw = 0.0;
            while raw <= 10.0 {
                assert_eq!(t.apply(raw), raw);
                raw += 0.25;
            }
        }
    }

    #[test]
    fn soft_curves_fix_identity() {
        for curve in CURVES {
            assert!(
                (curve.apply(1.0) - 1.0).abs() < 1e-12,
                "{curve} does not map 1.0 -> 1.0"
            );
        }
    }

    #[test]
    fn soft_curves_are_continuous_at_breakpoints() {
        // The quadratic curve is piecewise; check the seam at 1.0.
        let below = SoftCurve::DiffusionQuadratic.apply(1.0 - 1e-9);
        let above = SoftCurve::DiffusionQuadratic.apply(1.0 + 1e-9);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn quadratic_curve_shape() {
        let c = SoftCurve::DiffusionQuadratic;
        assert_eq!(c.apply(0.0), 0.0);
        // Slope > 1 near zero: small inputs are lifted.
        assert!(c.apply(0.1) > 0.1);
        // Strongly damped above identity.
        assert!((c.apply(2.0) - 1.133).abs() < 1e-9);
    }

    #[test]
    fn linear_curve_symmetry() {
        let c = SoftCurve::DiffusionLinear;
        assert!((c.apply(0.0) - 0.8).abs() < 1e-12);
        assert!((c.apply(2.0) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn text_encoder_band() {
        let c = SoftCurve::TextEncoder;
        assert!((c.apply(0.0) - 0.8).abs() < 1e-12);
        assert!((c.apply(1.5) - 1.1).abs() < 1e-12);
        assert!((c.apply(2.0) - 1.2).abs() < 1e-12);
    }
}
