//! Analog axis shaping
//!
//! Normalization, deadzone, expo and gain for the axis handlers. The expo
//! curve is the cubic `f(x) = d*x + (1 - d)*x^3` with `d = 1 - k` for
//! `k >= 0`; for `k < 0` the curve is mirrored at `y = x` by evaluating the
//! closed-form inverse of the cubic with `d = 1 + k`. Both ends keep the
//! fixed points f(0) = 0 and f(±1) = ±1.

/// Speed scaling for EV_REL output so `gain = 1` yields usable pointer
/// speeds at the default emission rate.
pub const REL_XY_SCALING: f64 = 60.0;
pub const WHEEL_SCALING: f64 = 1.0;
/// Hi-res wheel events carry 120 times the value of their low-res siblings.
pub const WHEEL_HI_RES_SCALING: f64 = 120.0;

/// The axis transformation at a given input value.
#[derive(Debug, Clone, Copy)]
pub struct Transformation {
    min: i32,
    max: i32,
    deadzone: f64,
    gain: f64,
    expo: f64,
}

impl Transformation {
    pub fn new(min: i32, max: i32, deadzone: f64, gain: f64, expo: f64) -> Self {
        Self {
            min,
            max,
            deadzone,
            gain,
            expo,
        }
    }

    /// Shape a raw axis sample. The result is in `[-gain, gain]`.
    pub fn apply(&self, raw: f64) -> f64 {
        calc_cubic(flatten_deadzone(self.normalize(raw), self.deadzone), self.expo) * self.gain
    }

    /// Shape an already-normalized value in `[-1, 1]`.
    pub fn apply_normalized(&self, x: f64) -> f64 {
        calc_cubic(flatten_deadzone(x.clamp(-1.0, 1.0), self.deadzone), self.expo) * self.gain
    }

    /// Move and scale `raw` into `[-1, 1]`.
    fn normalize(&self, raw: f64) -> f64 {
        if self.min == -1 && self.max == 1 {
            return raw.clamp(-1.0, 1.0);
        }
        let half_range = (self.max as f64 - self.min as f64) / 2.0;
        let middle = half_range + self.min as f64;
        ((raw - middle) / half_range).clamp(-1.0, 1.0)
    }
}

/// Normalize a relative speed against the configured cutoff.
pub fn normalize_rel(raw: f64, cutoff: f64) -> f64 {
    (raw / cutoff).clamp(-1.0, 1.0)
}

/// Map a normalized value in `[-1, 1]` back onto an integer axis range,
/// saturating at the boundaries.
pub fn denormalize(value: f64, min: i32, max: i32) -> i32 {
    let half_range = (max as f64 - min as f64) / 2.0;
    let middle = half_range + min as f64;
    // round half towards positive so the center of even ranges maps to 0
    (middle + value * half_range + 0.5)
        .floor()
        .clamp(min as f64, max as f64) as i32
}

/// Zero inside the deadzone, rescaled to span the full range outside it.
fn flatten_deadzone(x: f64, deadzone: f64) -> f64 {
    if x.abs() <= deadzone {
        return 0.0;
    }
    (x - deadzone * x.signum()) / (1.0 - deadzone)
}

/// The expo cubic, identity at `k = 0`, odd-symmetric, fixed at 0 and ±1.
fn calc_cubic(x: f64, k: f64) -> f64 {
    if k == 0.0 || x == 0.0 {
        return x;
    }

    if k > 0.0 {
        let d = 1.0 - k;
        return d * x + (1.0 - d) * x.powi(3);
    }

    // real inverse solution of y = b*x + a*x^3, mirroring the curve at y = x
    let sign = x.signum();
    let x = x.abs();
    let d = 1.0 + k;
    let a = 1.0 - d;
    let b = d;
    let c = ((27.0 * x * x + (4.0 * b.powi(3)) / a).sqrt() + 3.0_f64.powf(1.5) * x).powf(1.0 / 3.0);
    let y = c / (2.0_f64.powf(1.0 / 3.0) * 3.0_f64.sqrt() * a.powf(1.0 / 3.0))
        - (2.0_f64.powf(1.0 / 3.0) * b) / (3.0_f64.sqrt() * a.powf(2.0 / 3.0) * c);
    y * sign
}

/// Accumulates fractional deltas between emission ticks so rounding does not
/// bias slow movements towards zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct FractionalCarry {
    carry: f64,
}

impl FractionalCarry {
    /// Add a delta and take out the whole part.
    pub fn advance(&mut self, delta: f64) -> i32 {
        self.carry += delta;
        let whole = self.carry.trunc();
        self.carry -= whole;
        whole as i32
    }

    pub fn reset(&mut self) {
        self.carry = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(deadzone: f64, gain: f64, expo: f64) -> Transformation {
        Transformation::new(-32768, 32767, deadzone, gain, expo)
    }

    #[test]
    fn fixed_points() {
        for expo in [-0.9, -0.5, 0.0, 0.5, 0.9] {
            for gain in [0.5, 1.0, 2.0] {
                let t = transform(0.1, gain, expo);
                assert!(t.apply_normalized(0.0).abs() < 1e-9, "expo {expo}");
                assert!(
                    (t.apply_normalized(1.0) - gain).abs() < 1e-6,
                    "expo {expo} gain {gain}: {}",
                    t.apply_normalized(1.0)
                );
                assert!(
                    (t.apply_normalized(-1.0) + gain).abs() < 1e-6,
                    "expo {expo} gain {gain}"
                );
            }
        }
    }

    #[test]
    fn deadzone_edges() {
        let t = transform(0.2, 1.0, 0.0);
        // just inside and exactly at the edge
        assert_eq!(t.apply_normalized(0.19), 0.0);
        assert_eq!(t.apply_normalized(0.2), 0.0);
        assert_eq!(t.apply_normalized(-0.2), 0.0);
        // just outside starts from zero
        assert!(t.apply_normalized(0.21) > 0.0);
        assert!(t.apply_normalized(0.21) < 0.05);
    }

    #[test]
    fn expo_zero_is_identity_outside_deadzone() {
        let t = transform(0.0, 1.0, 0.0);
        for x in [-1.0, -0.5, -0.1, 0.0, 0.3, 0.7, 1.0] {
            assert!((t.apply_normalized(x) - x).abs() < 1e-9);
        }
    }

    #[test]
    fn positive_expo_lowers_small_values() {
        let t = transform(0.0, 1.0, 0.5);
        assert!(t.apply_normalized(0.5) < 0.5);
        assert!(t.apply_normalized(-0.5) > -0.5);
    }

    #[test]
    fn negative_expo_is_the_inverse_curve() {
        // f_k and f_{-k} must undo each other
        for k in [0.3, 0.6, 0.9] {
            for x in [0.1, 0.4, 0.8, 1.0] {
                let forward = calc_cubic(x, k);
                let back = calc_cubic(forward, -k);
                assert!(
                    (back - x).abs() < 1e-6,
                    "k {k} x {x}: forward {forward} back {back}"
                );
            }
        }
    }

    #[test]
    fn monotonic() {
        for expo in [-0.9, -0.3, 0.0, 0.3, 0.9] {
            let t = transform(0.1, 1.0, expo);
            let mut last = t.apply_normalized(-1.0);
            let mut x = -1.0;
            while x <= 1.0 {
                let y = t.apply_normalized(x);
                assert!(y >= last - 1e-9, "expo {expo} at x {x}");
                last = y;
                x += 0.01;
            }
        }
    }

    #[test]
    fn normalizes_device_ranges() {
        let t = Transformation::new(0, 255, 0.0, 1.0, 0.0);
        assert!((t.apply(0.0) + 1.0).abs() < 1e-9);
        assert!(t.apply(127.5).abs() < 1e-9);
        assert!((t.apply(255.0) - 1.0).abs() < 1e-9);
        // out-of-range samples clamp
        assert!((t.apply(300.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn hat_axes_pass_through() {
        let t = Transformation::new(-1, 1, 0.0, 1.0, 0.0);
        assert_eq!(t.apply(1.0), 1.0);
        assert_eq!(t.apply(-1.0), -1.0);
    }

    #[test]
    fn denormalize_saturates() {
        assert_eq!(denormalize(0.0, -32768, 32767), 0);
        assert_eq!(denormalize(1.0, -32768, 32767), 32767);
        assert_eq!(denormalize(-1.0, -32768, 32767), -32768);
        assert_eq!(denormalize(2.0, -32768, 32767), 32767);
    }

    #[test]
    fn fractional_carry_accumulates_without_bias() {
        let mut carry = FractionalCarry::default();
        let mut total = 0;
        for _ in 0..10 {
            total += carry.advance(0.3);
        }
        assert_eq!(total, 3);

        carry.reset();
        let mut total = 0;
        for _ in 0..10 {
            total += carry.advance(-0.25);
        }
        assert_eq!(total, -2);
    }
}
