//! Analog-to-key trigger state machines
//!
//! An axis config with a non-zero `analog_threshold` acts as a button
//! condition. Presses fire when the magnitude crosses the threshold in the
//! configured direction; releases fire when it falls below 75% of the
//! threshold magnitude, so values hovering around the threshold do not
//! flicker. Relative axes additionally release after `release_timeout`
//! without further motion, handled by the owning handler's timer.

/// Release band as a fraction of the threshold magnitude.
pub const HYSTERESIS: f64 = 0.75;

/// Outcome of feeding one sample into a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerUpdate {
    Pressed,
    Released,
    NoChange,
}

/// Threshold trigger on an absolute axis. The threshold is a percentage of
/// the normalized range, its sign selecting the direction.
#[derive(Debug, Clone)]
pub struct AbsTrigger {
    threshold: f64,
    active: bool,
}

impl AbsTrigger {
    /// `percent` is the `analog_threshold` in `[-100, 100]`, non-zero.
    pub fn new(percent: i32) -> Self {
        Self {
            threshold: f64::from(percent) / 100.0,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update(&mut self, value: i32, range: (i32, i32)) -> TriggerUpdate {
        let (min, max) = range;
        let half_range = (max as f64 - min as f64) / 2.0;
        let middle = half_range + min as f64;
        let x = (f64::from(value) - middle) / half_range;

        let beyond_trigger = if self.threshold > 0.0 {
            x >= self.threshold
        } else {
            x <= self.threshold
        };
        let inside_release_band = if self.threshold > 0.0 {
            x < self.threshold * HYSTERESIS
        } else {
            x > self.threshold * HYSTERESIS
        };

        if !self.active && beyond_trigger {
            self.active = true;
            TriggerUpdate::Pressed
        } else if self.active && inside_release_band {
            self.active = false;
            TriggerUpdate::Released
        } else {
            TriggerUpdate::NoChange
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
    }
}

/// Threshold trigger on a relative axis. The threshold is a raw speed, its
/// sign selecting the direction. Because relative events stop arriving when
/// motion stops, staying pressed additionally requires the owning handler
/// to refresh a release timer on every `Pressed`/`NoChange`-while-active
/// sample; `timeout_release` implements the timer expiry.
#[derive(Debug, Clone)]
pub struct RelTrigger {
    threshold: f64,
    active: bool,
}

impl RelTrigger {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold: f64::from(threshold),
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update(&mut self, value: i32) -> TriggerUpdate {
        // value relative to the threshold, >= 1 means beyond it
        let ratio = f64::from(value) / self.threshold;

        if !self.active {
            if ratio >= 1.0 {
                self.active = true;
                return TriggerUpdate::Pressed;
            }
            return TriggerUpdate::NoChange;
        }

        if ratio < HYSTERESIS {
            self.active = false;
            TriggerUpdate::Released
        } else {
            TriggerUpdate::NoChange
        }
    }

    /// The release timer fired. Returns true if that released the trigger.
    pub fn timeout_release(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    pub fn reset(&mut self) {
        self.active = false;
    }
}
