use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
        }
    }
}

/// Maps a 1-based attempt number to a wait before the next try.
///
/// Linear and exponential delays are clamped to `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delay {
    Fixed {
        delay: u64,
        unit: TimeUnit,
    },
    Linear {
        unit: TimeUnit,
        upper: u64,
        lower: u64,
        grow_by: f64,
    },
    Exponential {
        unit: TimeUnit,
        upper: u64,
        lower: u64,
        grow_by: f64,
        powers_of: f64,
    },
}

impl Delay {
    pub const fn fixed(delay: u64, unit: TimeUnit) -> Self {
        Self::Fixed { delay, unit }
    }

    /// `attempt` units, unbounded.
    pub const fn linear(unit: TimeUnit) -> Self {
        Self::linear_with(unit, u64::MAX, 0, 1.0)
    }

    pub const fn linear_with(unit: TimeUnit, upper: u64, lower: u64, grow_by: f64) -> Self {
        Self::Linear {
            unit,
            upper,
            lower,
            grow_by,
        }
    }

    /// `2^(attempt - 1)` units, unbounded.
    pub const fn exponential(unit: TimeUnit) -> Self {
        Self::exponential_with(unit, u64::MAX, 0, 1.0, 2.0)
    }

    pub const fn exponential_with(
        unit: TimeUnit,
        upper: u64,
        lower: u64,
        grow_by: f64,
        powers_of: f64,
    ) -> Self {
        Self::Exponential {
            unit,
            upper,
            lower,
            grow_by,
            powers_of,
        }
    }

    pub fn unit(&self) -> TimeUnit {
        match self {
            Self::Fixed { unit, .. }
            | Self::Linear { unit, .. }
            | Self::Exponential { unit, .. } => *unit,
        }
    }

    /// Delay for `attempt`, in [`Delay::unit`].
    pub fn calculate(&self, attempt: u32) -> u64 {
        match *self {
            Self::Fixed { delay, .. } => delay,
            Self::Linear {
                upper,
                lower,
                grow_by,
                ..
            } => clamp((attempt as f64 * grow_by).round(), lower, upper),
            Self::Exponential {
                upper,
                lower,
                grow_by,
                powers_of,
                ..
            } => {
                if attempt == 0 {
                    return 0;
                }
                let raw = (grow_by * powers_of.powf((attempt - 1) as f64)).round();
                clamp(raw, lower, upper)
            }
        }
    }

    pub fn duration_for(&self, attempt: u32) -> Duration {
        self.unit().to_duration(self.calculate(attempt))
    }
}

fn clamp(raw: f64, lower: u64, upper: u64) -> u64 {
    // `as` saturates for out-of-range floats.
    let value = raw as u64;
    value.max(lower).min(upper)
}
