//! Bounded evidence accumulator with a contracting boundary.
//!
//! The boundary `θ(t) = θ₀·e^(−λt)` shrinks every tick of an episode. Once it
//! reaches the floor a decision is forced, so accumulation always ends after
//! at most `ceil(ln(θ₀/floor)/λ)` ticks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Anomalous,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Normal => write!(f, "normal"),
            Label::Anomalous => write!(f, "anomalous"),
        }
    }
}

/// Outcome of one accumulation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Continue,
    Crossed { label: Label, forced: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    pub initial: f64,
    pub decay: f64,
    pub floor: f64,
}

impl Boundary {
    /// `θ(t)` for the `t`-th tick of an episode (1-based).
    pub fn at(&self, tick: u32) -> f64 {
        self.initial * (-self.decay * f64::from(tick)).exp()
    }

    /// Ticks after which a decision is forced.
    pub fn max_ticks(&self) -> u32 {
        let ticks = ((self.initial / self.floor).ln() / self.decay).ceil();
        if ticks.is_finite() && ticks >= 1.0 {
            ticks as u32
        } else {
            1
        }
    }

    /// Decide on `x` at `tick`, forcing a label by sign once the boundary is at the floor.
    pub fn check(&self, x: f64, tick: u32) -> Step {
        let theta = self.at(tick);
        if x >= theta {
            Step::Crossed {
                label: Label::Anomalous,
                forced: false,
            }
        } else if x <= -theta {
            Step::Crossed {
                label: Label::Normal,
                forced: false,
            }
        } else if theta <= self.floor {
            let label = if x > 0.0 {
                Label::Anomalous
            } else {
                Label::Normal
            };
            Step::Crossed {
                label,
                forced: true,
            }
        } else {
            Step::Continue
        }
    }
}
