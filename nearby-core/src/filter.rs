//! Proximity filter: critically-damped easing of signal strength.
//!
//! The filter works on signal magnitude because the eased value is clamped at
//! zero; the score is negated again on the way out so it compares directly
//! against raw signal readings.

const SPRING: f64 = 0.01;
const DAMPING: f64 = 0.7;
const SNAP_EPSILON: f64 = 0.001;

/// Per-peer easing state. Starts at rest at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProximityFilter {
    velocity: f64,
    current: f64,
}

impl ProximityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw signal sample and return the smoothed proximity score.
    pub fn update(&mut self, raw_signal: i32) -> i32 {
        let (next, score) = step(*self, raw_signal);
        *self = next;
        score
    }

    /// Snap directly to the sample with no easing and return its score.
    pub fn reset(&mut self, raw_signal: i32) -> i32 {
        self.current = f64::from(raw_signal).abs();
        self.velocity = 0.0;
        self.score()
    }

    pub fn score(&self) -> i32 {
        (self.current * -1.0).round() as i32
    }
}

/// Pure filter step: (previous state, new sample) -> (new state, score).
pub fn step(state: ProximityFilter, raw_signal: i32) -> (ProximityFilter, i32) {
    let target = f64::from(raw_signal).abs();
    let mut velocity = state.velocity;
    let mut current = state.current;

    velocity += (target - current) * SPRING;
    velocity *= DAMPING;
    current += velocity;

    if (target - current).abs() < SNAP_EPSILON {
        current = target;
        velocity = 0.0;
    }
    current = current.max(0.0);

    let next = ProximityFilter { velocity, current };
    (next, next.score())
}
