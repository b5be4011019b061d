//! Rolling Sample Buffer - Per-player detection state
//!
//! Holds the sliding window of feature tuples for one online player together
//! with the combat/step counters that gate when a batch may be submitted.
//! One `PlayerDetectionState` exists per online player and is only touched
//! from the tick context.

use std::collections::VecDeque;
use serde::{Deserialize, Serialize};

use crate::constants::{HIGH_PROBABILITY_THRESHOLD, PROBABILITY_HISTORY_SIZE};
use crate::logic::features::{AimProcessor, FeatureTuple};

// ============================================================================
// WINDOW
// ============================================================================

/// Window fill state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// No samples since the last reset
    Idle,
    /// Accumulating, below capacity
    Filling,
    /// Capacity reached
    Ready,
}

/// Fixed-capacity FIFO window of feature tuples
#[derive(Debug, Clone)]
pub struct RollingSampleBuffer {
    samples: VecDeque<FeatureTuple>,
    capacity: usize,
}

impl RollingSampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest tuple when full
    pub fn push(&mut self, tuple: FeatureTuple) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(tuple);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn state(&self) -> WindowState {
        if self.samples.is_empty() {
            WindowState::Idle
        } else if self.is_full() {
            WindowState::Ready
        } else {
            WindowState::Filling
        }
    }

    /// Copy of the window, oldest first
    pub fn snapshot(&self) -> Vec<FeatureTuple> {
        self.samples.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureTuple> {
        self.samples.iter()
    }
}

// ============================================================================
// PLAYER STATE
// ============================================================================

/// Everything the detector tracks for one online player
#[derive(Debug, Clone)]
pub struct PlayerDetectionState {
    player_name: String,
    aim: AimProcessor,
    window: RollingSampleBuffer,
    step: u32,

    ticks_since_attack: u32,
    ticks_since_submission: u32,
    /// Ticket of the in-flight submission, if any
    pending: Option<u64>,

    buffer: f64,
    last_probability: f64,
    probability_history: VecDeque<f64>,
    high_probability_detections: u32,
}

impl PlayerDetectionState {
    pub fn new(player_name: impl Into<String>, sequence: usize, step: u32) -> Self {
        let window = RollingSampleBuffer::new(sequence);
        // Start outside the combat window
        let ticks_since_attack = window.capacity() as u32 + 1;
        Self {
            player_name: player_name.into(),
            aim: AimProcessor::new(),
            window,
            step: step.max(1),
            ticks_since_attack,
            ticks_since_submission: 0,
            pending: None,
            buffer: 0.0,
            last_probability: 0.0,
            probability_history: VecDeque::with_capacity(PROBABILITY_HISTORY_SIZE),
            high_probability_detections: 0,
        }
    }

    /// Use a fixed fallback GCD granularity
    pub fn with_default_granularity(mut self, granularity: Option<f64>) -> Self {
        self.aim = AimProcessor::with_default_granularity(granularity);
        self
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Feed one rotation sample into the aim processor and the window
    pub fn on_rotation(&mut self, yaw: f32, pitch: f32) -> FeatureTuple {
        let tuple = self.aim.process(yaw, pitch);
        self.window.push(tuple);
        tuple
    }

    pub fn on_attack(&mut self) {
        self.ticks_since_attack = 0;
    }

    /// Discontinuous movement: drop aim memory and the window
    pub fn on_teleport(&mut self) {
        self.aim.reset();
        self.window.clear();
    }

    /// Advance the tick counters and drop stale context outside combat
    pub fn on_tick(&mut self) {
        let cap = self.sequence() as u32 + 1;
        if self.ticks_since_attack < cap {
            self.ticks_since_attack += 1;
        }
        self.ticks_since_submission = self.ticks_since_submission.saturating_add(1);

        if !self.is_in_combat() {
            self.window.clear();
        }
    }

    pub fn set_sensitivity(&mut self, sensitivity: Option<f64>) {
        self.aim.set_sensitivity(sensitivity);
    }

    // ========================================================================
    // SUBMISSION GATE
    // ========================================================================

    pub fn is_in_combat(&self) -> bool {
        self.ticks_since_attack as usize <= self.sequence()
    }

    /// The single gate for issuing an inference request
    pub fn should_submit(&self) -> bool {
        self.pending.is_none()
            && self.ticks_since_submission >= self.step
            && self.window.len() >= self.sequence()
            && self.is_in_combat()
    }

    /// Mark a submission in flight and hand out the batch
    pub fn begin_submission(&mut self, ticket: u64) -> Vec<FeatureTuple> {
        self.pending = Some(ticket);
        self.ticks_since_submission = 0;
        self.window.snapshot()
    }

    /// Clear the in-flight marker if `ticket` is the current one
    pub fn finish_submission(&mut self, ticket: u64) -> bool {
        if self.pending == Some(ticket) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_ticket(&self) -> Option<u64> {
        self.pending
    }

    /// Drop window, aim memory and any in-flight marker
    pub fn full_reset(&mut self) {
        self.window.clear();
        self.aim.reset();
        self.pending = None;
    }

    // ========================================================================
    // SCORE
    // ========================================================================

    /// Record a finite, clamped probability
    pub fn record_probability(&mut self, probability: f64) {
        self.last_probability = probability;
        if self.probability_history.len() >= PROBABILITY_HISTORY_SIZE {
            self.probability_history.pop_front();
        }
        self.probability_history.push_back(probability);
        if probability > HIGH_PROBABILITY_THRESHOLD {
            self.high_probability_detections += 1;
        }
    }

    pub fn set_buffer(&mut self, buffer: f64) {
        self.buffer = buffer.max(0.0);
    }

    pub fn buffer(&self) -> f64 {
        self.buffer
    }

    pub fn last_probability(&self) -> f64 {
        self.last_probability
    }

    pub fn probability_history(&self) -> Vec<f64> {
        self.probability_history.iter().copied().collect()
    }

    /// Mean of the retained probabilities
    pub fn average_probability(&self) -> f64 {
        if self.probability_history.is_empty() {
            return 0.0;
        }
        self.probability_history.iter().sum::<f64>() / self.probability_history.len() as f64
    }

    pub fn high_probability_detections(&self) -> u32 {
        self.high_probability_detections
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn sequence(&self) -> usize {
        self.window.capacity()
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_state(&self) -> WindowState {
        self.window.state()
    }

    pub fn ticks_since_attack(&self) -> u32 {
        self.ticks_since_attack
    }

    pub fn ticks_since_submission(&self) -> u32 {
        self.ticks_since_submission
    }

    pub fn window(&self) -> &RollingSampleBuffer {
        &self.window
    }
}
