//! Session Recording - labelled training captures
//!
//! A recording follows one player, runs the same feature extraction as
//! detection and keeps only ticks inside the combat window. Stopping a
//! recording writes a CSV into the output directory.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logic::features::{AimProcessor, FeatureTuple};

/// Ticks after an attack that still count as combat
pub const COMBAT_TIMEOUT_TICKS: u32 = 40;

/// Characters replaced in file name comments
const UNSAFE_CHARS: &[char] = &['/', '\\', '?', '%', '*', ':', '|', '"', '<', '>', '\''];

/// Observer of the inbound event stream
pub trait SessionRecorder: Send {
    fn on_rotation(&mut self, player: Uuid, yaw: f32, pitch: f32);

    fn on_attack(&mut self, player: Uuid);

    fn on_quit(&mut self, _player: Uuid) {}

    /// Host is going down
    fn shutdown(&mut self) {}
}

/// Shared recorder: the host keeps one handle to start and stop captures
impl<R: SessionRecorder> SessionRecorder for Arc<Mutex<R>> {
    fn on_rotation(&mut self, player: Uuid, yaw: f32, pitch: f32) {
        self.lock().on_rotation(player, yaw, pitch);
    }

    fn on_attack(&mut self, player: Uuid) {
        self.lock().on_attack(player);
    }

    fn on_quit(&mut self, player: Uuid) {
        self.lock().on_quit(player);
    }

    fn shutdown(&mut self) {
        self.lock().shutdown();
    }
}

// ============================================================================
// LABEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionLabel {
    Cheat,
    Legit,
    Unlabeled,
}

impl SessionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLabel::Cheat => "CHEAT",
            SessionLabel::Legit => "LEGIT",
            SessionLabel::Unlabeled => "UNLABELED",
        }
    }
}

impl std::str::FromStr for SessionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CHEAT" => Ok(Self::Cheat),
            "LEGIT" => Ok(Self::Legit),
            "UNLABELED" => Ok(Self::Unlabeled),
            other => Err(format!("unknown label '{}'", other)),
        }
    }
}

// ============================================================================
// DATA SESSION
// ============================================================================

/// One player's capture
#[derive(Debug, Clone)]
pub struct DataSession {
    player_uuid: Uuid,
    player_name: String,
    label: SessionLabel,
    comment: Option<String>,
    started_at: DateTime<Local>,
    aim: AimProcessor,
    ticks: Vec<FeatureTuple>,
    ticks_since_attack: u32,
}

impl DataSession {
    pub fn new(
        player_uuid: Uuid,
        player_name: impl Into<String>,
        label: SessionLabel,
        comment: Option<String>,
    ) -> Self {
        Self {
            player_uuid,
            player_name: player_name.into(),
            label,
            comment: comment.filter(|c| !c.trim().is_empty()),
            started_at: Local::now(),
            aim: AimProcessor::new(),
            ticks: Vec::new(),
            ticks_since_attack: COMBAT_TIMEOUT_TICKS,
        }
    }

    pub fn process_tick(&mut self, yaw: f32, pitch: f32) {
        let tuple = self.aim.process(yaw, pitch);
        if self.is_in_combat() {
            self.ticks.push(tuple);
        }
        self.ticks_since_attack = self.ticks_since_attack.saturating_add(1);
    }

    pub fn on_attack(&mut self) {
        self.ticks_since_attack = 0;
    }

    pub fn is_in_combat(&self) -> bool {
        self.ticks_since_attack < COMBAT_TIMEOUT_TICKS
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.len()
    }

    pub fn player_uuid(&self) -> Uuid {
        self.player_uuid
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn label(&self) -> SessionLabel {
        self.label
    }

    /// `{LABEL}[_{comment}]_{player}_{yyyyMMdd-HHmmss}.csv`
    pub fn file_name(&self) -> String {
        let mut status = self.label.as_str().to_string();
        if let Some(comment) = self.comment.as_deref() {
            let sanitized: String = comment
                .chars()
                .map(|c| match c {
                    ' ' => '#',
                    c if UNSAFE_CHARS.contains(&c) => '-',
                    c => c,
                })
                .collect();
            status.push('_');
            status.push_str(&sanitized);
        }
        format!(
            "{}_{}_{}.csv",
            status,
            self.player_name,
            self.started_at.format("%Y%m%d-%H%M%S")
        )
    }

    /// Header plus one labelled row per recorded tick; empty without ticks
    pub fn csv_content(&self) -> String {
        if self.ticks.is_empty() {
            return String::new();
        }
        let mut out = FeatureTuple::csv_header();
        out.push('\n');
        for tick in &self.ticks {
            out.push_str(&tick.to_csv(self.label.as_str()));
            out.push('\n');
        }
        out
    }

    /// Write the CSV into `dir`; `None` when nothing was recorded
    pub fn save(&self, dir: &Path) -> io::Result<Option<PathBuf>> {
        let content = self.csv_content();
        if content.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        fs::write(&path, content)?;
        log::info!("Saved {} ticks to {}", self.ticks.len(), path.display());
        Ok(Some(path))
    }
}

// ============================================================================
// RECORDER
// ============================================================================

/// Recorder writing one CSV per finished capture
#[derive(Debug)]
pub struct DataSessionRecorder {
    output_dir: PathBuf,
    sessions: HashMap<Uuid, DataSession>,
}

impl DataSessionRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            sessions: HashMap::new(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Begin capturing a player; false if already recording
    pub fn start(
        &mut self,
        player: Uuid,
        player_name: &str,
        label: SessionLabel,
        comment: Option<String>,
    ) -> bool {
        if self.sessions.contains_key(&player) {
            return false;
        }
        log::info!("Recording {} as {}", player_name, label.as_str());
        self.sessions
            .insert(player, DataSession::new(player, player_name, label, comment));
        true
    }

    /// Finish and save a capture
    pub fn stop(&mut self, player: &Uuid) -> io::Result<Option<PathBuf>> {
        match self.sessions.remove(player) {
            Some(session) => session.save(&self.output_dir),
            None => Ok(None),
        }
    }

    /// Finish every capture, logging write failures
    pub fn stop_all(&mut self) -> Vec<PathBuf> {
        let players: Vec<Uuid> = self.sessions.keys().copied().collect();
        let mut written = Vec::new();
        for player in players {
            match self.stop(&player) {
                Ok(Some(path)) => written.push(path),
                Ok(None) => {}
                Err(e) => log::warn!("Failed to save recording for {}: {}", player, e),
            }
        }
        written
    }

    pub fn is_recording(&self, player: &Uuid) -> bool {
        self.sessions.contains_key(player)
    }

    pub fn session(&self, player: &Uuid) -> Option<&DataSession> {
        self.sessions.get(player)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionRecorder for DataSessionRecorder {
    fn on_rotation(&mut self, player: Uuid, yaw: f32, pitch: f32) {
        if let Some(session) = self.sessions.get_mut(&player) {
            session.process_tick(yaw, pitch);
        }
    }

    fn on_attack(&mut self, player: Uuid) {
        if let Some(session) = self.sessions.get_mut(&player) {
            session.on_attack();
        }
    }

    fn on_quit(&mut self, player: Uuid) {
        if let Err(e) = self.stop(&player) {
            log::warn!("Failed to save recording for {}: {}", player, e);
        }
    }

    fn shutdown(&mut self) {
        let written = self.stop_all();
        if !written.is_empty() {
            log::info!("Saved {} recording(s) on shutdown", written.len());
        }
    }
}
