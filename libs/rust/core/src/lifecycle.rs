//! Gateway startup as an ordered run of phases: Config, Registry, ReferenceData,
//! Serving. Each `advance` closes the current phase and publishes the next one to
//! `/status`. Reaching `Serving` reports the per-phase timings and flips readiness.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase { Config, Registry, ReferenceData, Serving }

impl StartupPhase {
    fn successor(self) -> Self {
        match self {
            Self::Config => Self::Registry,
            Self::Registry => Self::ReferenceData,
            Self::ReferenceData | Self::Serving => Self::Serving,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhaseTiming {
    pub phase: StartupPhase,
    pub millis: u64,
}

#[derive(Debug)]
pub struct StartupState {
    phase: StartupPhase,
    started_at: Instant,
    phase_started_at: Instant,
    timings: Vec<PhaseTiming>,
}

impl Default for StartupState {
    fn default() -> Self { Self::new() }
}

impl StartupState {
    pub fn new() -> Self {
        crate::set_status(|s| s.phase = Some(StartupPhase::Config));
        let now = Instant::now();
        Self { phase: StartupPhase::Config, started_at: now, phase_started_at: now, timings: Vec::new() }
    }

    pub fn phase(&self) -> StartupPhase { self.phase }
    pub fn is_ready(&self) -> bool { self.phase == StartupPhase::Serving }

    /// No-op once serving.
    pub fn advance(&mut self) {
        if self.is_ready() {
            return;
        }
        let now = Instant::now();
        self.timings.push(PhaseTiming { phase: self.phase, millis: millis(now - self.phase_started_at) });
        self.phase = self.phase.successor();
        self.phase_started_at = now;
        let phase = self.phase;
        crate::set_status(|s| s.phase = Some(phase));
        debug!(?phase, "startup phase advanced");
        if self.is_ready() {
            let timings = self.timings.clone();
            info!(total_ms = millis(self.started_at.elapsed()), phases = ?timings, "startup complete");
            crate::set_status(|s| s.startup = timings);
            crate::mark_ready();
        }
    }
}

fn millis(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_reaches_serving_and_reports_each_phase() {
        let mut st = StartupState::new();
        assert_eq!(st.phase(), StartupPhase::Config);
        st.advance();
        st.advance();
        assert!(!st.is_ready());
        st.advance();
        assert!(st.is_ready());
        st.advance();
        assert_eq!(st.phase(), StartupPhase::Serving);

        let phases: Vec<_> = st.timings.iter().map(|t| t.phase).collect();
        assert_eq!(phases, vec![StartupPhase::Config, StartupPhase::Registry, StartupPhase::ReferenceData]);
        assert_eq!(crate::status().startup.len(), 3);
        assert!(crate::is_ready());
    }

    #[test]
    fn phases_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&StartupPhase::ReferenceData).unwrap(), "\"reference_data\"");
    }
}
