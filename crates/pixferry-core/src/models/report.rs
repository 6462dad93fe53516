use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;
use uuid::Uuid;

use super::PhaseName;

/// Per-phase execution summary returned by every phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: PhaseName,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// False when the phase could not start (configuration or environment
    /// problem). Per-file failures do not clear this.
    pub started: bool,
    pub error: Option<String>,
}

impl PhaseOutcome {
    pub fn new(phase: PhaseName) -> Self {
        Self {
            phase,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            duration: Duration::ZERO,
            started: true,
            error: None,
        }
    }

    /// Outcome for a phase whose toggle is off: a no-op pass-through.
    pub fn disabled(phase: PhaseName) -> Self {
        Self {
            skipped: 1,
            ..Self::new(phase)
        }
    }

    /// Outcome for a phase that failed to start.
    pub fn failed_to_start(phase: PhaseName, error: String) -> Self {
        Self {
            started: false,
            error: Some(error),
            ..Self::new(phase)
        }
    }
}

impl Display for PhaseOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if !self.started {
            return write!(
                f,
                "{:<14} FAILED TO START: {}",
                self.phase.to_string(),
                self.error.as_deref().unwrap_or("unknown")
            );
        }
        write!(
            f,
            "{:<14} processed={} succeeded={} failed={} skipped={} in {:.1}s",
            self.phase.to_string(),
            self.processed,
            self.succeeded,
            self.failed,
            self.skipped,
            self.duration.as_secs_f64()
        )
    }
}

/// Aggregate report for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<PhaseOutcome>,
    /// Files now sitting at status `error`.
    pub error_file_ids: Vec<Uuid>,
    /// Whether the remote mirror queue drained by the end of the run.
    pub mirror_caught_up: bool,
}

impl RunReport {
    /// Process exit code: 0 when every enabled phase started, 1 when any
    /// phase failed to start. Per-file errors never affect the exit code.
    pub fn exit_code(&self) -> i32 {
        if self.outcomes.iter().any(|o| !o.started) {
            1
        } else {
            0
        }
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        writeln!(f, "pipeline run report")?;
        for outcome in &self.outcomes {
            writeln!(f, "  {}", outcome)?;
        }
        if self.error_file_ids.is_empty() {
            writeln!(f, "  no files in error")?;
        } else {
            writeln!(f, "  files in error: {}", self.error_file_ids.len())?;
            for id in &self.error_file_ids {
                writeln!(f, "    {}", id)?;
            }
        }
        write!(
            f,
            "  remote mirror: {}",
            if self.mirror_caught_up {
                "caught up"
            } else {
                "behind"
            }
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_reflects_start_failures_only() {
        let mut report = RunReport {
            outcomes: vec![PhaseOutcome::new(PhaseName::Dedupe)],
            error_file_ids: vec![Uuid::new_v4()],
            mirror_caught_up: true,
        };
        // Per-file errors do not fail the run.
        assert_eq!(report.exit_code(), 0);

        report.outcomes.push(PhaseOutcome::failed_to_start(
            PhaseName::SyncPixel,
            "sync timeout".into(),
        ));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_outcome_serialization_round_trip() {
        let outcome = PhaseOutcome {
            duration: Duration::from_millis(1500),
            processed: 10,
            ..PhaseOutcome::new(PhaseName::Compress)
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: PhaseOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.processed, 10);
        assert!((back.duration.as_secs_f64() - 1.5).abs() < 1e-9);
    }
}
