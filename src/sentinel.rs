//! The orchestrator: certifies units in the chamber, monitors certified
//! units, and ejects violators from the ledger.
//!
//! Per unit the logical lifecycle is
//! `Untested -> {Certified | Rejected}` through [`Sentinel::certify`], then
//! `Certified -> {Operating | Ejected}` through repeated
//! [`Sentinel::monitor`] calls. Ejection is terminal for an identifier:
//! the ledger remembers it, no rollback restores it, and only a fresh
//! certification lets it back in.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chamber::{Chamber, ChamberLimits, ChamberOutcome, Containment, INPUT_FILE};
use crate::config::SentinelConfig;
use crate::identity::{sovereign_id, IdentityError, SovereignId};
use crate::ledger::{Ledger, LedgerError};
use crate::metrics::{calculate_vp, StabilityCenter, StabilityEnvelope, TraitVector};
use crate::narrator::TraitNarrator;
use crate::unit::Unit;

/// Variance below which a trailing VP window counts as stable.
pub const STABILITY_VARIANCE: f64 = 0.1;

/// Errors that abort an orchestrator call.
#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    /// Ledger mutation failed; the unit was not recorded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The unit's identifier could not be derived.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Runs one trial of a command against one input.
#[async_trait]
pub trait TrialRunner: Send + Sync {
    /// Execute `command` with `input` delivered as [`INPUT_FILE`].
    ///
    /// Never fails: chamber problems are reported through outcome flags.
    async fn run_trial(&self, command: &str, input: &str) -> ChamberOutcome;

    /// Limits each trial runs under.
    fn limits(&self) -> ChamberLimits;
}

/// [`TrialRunner`] that gives every input its own fresh [`Chamber`].
#[derive(Debug, Clone)]
pub struct ChamberRunner {
    containment: Arc<dyn Containment>,
    limits: ChamberLimits,
}

impl ChamberRunner {
    /// Create a runner over the selected containment backend.
    pub fn new(containment: Arc<dyn Containment>, limits: ChamberLimits) -> Self {
        Self {
            containment,
            limits,
        }
    }
}

#[async_trait]
impl TrialRunner for ChamberRunner {
    async fn run_trial(&self, command: &str, input: &str) -> ChamberOutcome {
        let chamber = match Chamber::new(self.limits, Arc::clone(&self.containment)) {
            Ok(chamber) => chamber,
            Err(e) => {
                warn!(error = %e, "failed to create chamber");
                return ChamberOutcome::launch_failure(std::time::Duration::ZERO);
            }
        };
        if let Err(e) = chamber.write_file(INPUT_FILE, input.as_bytes()) {
            warn!(error = %e, "failed to deliver trial input");
            chamber.cleanup();
            return ChamberOutcome::launch_failure(std::time::Duration::ZERO);
        }
        let outcome = chamber.run(command).await;
        chamber.cleanup();
        outcome
    }

    fn limits(&self) -> ChamberLimits {
        self.limits
    }
}

/// Which operation produced a VP sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Certification trial.
    Genesis,
    /// Live monitoring of a certified unit.
    Sovereign,
}

/// One entry of the VP history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpSample {
    /// Computed VP.
    pub vp: f64,
    /// Trait vector the VP was computed from.
    pub traits: TraitVector,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Producing operation.
    pub phase: Phase,
}

/// Result of [`Sentinel::run_experiment`].
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    /// Every input terminated lawfully with VP below threshold.
    pub certified: bool,
    /// VP per input, in input order, regardless of verdict.
    pub vp_values: Vec<f64>,
    /// Trait vector per input.
    pub traits: Vec<TraitVector>,
    /// Lawful termination per input.
    pub lawful: Vec<bool>,
}

/// Certification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Accepted and recorded in the ledger.
    Certified,
    /// Not accepted.
    Rejected,
}

/// Immutable record of one certification attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificationRecord {
    /// Identifier derived from the unit definition.
    pub identifier: SovereignId,
    /// Trait vectors measured, one per input.
    pub traits: Vec<TraitVector>,
    /// VP per input.
    pub vp_values: Vec<f64>,
    /// Outcome.
    pub verdict: Verdict,
    /// Whether this attempt added the identifier to the ledger (false if
    /// it was already present or the unit was rejected).
    pub newly_recorded: bool,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

/// Result of [`Sentinel::monitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorVerdict {
    /// VP exceeded the threshold (or was not a number).
    pub violation: bool,
    /// Computed VP.
    pub vp: f64,
}

/// What [`Sentinel::handle_violation`] did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ejection {
    /// The identifier was not in the current version; nothing changed.
    NotPresent,
    /// The ledger rolled back one version; ejected identifiers the
    /// previous version still listed were written out in a new version.
    RolledBack {
        /// Version now current.
        version: String,
    },
    /// A new version without the identifier was written.
    Retracted {
        /// Version now current.
        version: String,
    },
}

/// Orchestrator over a ledger and a trial runner.
pub struct Sentinel {
    ledger: Ledger,
    runner: Arc<dyn TrialRunner>,
    narrator: Arc<dyn TraitNarrator>,
    settings: SentinelConfig,
    history: Vec<VpSample>,
    records: Vec<CertificationRecord>,
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel")
            .field("ledger", &self.ledger)
            .field("vp_threshold", &self.settings.vp_threshold)
            .field("history", &self.history.len())
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl Sentinel {
    /// Create an orchestrator.
    pub fn new(
        ledger: Ledger,
        runner: Arc<dyn TrialRunner>,
        narrator: Arc<dyn TraitNarrator>,
        settings: SentinelConfig,
    ) -> Self {
        Self {
            ledger,
            runner,
            narrator,
            settings,
            history: Vec::new(),
            records: Vec::new(),
        }
    }

    /// The ledger this orchestrator mutates.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// VP samples in the order they were taken.
    pub fn history(&self) -> &[VpSample] {
        &self.history
    }

    /// Certification attempts in the order they were made.
    pub fn records(&self) -> &[CertificationRecord] {
        &self.records
    }

    /// Configured VP threshold.
    pub fn vp_threshold(&self) -> f64 {
        self.settings.vp_threshold
    }

    /// Run `command` against each input in order, each in a fresh chamber.
    ///
    /// `certified` requires at least one input, every run terminated
    /// lawfully, and every VP strictly below the threshold. All inputs run
    /// even after one fails, so the caller can diagnose partial failure.
    pub async fn run_experiment(
        &mut self,
        command: &str,
        inputs: &[String],
        center: &StabilityCenter,
        envelope: &StabilityEnvelope,
    ) -> Experiment {
        let limits = self.runner.limits();
        let mut experiment = Experiment {
            certified: !inputs.is_empty(),
            vp_values: Vec::with_capacity(inputs.len()),
            traits: Vec::with_capacity(inputs.len()),
            lawful: Vec::with_capacity(inputs.len()),
        };

        if inputs.is_empty() {
            warn!(command, "no test inputs, refusing to certify without evidence");
        }

        for (index, input) in inputs.iter().enumerate() {
            let outcome = self.runner.run_trial(command, input).await;
            let traits = measure(&outcome, &limits);
            let vp = calculate_vp(&traits, center, envelope, None);
            let lawful = outcome.terminated_lawfully();

            debug!(
                index,
                vp,
                lawful,
                traits = %self.narrator.explain(&traits).join(", "),
                "trial finished"
            );
            if outcome.launch_failed {
                warn!(index, command, "trial could not be launched");
            }

            let below_threshold = matches!(
                vp.partial_cmp(&self.settings.vp_threshold),
                Some(Ordering::Less)
            );
            if !lawful || !below_threshold {
                experiment.certified = false;
            }
            self.record_sample(vp, traits.clone(), Phase::Genesis);
            experiment.vp_values.push(vp);
            experiment.traits.push(traits);
            experiment.lawful.push(lawful);
        }

        info!(
            command,
            inputs = inputs.len(),
            certified = experiment.certified,
            "experiment finished"
        );
        experiment
    }

    /// Run the experiment for `unit` and record it in the ledger on success.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::Ledger`] if the unit passed but could not be
    /// recorded; the certification is void in that case.
    pub async fn certify(
        &mut self,
        unit: &Unit,
        center: &StabilityCenter,
        envelope: &StabilityEnvelope,
    ) -> Result<CertificationRecord, SentinelError> {
        let identifier = sovereign_id(&unit.definition())?;
        let experiment = self
            .run_experiment(&unit.command, &unit.inputs, center, envelope)
            .await;

        let (verdict, newly_recorded) = if experiment.certified {
            let added = self.ledger.amend(&identifier)?;
            (Verdict::Certified, added)
        } else {
            (Verdict::Rejected, false)
        };

        let record = CertificationRecord {
            identifier,
            traits: experiment.traits,
            vp_values: experiment.vp_values,
            verdict,
            newly_recorded,
            timestamp: Utc::now(),
        };
        info!(
            id = %record.identifier,
            verdict = ?record.verdict,
            newly_recorded,
            "certification recorded"
        );
        self.records.push(record.clone());
        Ok(record)
    }

    /// Check pre-measured operation traits of a certified unit.
    ///
    /// A VP above the threshold, or a VP that is not a number, is a violation.
    pub fn monitor(
        &mut self,
        traits: &TraitVector,
        center: &StabilityCenter,
        envelope: &StabilityEnvelope,
    ) -> MonitorVerdict {
        let vp = calculate_vp(traits, center, envelope, None);
        let violation = !matches!(
            vp.partial_cmp(&self.settings.vp_threshold),
            Some(Ordering::Less | Ordering::Equal)
        );
        if violation {
            warn!(
                vp,
                threshold = self.settings.vp_threshold,
                traits = %self.narrator.explain(traits).join(", "),
                "operation outside stability envelope"
            );
        } else {
            debug!(vp, "operation within stability envelope");
        }
        self.record_sample(vp, traits.clone(), Phase::Sovereign);
        MonitorVerdict { violation, vp }
    }

    /// Eject `id` and revert to the last known-good ledger state.
    ///
    /// Records the ejection, then rolls back one version. The rollback
    /// never restores an ejected identifier. If there was nothing to roll
    /// back to, writes a new version without `id`. The ejection holds once
    /// this returns `Ok`, including across later rollbacks.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::Ledger`] if the ledger cannot be updated.
    pub fn handle_violation(&mut self, id: &SovereignId) -> Result<Ejection, SentinelError> {
        if !self.ledger.contains(id) {
            info!(id = %id, "violating identifier not in ledger, nothing to eject");
            return Ok(Ejection::NotPresent);
        }

        self.ledger.record_ejection(id)?;
        let rolled_back = self.ledger.rollback()?;
        if rolled_back && !self.ledger.contains(id) {
            let version = self.ledger.current_version().unwrap_or_default().to_owned();
            warn!(id = %id, version = %version, "ejected by rollback");
            return Ok(Ejection::RolledBack { version });
        }

        self.ledger.retract(id)?;
        let version = self.ledger.current_version().unwrap_or_default().to_owned();
        warn!(id = %id, version = %version, "ejected by retraction");
        Ok(Ejection::Retracted { version })
    }

    /// Whether the VP history has settled.
    ///
    /// True once at least `critical_mass_sample_size` samples exist and the
    /// population variance of that many most recent VPs is below
    /// [`STABILITY_VARIANCE`].
    pub fn critical_mass(&self) -> bool {
        let window = self.settings.critical_mass_sample_size;
        if window == 0 || self.history.len() < window {
            return false;
        }
        let start = self.history.len().saturating_sub(window);
        let recent: Vec<f64> = self
            .history
            .get(start..)
            .unwrap_or_default()
            .iter()
            .map(|sample| sample.vp)
            .collect();
        variance(&recent).is_some_and(|v| v < STABILITY_VARIANCE)
    }

    fn record_sample(&mut self, vp: f64, traits: TraitVector, phase: Phase) {
        self.history.push(VpSample {
            vp,
            traits,
            timestamp: Utc::now(),
            phase,
        });
    }
}

/// Derive the trait vector of one trial.
///
/// A run flagged for exceeding resources reports at least the memory
/// ceiling, since sampling may have missed the spike that got it killed.
pub fn measure(outcome: &ChamberOutcome, limits: &ChamberLimits) -> TraitVector {
    let mut memory_mb = outcome.usage.memory_mb();
    if outcome.resource_exceeded {
        memory_mb = memory_mb.max(limits.memory_mb());
    }
    TraitVector::from([
        (
            "speed_ms".to_owned(),
            outcome.wall_time.as_secs_f64() * 1000.0,
        ),
        ("memory_mb".to_owned(), memory_mb),
        (
            "reliability".to_owned(),
            if outcome.timed_out { 0.0 } else { 1.0 },
        ),
    ])
}

/// Population variance; `None` for an empty or non-finite sample.
fn variance(values: &[f64]) -> Option<f64> {
    let count = u32::try_from(values.len()).ok().filter(|n| *n > 0)?;
    let n = f64::from(count);
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.is_finite().then_some(var)
}
