//! Protocol timing configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Phase deadlines of a DKG round, as multiples of λ from the round start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseMultiples {
    /// Propose `MpkReady`; candidates are frozen once the board is ready
    pub mpk_ready: f64,
    /// Propose NACKs for missing shares
    pub nack: f64,
    /// Snapshot complaints; later complaints are ignored
    pub complaint_cutoff: f64,
    /// Stop waiting for anti-nack rebuttals
    pub finalize: f64,
}

impl Default for PhaseMultiples {
    fn default() -> Self {
        Self {
            mpk_ready: 1.0,
            nack: 2.0,
            complaint_cutoff: 2.5,
            finalize: 3.5,
        }
    }
}

/// Configuration shared by every node of the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgConfig {
    /// λ, the DKG timing unit
    pub lambda: Duration,

    /// Phase deadlines in multiples of λ
    pub phases: PhaseMultiples,

    /// How long to wait for a finalize quorum on the bulletin board
    pub finalize_timeout: Duration,

    /// How long `run_tsig` waits for `k+1` partial signatures
    pub tsig_timeout: Duration,

    /// Polling interval for bulletin board conditions
    pub poll_interval: Duration,
}

impl Default for DkgConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl DkgConfig {
    /// Create a configuration with default phase multiples for `lambda`
    pub fn new(lambda: Duration) -> Self {
        Self {
            lambda,
            phases: PhaseMultiples::default(),
            finalize_timeout: lambda * 10,
            tsig_timeout: Duration::from_secs(5),
            poll_interval: lambda / 20,
        }
    }

    pub fn with_tsig_timeout(mut self, timeout: Duration) -> Self {
        self.tsig_timeout = timeout;
        self
    }

    pub fn with_phases(mut self, phases: PhaseMultiples) -> Self {
        self.phases = phases;
        self
    }

    /// Check durations are usable and phases strictly increase
    pub fn validate(&self) -> Result<()> {
        if self.lambda.is_zero() {
            return Err(Error::InvalidConfig("lambda must be positive".into()));
        }
        if self.tsig_timeout.is_zero() || self.finalize_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".into()));
        }

        let p = &self.phases;
        let ordered = [p.mpk_ready, p.nack, p.complaint_cutoff, p.finalize];
        if ordered.iter().any(|m| !m.is_finite() || *m <= 0.0) {
            return Err(Error::InvalidConfig(
                "phase multiples must be positive".into(),
            ));
        }
        if ordered.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig(
                "phase multiples must be strictly increasing".into(),
            ));
        }

        Ok(())
    }

    pub fn mpk_ready_offset(&self) -> Duration {
        self.lambda.mul_f64(self.phases.mpk_ready)
    }

    pub fn nack_offset(&self) -> Duration {
        self.lambda.mul_f64(self.phases.nack)
    }

    pub fn complaint_cutoff_offset(&self) -> Duration {
        self.lambda.mul_f64(self.phases.complaint_cutoff)
    }

    pub fn finalize_offset(&self) -> Duration {
        self.lambda.mul_f64(self.phases.finalize)
    }
}
