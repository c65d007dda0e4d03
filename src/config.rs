//! Client configuration
//!
//! Controls which optional attributes go into outgoing requests and how
//! patiently each probe waits for an answer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// SOFTWARE value sent when none is configured
pub const DEFAULT_SOFTWARE_NAME: &str = concat!("natprobe/", env!("CARGO_PKG_VERSION"));

/// Default number of transmissions per probe
const DEFAULT_ATTEMPTS: u32 = 9;

/// Default first retransmission timeout (RFC 3489 section 9.3)
const DEFAULT_INITIAL_TIMEOUT_MS: u64 = 100;

/// Default retransmission timeout ceiling
const DEFAULT_MAX_TIMEOUT_MS: u64 = 1600;

/// Retransmission schedule for one probe
///
/// The same request is sent up to `attempts` times. The wait after each
/// transmission starts at `initial_timeout_ms` and doubles, capped at
/// `max_timeout_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbePolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_initial_timeout_ms")]
    pub initial_timeout_ms: u64,

    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_initial_timeout_ms() -> u64 {
    DEFAULT_INITIAL_TIMEOUT_MS
}

fn default_max_timeout_ms() -> u64 {
    DEFAULT_MAX_TIMEOUT_MS
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_timeout_ms: DEFAULT_INITIAL_TIMEOUT_MS,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT_MS,
        }
    }
}

impl ProbePolicy {
    pub fn new(attempts: u32, initial_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            attempts,
            initial_timeout_ms: initial_timeout.as_millis() as u64,
            max_timeout_ms: max_timeout.as_millis() as u64,
        }
    }

    /// Per-attempt timeouts, in transmission order
    pub fn timeouts(&self) -> impl Iterator<Item = Duration> {
        let max = self.max_timeout_ms.max(self.initial_timeout_ms);
        let mut next = self.initial_timeout_ms;

        (0..self.attempts).map(move |_| {
            let current = next;
            next = next.saturating_mul(2).min(max);
            Duration::from_millis(current)
        })
    }

    /// Worst-case time spent on a probe that never gets an answer
    pub fn total_timeout(&self) -> Duration {
        self.timeouts().sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.attempts == 0 {
            return Err("Probe attempts must be at least 1".to_string());
        }
        if self.initial_timeout_ms == 0 {
            return Err("Probe timeout must be greater than 0 ms".to_string());
        }
        if self.max_timeout_ms < self.initial_timeout_ms {
            return Err(format!(
                "Maximum probe timeout ({} ms) is below the initial timeout ({} ms)",
                self.max_timeout_ms, self.initial_timeout_ms
            ));
        }
        Ok(())
    }
}

/// STUN client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Attach a SOFTWARE attribute to requests
    #[serde(default = "default_true")]
    pub software: bool,

    /// Attach a FINGERPRINT attribute to requests
    #[serde(default = "default_true")]
    pub fingerprint: bool,

    /// Value of the SOFTWARE attribute
    #[serde(default = "default_software_name")]
    pub software_name: String,

    /// Schedule for probes that expect an answer (binding requests)
    #[serde(default)]
    pub probe: ProbePolicy,

    /// Schedule for filtering probes, where silence is a result
    #[serde(default)]
    pub filter_probe: ProbePolicy,
}

fn default_true() -> bool {
    true
}

fn default_software_name() -> String {
    DEFAULT_SOFTWARE_NAME.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            software: true,
            fingerprint: true,
            software_name: default_software_name(),
            probe: ProbePolicy::default(),
            filter_probe: ProbePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Use one schedule for every probe
    pub fn with_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe = policy;
        self.filter_probe = policy;
        self
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), String> {
        self.probe.validate()?;
        self.filter_probe.validate()?;

        if self.software && self.software_name.len() > 763 {
            return Err(format!(
                "SOFTWARE value is {} bytes, at most 763 are allowed",
                self.software_name.len()
            ));
        }
        Ok(())
    }
}
