//! Host key verification policy

use burrow_core::TunnelError;
use tracing::{debug, warn};

/// How a presented host key is judged.
///
/// Built from a validated configuration, so the strict-without-fingerprint
/// contradiction can no longer occur here.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Exact fingerprint match required; mismatch is fatal
    Strict { fingerprint: String },
    /// Accept whatever is presented; trust-on-first-use is delegated to the
    /// transport layer
    Tofu,
}

impl HostKeyPolicy {
    /// Derive the policy from the config fields.
    ///
    /// Assumes `validate()` has run: strict checking always comes with a
    /// pinned fingerprint by the time a tunnel starts.
    pub fn from_config(strict: bool, fingerprint: Option<&str>) -> Self {
        match (strict, fingerprint) {
            (true, Some(fp)) => HostKeyPolicy::Strict {
                fingerprint: fp.to_string(),
            },
            _ => HostKeyPolicy::Tofu,
        }
    }
}

/// Validates the remote host identity during the SSH handshake.
#[derive(Debug, Clone)]
pub struct HostVerifier {
    host: String,
    policy: HostKeyPolicy,
}

impl HostVerifier {
    pub fn new(host: impl Into<String>, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            policy,
        }
    }

    /// Judge a presented fingerprint.
    ///
    /// A strict mismatch is fatal: retrying blindly would mask a spoofing
    /// attack, so the caller parks the tunnel instead of backing off.
    pub fn verify(&self, presented: &str) -> Result<(), TunnelError> {
        match &self.policy {
            HostKeyPolicy::Strict { fingerprint } => {
                if presented == fingerprint {
                    debug!(host = %self.host, "host key verified against pinned fingerprint");
                    Ok(())
                } else {
                    warn!(
                        host = %self.host,
                        expected = %fingerprint,
                        presented = %presented,
                        "host key mismatch, rejecting connection"
                    );
                    Err(TunnelError::HostKeyMismatch {
                        host: self.host.clone(),
                        expected: fingerprint.clone(),
                        presented: presented.to_string(),
                    })
                }
            }
            HostKeyPolicy::Tofu => {
                debug!(host = %self.host, fingerprint = %presented, "accepting host key (strict checking disabled)");
                Ok(())
            }
        }
    }
}
