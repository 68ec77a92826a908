//! Tunnel and tunnel-set configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_ms;
use crate::error::ConfigError;
use crate::filter::PortFilter;
use crate::types::TunnelId;

/// SSH endpoint the tunnel connects out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshEndpoint {
    /// Hostname or address of the SSH server
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Username for authentication
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    whoami::username()
}

impl SshEndpoint {
    /// `host:port` form used for dialing and log context
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolved credential for the SSH endpoint.
///
/// Where the credential is stored and how it is edited is an external
/// concern; burrow only consumes the resolved value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },
    /// Private key authentication, optionally passphrase-protected
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// Timing knobs shared by singles and sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Connect + handshake timeout
    #[serde(with = "duration_ms")]
    pub connect_timeout_ms: Duration,

    /// Interval between session liveness probes
    #[serde(with = "duration_ms")]
    pub keepalive_interval_ms: Duration,

    /// First reconnect delay
    #[serde(with = "duration_ms")]
    pub backoff_base_ms: Duration,

    /// Reconnect delay ceiling
    #[serde(with = "duration_ms")]
    pub backoff_max_ms: Duration,

    /// How long stop() waits for in-flight forwarders to drain
    #[serde(with = "duration_ms")]
    pub drain_grace_ms: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Duration::from_secs(10),
            keepalive_interval_ms: Duration::from_secs(15),
            backoff_base_ms: Duration::from_millis(500),
            backoff_max_ms: Duration::from_secs(30),
            drain_grace_ms: Duration::from_secs(5),
        }
    }
}

/// Configuration for a single fixed-port tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Stable identifier
    #[serde(default = "TunnelId::random")]
    pub id: TunnelId,

    /// Human-readable name
    pub name: String,

    /// Started automatically by `run`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local target address the forwarder dials
    #[serde(default = "default_loopback")]
    pub local_addr: String,

    /// Local target port
    pub local_port: u16,

    /// Address the remote listener binds on the SSH server side
    #[serde(default = "default_loopback")]
    pub remote_bind_addr: String,

    /// Remote listener port
    pub remote_port: u16,

    /// SSH server to connect through
    pub ssh: SshEndpoint,

    /// Resolved credential
    pub auth: AuthMethod,

    /// Explicit consent for binding the remote listener on a wildcard address
    #[serde(default)]
    pub allow_public_bind: bool,

    /// Require the presented host key to match the pinned fingerprint
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Pinned SHA256 fingerprint, required when strict checking is on
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    /// Timing parameters
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_true() -> bool {
    true
}

fn default_loopback() -> String {
    "127.0.0.1".to_string()
}

/// Is this bind address reachable from outside the SSH server?
pub fn is_public_bind(addr: &str) -> bool {
    matches!(addr, "0.0.0.0" | "::" | "[::]" | "*")
}

impl TunnelConfig {
    /// Validate at creation/update time. Nothing invalid may reach the
    /// running state machine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_common(
            &self.name,
            &self.ssh,
            &self.remote_bind_addr,
            self.allow_public_bind,
            self.strict_host_key_checking,
            self.host_key_fingerprint.as_deref(),
        )?;
        if self.local_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel '{}': local_port must be non-zero",
                self.name
            )));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel '{}': remote_port must be non-zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Local dial target as `host:port`
    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }
}

/// Scanner timing for full mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Interval between remote port scans
    #[serde(with = "duration_ms")]
    pub scan_interval_ms: Duration,

    /// Minimum persistence of a presence change before it is acted on
    #[serde(with = "duration_ms")]
    pub debounce_ms: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: Duration::from_secs(5),
            debounce_ms: Duration::from_secs(2),
        }
    }
}

/// Configuration for a full-mode tunnel set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSetConfig {
    /// Stable identifier
    #[serde(default = "TunnelId::random")]
    pub id: TunnelId,

    /// Human-readable name
    pub name: String,

    /// Started automatically by `run`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local target address; admitted remote port p forwards to `local_addr:p`
    #[serde(default = "default_loopback")]
    pub local_addr: String,

    /// Address child listeners bind on the SSH server side
    #[serde(default = "default_loopback")]
    pub remote_bind_addr: String,

    /// SSH server to connect through
    pub ssh: SshEndpoint,

    /// Resolved credential
    pub auth: AuthMethod,

    /// Explicit consent for binding child listeners on a wildcard address
    #[serde(default)]
    pub allow_public_bind: bool,

    /// Require the presented host key to match the pinned fingerprint
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Pinned SHA256 fingerprint, required when strict checking is on
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,

    /// Timing parameters
    #[serde(default)]
    pub timing: TimingConfig,

    /// Scanner timing
    #[serde(default)]
    pub scan: ScanConfig,

    /// Port admission filter
    #[serde(default)]
    pub filter: PortFilter,
}

impl TunnelSetConfig {
    /// Validate at creation/update time.
    ///
    /// An include filter with an empty port list is valid: it means
    /// "forward nothing".
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_common(
            &self.name,
            &self.ssh,
            &self.remote_bind_addr,
            self.allow_public_bind,
            self.strict_host_key_checking,
            self.host_key_fingerprint.as_deref(),
        )?;
        if self.scan.scan_interval_ms.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "set '{}': scan_interval_ms must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

fn validate_common(
    name: &str,
    ssh: &SshEndpoint,
    remote_bind_addr: &str,
    allow_public_bind: bool,
    strict: bool,
    fingerprint: Option<&str>,
) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::MissingField("name".into()));
    }
    if ssh.host.trim().is_empty() {
        return Err(ConfigError::MissingField("ssh.host".into()));
    }
    if ssh.username.trim().is_empty() {
        return Err(ConfigError::MissingField("ssh.username".into()));
    }
    if is_public_bind(remote_bind_addr) && !allow_public_bind {
        return Err(ConfigError::PublicBindWithoutConsent(
            remote_bind_addr.to_string(),
        ));
    }
    if strict && fingerprint.map_or(true, |f| f.trim().is_empty()) {
        return Err(ConfigError::StrictWithoutFingerprint);
    }
    Ok(())
}

/// Single or full mode, one session either way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TunnelKind {
    /// One fixed local/remote port pair
    Single(TunnelConfig),
    /// Listener set tracking the remote host's live ports
    Full(TunnelSetConfig),
}

impl TunnelKind {
    pub fn id(&self) -> &TunnelId {
        match self {
            TunnelKind::Single(c) => &c.id,
            TunnelKind::Full(c) => &c.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TunnelKind::Single(c) => &c.name,
            TunnelKind::Full(c) => &c.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            TunnelKind::Single(c) => c.enabled,
            TunnelKind::Full(c) => c.enabled,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            TunnelKind::Single(c) => c.validate(),
            TunnelKind::Full(c) => c.validate(),
        }
    }

    /// Duplicate this configuration under a fresh id.
    pub fn duplicate(&self) -> TunnelKind {
        let mut copy = self.clone();
        match &mut copy {
            TunnelKind::Single(c) => {
                c.id = TunnelId::random();
                c.name = format!("{} (copy)", c.name);
            }
            TunnelKind::Full(c) => {
                c.id = TunnelId::random();
                c.name = format!("{} (copy)", c.name);
            }
        }
        copy
    }
}

/// On-disk configuration file: `[[tunnel]]` and `[[set]]` tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowFile {
    /// Single-mode tunnels
    #[serde(rename = "tunnel")]
    pub tunnels: Vec<TunnelConfig>,

    /// Full-mode tunnel sets
    #[serde(rename = "set")]
    pub sets: Vec<TunnelSetConfig>,
}

impl BurrowFile {
    /// All entries as tagged variants, singles first
    pub fn kinds(&self) -> Vec<TunnelKind> {
        self.tunnels
            .iter()
            .cloned()
            .map(TunnelKind::Single)
            .chain(self.sets.iter().cloned().map(TunnelKind::Full))
            .collect()
    }

    /// Validate every entry, naming the offender on failure
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in self.kinds() {
            kind.validate().map_err(|e| {
                ConfigError::Invalid(format!("'{}': {}", kind.name(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            host: "bastion.example.com".into(),
            port: 22,
            username: "deploy".into(),
        }
    }

    fn single() -> TunnelConfig {
        TunnelConfig {
            id: TunnelId::random(),
            name: "web".into(),
            enabled: true,
            local_addr: "127.0.0.1".into(),
            local_port: 3000,
            remote_bind_addr: "127.0.0.1".into(),
            remote_port: 8080,
            ssh: endpoint(),
            auth: AuthMethod::Password {
                password: "hunter2".into(),
            },
            allow_public_bind: false,
            strict_host_key_checking: false,
            host_key_fingerprint: None,
            timing: TimingConfig::default(),
        }
    }

    fn set() -> TunnelSetConfig {
        TunnelSetConfig {
            id: TunnelId::random(),
            name: "all-ports".into(),
            enabled: true,
            local_addr: "127.0.0.1".into(),
            remote_bind_addr: "127.0.0.1".into(),
            ssh: endpoint(),
            auth: AuthMethod::PrivateKey {
                path: "/home/deploy/.ssh/id_ed25519".into(),
                passphrase: None,
            },
            allow_public_bind: false,
            strict_host_key_checking: false,
            host_key_fingerprint: None,
            timing: TimingConfig::default(),
            scan: ScanConfig::default(),
            filter: PortFilter::default(),
        }
    }

    #[test]
    fn valid_single_passes() {
        single().validate().unwrap();
    }

    #[test]
    fn public_bind_requires_consent() {
        let mut config = single();
        config.remote_bind_addr = "0.0.0.0".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PublicBindWithoutConsent(_))
        ));

        config.allow_public_bind = true;
        config.validate().unwrap();
    }

    #[test]
    fn strict_without_fingerprint_rejected() {
        let mut config = single();
        config.strict_host_key_checking = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StrictWithoutFingerprint)
        ));

        config.host_key_fingerprint = Some("SHA256:abcdef".into());
        config.validate().unwrap();
    }

    #[test]
    fn zero_ports_rejected() {
        let mut config = single();
        config.local_port = 0;
        assert!(config.validate().is_err());

        let mut config = single();
        config.remote_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_include_list_is_valid() {
        let mut config = set();
        config.filter.include_ports_enabled = true;
        config.filter.include_ports = vec![];
        config.validate().unwrap();
    }

    #[test]
    fn duplicate_gets_fresh_identity() {
        let original = TunnelKind::Single(single());
        let copy = original.duplicate();
        assert_ne!(original.id(), copy.id());
        assert_eq!(copy.name(), "web (copy)");
    }

    #[test]
    fn file_round_trips_through_toml() {
        let file = BurrowFile {
            tunnels: vec![single()],
            sets: vec![set()],
        };
        let text = toml::to_string_pretty(&file).unwrap();
        let parsed: BurrowFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tunnels, file.tunnels);
        assert_eq!(parsed.sets, file.sets);
    }

    #[test]
    fn file_validation_names_the_offender() {
        let mut bad = single();
        bad.name = "broken".into();
        bad.remote_bind_addr = "0.0.0.0".into();
        let file = BurrowFile {
            tunnels: vec![bad],
            sets: vec![],
        };
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
