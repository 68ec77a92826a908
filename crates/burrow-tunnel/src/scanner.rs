//! Remote port scanner: probes the remote host's listening TCP ports over
//! the shared session and debounces presence changes before the set acts.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use burrow_core::TunnelError;

use crate::transport::SshTransport;

/// Probe executed over the shared session. `ss` is preferred; older hosts
/// fall back to `netstat`. Both output shapes are accepted by the parser.
pub const PROBE_COMMAND: &str = "ss -ltnH 2>/dev/null || netstat -tln 2>/dev/null";

/// Run one scan over the session and return the listening port set.
pub async fn scan<T: SshTransport + ?Sized>(transport: &T) -> Result<BTreeSet<u16>, TunnelError> {
    let output = transport.exec(PROBE_COMMAND).await?;
    let ports = parse_listening_ports(&output);
    trace!(count = ports.len(), "remote port scan complete");
    Ok(ports)
}

/// Extract listening ports from `ss -ltnH` or `netstat -tln` output.
///
/// Lenient by design: header lines, unix sockets, and anything else that
/// does not carry a parsable local address column is skipped. Ports are
/// deduplicated across address families.
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let local = match fields.first() {
            // ss -ltnH: LISTEN 0 128 0.0.0.0:22 0.0.0.0:*
            Some(&"LISTEN") if fields.len() >= 4 => fields[3],
            // netstat -tln: tcp 0 0 0.0.0.0:22 0.0.0.0:* LISTEN
            Some(proto) if proto.starts_with("tcp") && fields.len() >= 6 => {
                if fields[5] != "LISTEN" {
                    continue;
                }
                fields[3]
            }
            _ => continue,
        };
        if let Some(port) = parse_port(local) {
            ports.insert(port);
        }
    }
    ports
}

/// Parse the port out of `0.0.0.0:22`, `[::]:22`, `*:22`, or `:::22`.
fn parse_port(local_addr: &str) -> Option<u16> {
    let (_, port) = local_addr.rsplit_once(':')?;
    port.parse().ok()
}

/// Net change produced by one scan observation
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortDelta {
    /// Ports newly confirmed present across the debounce window
    pub added: Vec<u16>,
    /// Ports confirmed absent across the debounce window
    pub removed: Vec<u16>,
}

impl PortDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Decouples "port observed" from "port admitted".
///
/// A new port must be present on two scans spanning at least the debounce
/// window before it is admitted; an admitted port must stay absent for the
/// window before it is dropped. Any flip in between resets the pending
/// window, so a rapidly rebinding remote service causes no churn.
///
/// The caller injects `now`, which keeps the tracker pure and the tests
/// deterministic.
#[derive(Debug)]
pub struct DebounceTracker {
    debounce: Duration,
    admitted: BTreeSet<u16>,
    pending_add: HashMap<u16, Instant>,
    pending_remove: HashMap<u16, Instant>,
}

impl DebounceTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            admitted: BTreeSet::new(),
            pending_add: HashMap::new(),
            pending_remove: HashMap::new(),
        }
    }

    /// Ports currently admitted (debounce-confirmed present)
    pub fn admitted(&self) -> &BTreeSet<u16> {
        &self.admitted
    }

    /// Feed one scan result. Returns the confirmed changes.
    pub fn observe(&mut self, now: Instant, present: &BTreeSet<u16>) -> PortDelta {
        let mut delta = PortDelta::default();

        // A present port cancels any pending removal; an absent one cancels
        // any pending admission. Flips restart the window from scratch.
        self.pending_add.retain(|port, _| present.contains(port));
        self.pending_remove.retain(|port, _| !present.contains(port));

        for &port in present {
            if self.admitted.contains(&port) {
                continue;
            }
            match self.pending_add.get(&port) {
                Some(&first_seen) if now.duration_since(first_seen) >= self.debounce => {
                    self.pending_add.remove(&port);
                    self.admitted.insert(port);
                    delta.added.push(port);
                }
                Some(_) => {}
                None => {
                    self.pending_add.insert(port, now);
                }
            }
        }

        let absent: Vec<u16> = self
            .admitted
            .iter()
            .copied()
            .filter(|port| !present.contains(port))
            .collect();
        for port in absent {
            match self.pending_remove.get(&port) {
                Some(&first_missing) if now.duration_since(first_missing) >= self.debounce => {
                    self.pending_remove.remove(&port);
                    self.admitted.remove(&port);
                    delta.removed.push(port);
                }
                Some(_) => {}
                None => {
                    self.pending_remove.insert(port, now);
                }
            }
        }

        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_OUTPUT: &str = "\
LISTEN 0      128          0.0.0.0:22        0.0.0.0:*
LISTEN 0      511          0.0.0.0:80        0.0.0.0:*
LISTEN 0      128             [::]:22           [::]:*
LISTEN 0      4096       127.0.0.1:5432      0.0.0.0:*
";

    const NETSTAT_OUTPUT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
tcp        0      0 127.0.0.1:6379          0.0.0.0:*               LISTEN
tcp6       0      0 :::80                   :::*                    LISTEN
";

    fn set(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    #[test]
    fn parses_ss_output() {
        assert_eq!(parse_listening_ports(SS_OUTPUT), set(&[22, 80, 5432]));
    }

    #[test]
    fn parses_netstat_output() {
        assert_eq!(parse_listening_ports(NETSTAT_OUTPUT), set(&[22, 80, 6379]));
    }

    #[test]
    fn ignores_garbage_lines() {
        let output = "bash: ss: command not found\nsome noise\nLISTEN 0 128 nonsense\n";
        assert!(parse_listening_ports(output).is_empty());
    }

    #[test]
    fn empty_output_is_empty_set() {
        assert!(parse_listening_ports("").is_empty());
    }

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn admission_needs_two_scans_spanning_the_window() {
        let mut tracker = DebounceTracker::new(WINDOW);
        let t0 = Instant::now();

        // First sighting only opens the window.
        assert!(tracker.observe(t0, &set(&[8080])).is_empty());
        // Second scan too soon: still pending.
        assert!(tracker.observe(t0 + WINDOW / 2, &set(&[8080])).is_empty());
        // Confirmed once the window has elapsed.
        let delta = tracker.observe(t0 + WINDOW, &set(&[8080]));
        assert_eq!(delta.added, vec![8080]);
        assert_eq!(tracker.admitted(), &set(&[8080]));
    }

    #[test]
    fn admission_is_idempotent() {
        let mut tracker = DebounceTracker::new(WINDOW);
        let t0 = Instant::now();
        tracker.observe(t0, &set(&[8080]));
        tracker.observe(t0 + WINDOW, &set(&[8080]));

        for i in 2..10 {
            let delta = tracker.observe(t0 + WINDOW * i, &set(&[8080]));
            assert!(delta.is_empty(), "spurious delta on scan {}", i);
            assert_eq!(tracker.admitted(), &set(&[8080]));
        }
    }

    #[test]
    fn flapping_port_is_never_admitted() {
        let mut tracker = DebounceTracker::new(WINDOW);
        let t0 = Instant::now();
        let step = WINDOW / 4;

        // Appears, disappears, reappears, all faster than the window.
        assert!(tracker.observe(t0, &set(&[9000])).is_empty());
        assert!(tracker.observe(t0 + step, &set(&[])).is_empty());
        assert!(tracker.observe(t0 + step * 2, &set(&[9000])).is_empty());
        // Even well past the original window the port is not admitted,
        // because the absence reset the pending window.
        assert!(tracker.observe(t0 + step * 3, &set(&[])).is_empty());
        assert!(tracker.admitted().is_empty());
    }

    #[test]
    fn removal_needs_sustained_absence() {
        let mut tracker = DebounceTracker::new(WINDOW);
        let t0 = Instant::now();
        tracker.observe(t0, &set(&[8080]));
        tracker.observe(t0 + WINDOW, &set(&[8080]));
        assert_eq!(tracker.admitted(), &set(&[8080]));

        // Transient gap shorter than the window: child survives.
        assert!(tracker.observe(t0 + WINDOW * 2, &set(&[])).is_empty());
        assert!(tracker
            .observe(t0 + WINDOW * 2 + WINDOW / 2, &set(&[8080]))
            .is_empty());
        assert_eq!(tracker.admitted(), &set(&[8080]));

        // Sustained absence: removed.
        assert!(tracker.observe(t0 + WINDOW * 4, &set(&[])).is_empty());
        let delta = tracker.observe(t0 + WINDOW * 5, &set(&[]));
        assert_eq!(delta.removed, vec![8080]);
        assert!(tracker.admitted().is_empty());
    }
}
