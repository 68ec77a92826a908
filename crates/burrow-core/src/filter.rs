//! Port admission filter for full-mode tunnel sets

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Filter applied to the scanned remote port set before admission.
///
/// In include mode the observed set is intersected with `include_ports`;
/// an empty include list is valid and admits nothing. Otherwise
/// `exclude_ports` is subtracted from the observed set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortFilter {
    /// Use the include list instead of the exclude list
    pub include_ports_enabled: bool,
    /// Ports to forward when include mode is on
    pub include_ports: Vec<u16>,
    /// Ports never forwarded when include mode is off
    pub exclude_ports: Vec<u16>,
}

impl PortFilter {
    /// Apply the filter to an observed port set.
    pub fn admit(&self, observed: &BTreeSet<u16>) -> BTreeSet<u16> {
        if self.include_ports_enabled {
            let include: BTreeSet<u16> = self.include_ports.iter().copied().collect();
            observed.intersection(&include).copied().collect()
        } else {
            let exclude: BTreeSet<u16> = self.exclude_ports.iter().copied().collect();
            observed.difference(&exclude).copied().collect()
        }
    }
}
