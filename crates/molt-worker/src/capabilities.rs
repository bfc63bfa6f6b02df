//! Operator-granted capability gating: a small enum of gated operator
//! capabilities plus a `require`-returning check function.

use std::collections::HashSet;
use std::env;

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Capability {
    DbRead,
    DbWrite,
    NetOutbound,
    FsRead,
    FsWrite,
}

impl Capability {
    fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "db.read" => Some(Capability::DbRead),
            "db.write" => Some(Capability::DbWrite),
            "net.outbound" => Some(Capability::NetOutbound),
            "fs.read" => Some(Capability::FsRead),
            "fs.write" => Some(Capability::FsWrite),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Capability::DbRead => "db.read",
            Capability::DbWrite => "db.write",
            Capability::NetOutbound => "net.outbound",
            Capability::FsRead => "fs.read",
            Capability::FsWrite => "fs.write",
        }
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability '{0}' was not granted (set MOLT_CAPABILITIES)")]
    NotGranted(&'static str),
    #[error("deterministic mode (MOLT_DETERMINISTIC=1) forbids {0} without an explicit capability grant")]
    DeterministicModeForbids(&'static str),
}

/// The immutable set of capabilities an operator granted this worker
/// process, built once at startup from `MOLT_CAPABILITIES`
/// (comma-separated, e.g. `db.read,db.write,net.outbound`).
#[derive(Clone, Debug)]
pub struct CapabilitySet {
    granted: HashSet<Capability>,
    deterministic: bool,
}

impl CapabilitySet {
    pub fn from_env() -> Self {
        let granted = env::var("MOLT_CAPABILITIES")
            .ok()
            .map(|raw| raw.split(',').filter_map(Capability::parse).collect())
            .unwrap_or_default();
        let deterministic = env::var("MOLT_DETERMINISTIC").as_deref() == Ok("1");
        Self { granted, deterministic }
    }

    pub fn empty() -> Self {
        Self {
            granted: HashSet::new(),
            deterministic: false,
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.granted.insert(capability);
        self
    }

    pub fn require(&self, capability: Capability) -> Result<(), CapabilityError> {
        if self.granted.contains(&capability) {
            Ok(())
        } else {
            Err(CapabilityError::NotGranted(capability.as_str()))
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Handlers performing wall-clock reads, randomness, or outbound
    /// network calls outside their declared data path must consult this
    /// before doing so. A no-op unless deterministic mode is on.
    pub fn deterministic_guard(&self, capability: Capability) -> Result<(), CapabilityError> {
        if !self.deterministic {
            return Ok(());
        }
        self.require(capability)
            .map_err(|_| CapabilityError::DeterministicModeForbids(capability.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_fails_closed_when_nothing_is_granted() {
        let caps = CapabilitySet::empty();
        assert!(caps.require(Capability::DbWrite).is_err());
    }

    #[test]
    fn with_grants_a_capability() {
        let caps = CapabilitySet::empty().with(Capability::DbWrite);
        assert!(caps.require(Capability::DbWrite).is_ok());
        assert!(caps.require(Capability::NetOutbound).is_err());
    }

    #[test]
    fn deterministic_guard_is_noop_outside_deterministic_mode() {
        let caps = CapabilitySet::empty();
        assert!(caps.deterministic_guard(Capability::NetOutbound).is_ok());
    }
}
