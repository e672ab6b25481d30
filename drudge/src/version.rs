//! Version information for drudge.

use std::borrow::Cow;

/// Drudge version from Cargo.toml
pub const DRUDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the client wire protocol. Bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information reported in status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionInfo {
    /// Crate version of the running server.
    pub drudge: Cow<'static, str>,
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            drudge: Cow::Borrowed(DRUDGE_VERSION),
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a peer speaking `other` can exchange messages with us.
    pub fn is_compatible(&self, other: &VersionInfo) -> bool {
        self.protocol == other.protocol
    }
}
