//! Participant identities and name resolution.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{InvseeError, StoreError};
use crate::host::{HostWorld, PlayerStore};

/// Stable unique identifier of a player (their UUID string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved player: stable id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    pub id: ParticipantId,
    pub name: String,
}

impl ParticipantIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            name: name.into(),
        }
    }
}

/// Maps operator-supplied names or ids to identities.
pub struct IdentityResolver;

impl IdentityResolver {
    /// Resolve `query` against online players first, then the store's
    /// historical records. A failing store is `StoreUnavailable`, never
    /// `NotFound`.
    ///
    /// Online: exact id, exact name, then case-insensitive name.
    /// Historical: exact id, then case-insensitive last-known name, preferring
    /// an exact-case match when several records share a name.
    pub fn resolve(
        host: &dyn HostWorld,
        store: &dyn PlayerStore,
        query: &str,
    ) -> Result<ParticipantIdentity, InvseeError> {
        let online = host.online_participants();
        if let Some(found) = pick(&online, query) {
            return Ok(found);
        }

        let known = match store.known_players() {
            Ok(known) => known,
            Err(StoreError::NoData) => Vec::new(),
            Err(e) => {
                warn!("Historical lookup for '{query}' failed: {e}");
                return Err(InvseeError::StoreUnavailable {
                    target: ParticipantId::new(query),
                    reason: e.to_string(),
                });
            }
        };
        pick(&known, query).ok_or_else(|| InvseeError::NotFound(query.to_string()))
    }

    /// Whether the player currently has a live session.
    pub fn is_connected(host: &dyn HostWorld, identity: &ParticipantIdentity) -> bool {
        host.is_connected(&identity.id)
    }
}

fn pick(candidates: &[ParticipantIdentity], query: &str) -> Option<ParticipantIdentity> {
    candidates
        .iter()
        .find(|p| p.id.as_str() == query)
        .or_else(|| candidates.iter().find(|p| p.name == query))
        .or_else(|| candidates.iter().find(|p| p.name.eq_ignore_ascii_case(query)))
        .cloned()
}
