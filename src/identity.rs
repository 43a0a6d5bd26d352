//! Store identity guard.
//!
//! Every dataset carries an identity generated once when the cluster is
//! bootstrapped. Members compare identities before accepting log entries or
//! snapshots so that a store can never absorb data from a different cluster.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreIdentity {
    pub creation_timestamp: u64,
    pub random_seed: u64,
}

impl StoreIdentity {
    pub fn new(creation_timestamp: u64, random_seed: u64) -> Self {
        Self {
            creation_timestamp,
            random_seed,
        }
    }

    pub fn generate() -> Self {
        let creation_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::new(creation_timestamp, rand::random::<u64>())
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.creation_timestamp.to_be_bytes());
        buf[8..].copy_from_slice(&self.random_seed.to_be_bytes());
        buf
    }
}

impl Display for StoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.creation_timestamp, self.random_seed)
    }
}

/// Outcome of a successful identity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Both sides carry the same identity.
    Matches,
    /// The local store is blank and should take on the remote identity.
    Adopt(StoreIdentity),
}

/// Decides whether a local store may accept data stamped with `remote`.
///
/// `local_is_empty` must cover everything the member holds: state machine,
/// log and snapshot. Only such a blank member adopts the remote identity;
/// otherwise the identities must be byte-for-byte equal.
pub fn verify_compatible(
    local: Option<&StoreIdentity>,
    local_is_empty: bool,
    remote: &StoreIdentity,
) -> Result<Compatibility, IdentityError> {
    match local {
        Some(local) if local.to_bytes() == remote.to_bytes() => Ok(Compatibility::Matches),
        Some(_) if local_is_empty => Ok(Compatibility::Adopt(*remote)),
        Some(local) => Err(IdentityError::Mismatch {
            local: *local,
            remote: *remote,
        }),
        None if local_is_empty => Ok(Compatibility::Adopt(*remote)),
        None => Err(IdentityError::Unidentified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_identities_match() {
        let id = StoreIdentity::new(1_700_000_000_000, 42);
        assert_eq!(
            verify_compatible(Some(&id), false, &id).unwrap(),
            Compatibility::Matches
        );
    }

    #[test]
    fn empty_store_adopts_remote_identity() {
        let remote = StoreIdentity::new(5, 6);
        assert_eq!(
            verify_compatible(None, true, &remote).unwrap(),
            Compatibility::Adopt(remote)
        );
        let stale = StoreIdentity::new(1, 2);
        assert_eq!(
            verify_compatible(Some(&stale), true, &remote).unwrap(),
            Compatibility::Adopt(remote)
        );
    }

    #[test]
    fn populated_store_with_other_identity_is_refused() {
        let local = StoreIdentity::new(1, 2);
        let remote = StoreIdentity::new(1, 3);
        let err = verify_compatible(Some(&local), false, &remote).unwrap_err();
        assert_eq!(err, IdentityError::Mismatch { local, remote });
    }

    #[test]
    fn populated_store_without_identity_is_refused() {
        let remote = StoreIdentity::new(1, 3);
        assert_eq!(
            verify_compatible(None, false, &remote).unwrap_err(),
            IdentityError::Unidentified
        );
    }

    #[test]
    fn generated_identities_differ() {
        assert_ne!(StoreIdentity::generate(), StoreIdentity::generate());
    }
}
