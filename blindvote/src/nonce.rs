use crate::*;
use rand::RngCore;

/// Length of the voter's secret nonce in bytes
pub const NONCE_LEN: usize = 32;

/// The voter's unlinkable secret for one voting attempt.
///
/// The nonce is generated once from the operating system's CSPRNG and never
/// reused. Its SHA-256 hash is the message the election authority blind-signs.
/// The hash is always derived from the nonce, never taken on trust.
#[derive(Clone)]
pub struct VoterIdentity {
    nonce: [u8; NONCE_LEN],
    hashed_nonce: [u8; 32],
}

impl VoterIdentity {
    /// Generate a fresh nonce and compute its hash
    pub fn generate() -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let hashed_nonce = sha256(&nonce);

        VoterIdentity {
            nonce,
            hashed_nonce,
        }
    }

    /// Rebuild an identity from persisted bytes.
    ///
    /// Fails with `Error::Integrity` if the nonce has the wrong length or does not
    /// hash to `expected_hash`.
    pub fn from_stored(nonce: &[u8], expected_hash: &[u8]) -> Result<Self, Error> {
        if nonce.len() != NONCE_LEN {
            return Err(Error::Integrity);
        }
        let mut stored = [0u8; NONCE_LEN];
        stored.copy_from_slice(nonce);

        let hashed_nonce = sha256(&stored);
        if hashed_nonce[..] != *expected_hash {
            return Err(Error::Integrity);
        }

        Ok(VoterIdentity {
            nonce: stored,
            hashed_nonce,
        })
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn hashed_nonce(&self) -> &[u8; 32] {
        &self.hashed_nonce
    }
}

impl std::fmt::Debug for VoterIdentity {
    // Never print the nonce itself
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VoterIdentity")
            .field("hashed_nonce", &hex::encode(self.hashed_nonce))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_identity_round_trips() {
        let identity = VoterIdentity::generate();
        assert_eq!(identity.nonce().len(), 32);
        assert_eq!(identity.hashed_nonce().len(), 32);

        let restored =
            VoterIdentity::from_stored(identity.nonce(), identity.hashed_nonce()).unwrap();
        assert_eq!(restored.hashed_nonce(), identity.hashed_nonce());
    }

    #[test]
    fn fresh_nonces_differ() {
        let a = VoterIdentity::generate();
        let b = VoterIdentity::generate();
        assert_ne!(a.nonce(), b.nonce());
    }

    #[test]
    fn tampered_storage_is_rejected() {
        let identity = VoterIdentity::generate();

        let mut bad_hash = *identity.hashed_nonce();
        bad_hash[0] ^= 0xff;
        assert!(matches!(
            VoterIdentity::from_stored(identity.nonce(), &bad_hash),
            Err(Error::Integrity)
        ));

        let mut bad_nonce = *identity.nonce();
        bad_nonce[31] ^= 0x01;
        assert!(matches!(
            VoterIdentity::from_stored(&bad_nonce, identity.hashed_nonce()),
            Err(Error::Integrity)
        ));

        assert!(matches!(
            VoterIdentity::from_stored(&identity.nonce()[..16], identity.hashed_nonce()),
            Err(Error::Integrity)
        ));
    }
}
