use crate::*;
use blind_rsa_signatures::PublicKey;
use chrono::{DateTime, Utc};

/// Voter -> election commission: please sign this blinded nonce
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    pub election_id: String,

    #[serde(with = "b64_bytes")]
    pub blinded_nonce: Vec<u8>,

    pub voter_public_key: String,
}

/// Election commission -> voter: the blind signature
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignatureResponse {
    pub election_id: String,

    #[serde(with = "b64_bytes")]
    pub blind_signature: Vec<u8>,

    /// Relay id of the request being answered
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// An unblinded authority signature that has been verified locally.
///
/// The only way to build one is `VoteSignature::verified`, so an unverified
/// signature can never reach a `CastableVote`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VoteSignature {
    #[serde(with = "b64_bytes")]
    signature: Vec<u8>,

    #[serde(with = "b64_bytes")]
    message: Vec<u8>,

    verified_at: DateTime<Utc>,
}

impl VoteSignature {
    pub fn verified(
        signature: Vec<u8>,
        randomizer: Option<&[u8]>,
        message: &[u8],
        authority_public_key: &PublicKey,
    ) -> Result<Self, Error> {
        if !verify(&signature, randomizer, message, authority_public_key)? {
            return Err(Error::SignatureVerification);
        }

        Ok(VoteSignature {
            signature,
            message: message.to_vec(),
            verified_at: Utc::now(),
        })
    }

    /// Check the signature again, e.g. after loading it from storage
    pub fn reverify(
        &self,
        randomizer: Option<&[u8]>,
        authority_public_key: &PublicKey,
    ) -> Result<(), Error> {
        if verify(&self.signature, randomizer, &self.message, authority_public_key)? {
            Ok(())
        } else {
            Err(Error::SignatureVerification)
        }
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

/// The final vote payload.
///
/// Carries everything the commission needs to check that the vote was
/// authorized without learning who cast it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CastableVote {
    election_id: String,

    #[serde(with = "b64_bytes")]
    hashed_nonce: Vec<u8>,

    #[serde(with = "b64_bytes")]
    token: Vec<u8>,

    #[serde(with = "b64_bytes_opt")]
    randomizer: Option<Vec<u8>>,

    candidate_id: u32,

    voter_public_key: String,
}

impl CastableVote {
    pub fn new(
        election_id: &str,
        signature: &VoteSignature,
        randomizer: Option<Vec<u8>>,
        candidate_id: u32,
        voter_public_key: &str,
    ) -> Self {
        CastableVote {
            election_id: election_id.to_owned(),
            hashed_nonce: signature.message().to_vec(),
            token: signature.signature().to_vec(),
            randomizer,
            candidate_id,
            voter_public_key: voter_public_key.to_owned(),
        }
    }

    pub fn election_id(&self) -> &str {
        &self.election_id
    }

    pub fn hashed_nonce(&self) -> &[u8] {
        &self.hashed_nonce
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn randomizer(&self) -> Option<&[u8]> {
        self.randomizer.as_deref()
    }

    pub fn candidate_id(&self) -> u32 {
        self.candidate_id
    }

    pub fn voter_public_key(&self) -> &str {
        &self.voter_public_key
    }

    /// Check the token against the commission's key, as the commission would
    pub fn verify(&self, authority_public_key: &PublicKey) -> Result<bool, Error> {
        verify(
            &self.token,
            self.randomizer(),
            &self.hashed_nonce,
            authority_public_key,
        )
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}
