use crate::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Version of the persisted session encoding
pub const SESSION_VERSION: u8 = 1;

/// Steps of a voting session, in the only order they can happen
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VotingStep {
    Initial,
    GenerateNonce,
    SendBlindedNonce,
    WaitForSignature,
    CastVote,
    Complete,
}

impl VotingStep {
    /// The step that follows this one
    pub fn next(self) -> VotingStep {
        match self {
            VotingStep::Initial => VotingStep::GenerateNonce,
            VotingStep::GenerateNonce => VotingStep::SendBlindedNonce,
            VotingStep::SendBlindedNonce => VotingStep::WaitForSignature,
            VotingStep::WaitForSignature => VotingStep::CastVote,
            VotingStep::CastVote => VotingStep::Complete,
            VotingStep::Complete => VotingStep::Complete,
        }
    }
}

impl std::fmt::Display for VotingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            VotingStep::Initial => "initial",
            VotingStep::GenerateNonce => "generateNonce",
            VotingStep::SendBlindedNonce => "sendBlindedNonce",
            VotingStep::WaitForSignature => "waitForSignature",
            VotingStep::CastVote => "castVote",
            VotingStep::Complete => "complete",
        };
        write!(f, "{}", name)
    }
}

/// The error that halted the current step
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StepError {
    pub message: String,

    /// The step can be re-run with the same session state
    pub retryable: bool,

    /// The transport must be reconnected before retrying
    pub reconnect: bool,
}

impl From<&Error> for StepError {
    fn from(error: &Error) -> Self {
        StepError {
            message: error.to_string(),
            retryable: error.is_retryable(),
            reconnect: matches!(error, Error::Transport(_)),
        }
    }
}

/// Persisted nonce and its hash
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NonceRecord {
    #[serde(with = "hex_serde")]
    pub nonce: Vec<u8>,

    #[serde(with = "hex_serde")]
    pub hashed_nonce: Vec<u8>,
}

impl From<&VoterIdentity> for NonceRecord {
    fn from(identity: &VoterIdentity) -> Self {
        NonceRecord {
            nonce: identity.nonce().to_vec(),
            hashed_nonce: identity.hashed_nonce().to_vec(),
        }
    }
}

impl std::fmt::Debug for NonceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NonceRecord")
            .field("hashed_nonce", &hex::encode(&self.hashed_nonce))
            .finish()
    }
}

/// Everything needed to resume a voting attempt after a crash.
///
/// Encoded as versioned JSON. Unknown or missing fields are rejected rather than
/// defaulted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VotingSession {
    pub version: u8,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub election: Election,
    pub candidate: Candidate,

    /// The commission's RSA public key (DER) this session blinds against
    #[serde(with = "b64_bytes")]
    pub ec_public_key: Vec<u8>,

    pub voter_public_key: String,
    pub step: VotingStep,
    #[serde(deserialize_with = "required_option")]
    pub nonce: Option<NonceRecord>,
    #[serde(deserialize_with = "required_option")]
    pub blinding: Option<BlindingResult>,

    /// Relay id of our signature request, used to match the response
    #[serde(deserialize_with = "required_option")]
    pub request_event_id: Option<String>,

    #[serde(deserialize_with = "required_option")]
    pub signature: Option<VoteSignature>,
    #[serde(deserialize_with = "required_option")]
    pub vote: Option<CastableVote>,
    #[serde(deserialize_with = "required_option")]
    pub error: Option<StepError>,
}

impl VotingSession {
    pub fn new(election: Election, candidate: Candidate, voter_public_key: &str) -> Self {
        VotingSession {
            version: SESSION_VERSION,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            ec_public_key: election.rsa_pub_key.clone(),
            election,
            candidate,
            voter_public_key: voter_public_key.to_owned(),
            step: VotingStep::Initial,
            nonce: None,
            blinding: None,
            request_event_id: None,
            signature: None,
            vote: None,
            error: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let session: VotingSession = serde_json::from_slice(bytes)
            .map_err(|e| Error::Parse(format!("stored session: {}", e)))?;

        if session.version != SESSION_VERSION {
            return Err(Error::Parse(format!(
                "stored session has unsupported version {}",
                session.version
            )));
        }

        Ok(session)
    }

    pub fn is_complete(&self) -> bool {
        self.step == VotingStep::Complete
    }

    /// The randomizer bound to this session's blinding, wherever it is kept now
    pub fn randomizer(&self) -> Option<&[u8]> {
        match &self.blinding {
            Some(blinding) => blinding.randomizer.as_deref(),
            None => self.vote.as_ref().and_then(|v| v.randomizer()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VotingSession {
        let (authority, _) = test_authority();
        let now = Utc::now();
        let election = Election {
            id: "E1".to_owned(),
            name: "Test".to_owned(),
            candidates: vec![Candidate::new(1, "C1")],
            rsa_pub_key: authority.public_key_der().unwrap(),
            start_time: now,
            end_time: now + chrono::Duration::hours(1),
            status: ElectionStatus::Open,
        };
        VotingSession::new(election, Candidate::new(1, "C1"), "voter")
    }

    #[test]
    fn steps_are_ordered() {
        let mut step = VotingStep::Initial;
        let mut seen = vec![step];
        while step != VotingStep::Complete {
            step = step.next();
            seen.push(step);
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(VotingStep::Complete.next(), VotingStep::Complete);
        assert_eq!(VotingStep::WaitForSignature.to_string(), "waitForSignature");
    }

    #[test]
    fn encode_decode() {
        let mut session = session();
        let identity = VoterIdentity::generate();
        session.nonce = Some(NonceRecord::from(&identity));
        session.step = VotingStep::SendBlindedNonce;

        let bytes = session.encode().unwrap();
        let decoded = VotingSession::decode(&bytes).unwrap();
        assert_eq!(decoded, session);

        // Nonces are stored as hex
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["nonce"]["nonce"], hex::encode(identity.nonce()));
        assert_eq!(json["step"], "send_blinded_nonce");
    }

    #[test]
    fn decode_rejects_unknown_missing_and_versions() {
        let session = session();
        let mut json: serde_json::Value = serde_json::from_slice(&session.encode().unwrap()).unwrap();

        let mut unknown = json.clone();
        unknown["surprise"] = true.into();
        assert!(VotingSession::decode(unknown.to_string().as_bytes()).is_err());

        let mut missing = json.clone();
        missing.as_object_mut().unwrap().remove("step");
        assert!(VotingSession::decode(missing.to_string().as_bytes()).is_err());

        let mut missing_option = json.clone();
        missing_option.as_object_mut().unwrap().remove("signature");
        assert!(VotingSession::decode(missing_option.to_string().as_bytes()).is_err());

        json["version"] = 2.into();
        assert!(matches!(
            VotingSession::decode(json.to_string().as_bytes()),
            Err(Error::Parse(_))
        ));
    }
}
