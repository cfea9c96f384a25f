use crate::*;
use blind_rsa_signatures::PublicKey;
use chrono::{DateTime, Utc};

/// Lifecycle status of an election as published by the election commission
#[derive(Serialize, Deserialize, Copy, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionStatus {
    Open,
    InProgress,
    Finished,
    Canceled,
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ElectionStatus::Open => "open",
            ElectionStatus::InProgress => "in-progress",
            ElectionStatus::Finished => "finished",
            ElectionStatus::Canceled => "canceled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: u32,
    pub name: String,

    /// Only populated where results are being displayed
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<u64>,
}

impl Candidate {
    pub fn new(id: u32, name: &str) -> Self {
        Candidate {
            id,
            name: name.to_owned(),
            votes: None,
        }
    }
}

/// An election definition.
///
/// Elections are never edited field by field. A newer definition for the same
/// `id` replaces the old one wholesale.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub id: String,
    pub name: String,
    pub candidates: Vec<Candidate>,

    /// Election commission's RSA public key (DER), base64 on the wire
    #[serde(with = "b64_bytes")]
    pub rsa_pub_key: Vec<u8>,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ElectionStatus,
}

impl Election {
    /// Parse and sanity-check an election-definition payload
    pub fn from_json(payload: &str) -> Result<Self, Error> {
        let election: Election =
            serde_json::from_str(payload).map_err(|e| Error::Parse(e.to_string()))?;
        election.validate()?;
        Ok(election)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::Parse("election id is empty".to_owned()));
        }
        if self.end_time < self.start_time {
            return Err(Error::Parse(format!(
                "election {} ends before it starts",
                self.id
            )));
        }
        for (i, candidate) in self.candidates.iter().enumerate() {
            if self.candidates[..i].iter().any(|c| c.id == candidate.id) {
                return Err(Error::Parse(format!(
                    "election {} lists candidate {} twice",
                    self.id, candidate.id
                )));
            }
        }
        parse_public_key(&self.rsa_pub_key)
            .map_err(|e| Error::Parse(format!("election {}: {}", self.id, e)))?;

        Ok(())
    }

    /// The election commission's public key for this election
    pub fn public_key(&self) -> Result<PublicKey, Error> {
        parse_public_key(&self.rsa_pub_key)
    }

    /// Get a candidate with the given ID
    pub fn candidate(&self, candidate_id: u32) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == candidate_id)
    }

    /// Is voting possible at `now`?
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, ElectionStatus::Open | ElectionStatus::InProgress)
            && now >= self.start_time
            && now <= self.end_time
    }

    /// The status implied by the clock.
    ///
    /// A canceled election stays canceled, otherwise the schedule decides.
    pub fn status_at(&self, now: DateTime<Utc>) -> ElectionStatus {
        if self.status == ElectionStatus::Canceled {
            ElectionStatus::Canceled
        } else if now < self.start_time {
            ElectionStatus::Open
        } else if now <= self.end_time {
            ElectionStatus::InProgress
        } else {
            ElectionStatus::Finished
        }
    }
}
