use crate::*;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const RESULTS_KEY_PREFIX: &str = "blindvote.results.";

/// A full snapshot of vote counts for one election, as published by the commission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyEvent {
    pub election_id: String,
    pub created_at: DateTime<Utc>,
    pub votes: BTreeMap<u32, u64>,
}

impl TallyEvent {
    /// Parse a tally payload.
    ///
    /// Accepts `[[candidate_id, vote_count], ...]`, legacy
    /// `{"candidate_id": .., "vote_count": ..}` objects (alone or in a list) and
    /// `{"<candidate_id>": vote_count}` maps. Malformed entries are skipped one by one.
    /// A payload of none of these shapes, or one where every entry is malformed, is an
    /// error, so it can never blank the stored results.
    pub fn parse(election_id: &str, created_at: DateTime<Utc>, content: &str) -> Result<Self, Error> {
        let payload: Value = serde_json::from_str(content)
            .map_err(|e| Error::Parse(format!("tally for {}: {}", election_id, e)))?;

        let mut votes = BTreeMap::new();
        let mut entries_seen = 0;
        match &payload {
            Value::Array(entries) => {
                entries_seen = entries.len();
                for entry in entries {
                    match parse_entry(entry) {
                        Some((candidate, count)) => {
                            votes.insert(candidate, count);
                        }
                        None => warn!("skipping malformed tally entry {} for {}", entry, election_id),
                    }
                }
            }
            Value::Object(map) if map.contains_key("candidate_id") || map.contains_key("vote_count") => {
                let (candidate, count) = parse_entry(&payload).ok_or_else(|| {
                    Error::Parse(format!("malformed legacy tally for {}", election_id))
                })?;
                votes.insert(candidate, count);
            }
            Value::Object(map) => {
                entries_seen = map.len();
                for (key, value) in map {
                    match (key.parse::<u32>(), value.as_u64()) {
                        (Ok(candidate), Some(count)) => {
                            votes.insert(candidate, count);
                        }
                        _ => warn!("skipping malformed tally entry {} for {}", key, election_id),
                    }
                }
            }
            _ => {
                return Err(Error::Parse(format!(
                    "tally for {} is neither a list nor an object",
                    election_id
                )))
            }
        }

        if entries_seen > 0 && votes.is_empty() {
            return Err(Error::Parse(format!(
                "tally for {} has no valid entries",
                election_id
            )));
        }

        Ok(TallyEvent {
            election_id: election_id.to_owned(),
            created_at,
            votes,
        })
    }
}

fn parse_entry(entry: &Value) -> Option<(u32, u64)> {
    let (candidate, count) = match entry {
        Value::Array(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
        Value::Object(object) => (object.get("candidate_id")?, object.get("vote_count")?),
        _ => return None,
    };
    let candidate = u32::try_from(candidate.as_u64()?).ok()?;
    Some((candidate, count.as_u64()?))
}

/// The latest known results of one election
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    pub election_id: String,
    pub votes: BTreeMap<u32, u64>,
    pub updated_at: DateTime<Utc>,
    pub status: Option<ElectionStatus>,

    /// Display metadata, empty until the election definition is attached
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl ElectionResult {
    /// Sum of all counts, saturating rather than overflowing on absurd tallies
    pub fn total_votes(&self) -> u64 {
        self.votes.values().fold(0u64, |total, v| total.saturating_add(*v))
    }

    /// Candidates by descending vote count, ties broken by ascending candidate id
    pub fn ranking(&self) -> Vec<(u32, u64)> {
        let mut ranking: Vec<(u32, u64)> = self.votes.iter().map(|(c, v)| (*c, *v)).collect();
        ranking.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranking
    }

    /// The leading candidate, or none while nobody has votes
    pub fn winner(&self) -> Option<u32> {
        self.ranking()
            .first()
            .filter(|(_, votes)| *votes > 0)
            .map(|(candidate, _)| *candidate)
    }

    /// Share of the total per candidate, in percent. All zero while there are no votes.
    pub fn percentages(&self) -> BTreeMap<u32, f64> {
        let total = self.total_votes();
        self.votes
            .iter()
            .map(|(candidate, votes)| {
                let share = if total == 0 {
                    0.0
                } else {
                    *votes as f64 * 100.0 / total as f64
                };
                (*candidate, share)
            })
            .collect()
    }

    pub fn candidate_name(&self, candidate_id: u32) -> Option<&str> {
        self.candidates
            .iter()
            .find(|c| c.id == candidate_id)
            .map(|c| c.name.as_str())
    }

    /// Candidates with their vote counts filled in
    pub fn candidates_with_votes(&self) -> Vec<Candidate> {
        self.candidates
            .iter()
            .map(|c| Candidate {
                votes: Some(self.votes.get(&c.id).copied().unwrap_or(0)),
                ..c.clone()
            })
            .collect()
    }

    fn attach(&mut self, election: &Election) {
        self.status = Some(election.status);
        self.candidates = election.candidates.clone();
    }
}

fn results_key(election_id: &str) -> String {
    format!("{}{}", RESULTS_KEY_PREFIX, election_id)
}

#[derive(Default)]
struct Results {
    results: BTreeMap<String, ElectionResult>,
    elections: HashMap<String, Election>,
}

struct Shared<S> {
    state: Mutex<Results>,
    store: S,
    updates: broadcast::Sender<String>,
}

impl<S: SecureStore> Shared<S> {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Results>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("results lock poisoned".to_owned()))
    }

    // Replace the stored result wholesale. Snapshots older than the current one are ignored.
    fn apply(&self, tally: TallyEvent) -> Result<bool, Error> {
        let result = {
            let mut state = self.lock()?;
            if let Some(current) = state.results.get(&tally.election_id) {
                if tally.created_at < current.updated_at {
                    debug!("ignoring stale tally for {}", tally.election_id);
                    return Ok(false);
                }
            }

            let mut result = ElectionResult {
                election_id: tally.election_id.clone(),
                votes: tally.votes,
                updated_at: tally.created_at,
                status: None,
                candidates: vec![],
            };
            if let Some(election) = state.elections.get(&tally.election_id) {
                result.attach(election);
            }
            state.results.insert(tally.election_id.clone(), result.clone());
            result
        };

        self.store.write_json(&results_key(&result.election_id), &result)?;
        let _ = self.updates.send(result.election_id.clone());
        Ok(true)
    }
}

/// Keeps the latest tally of each watched election.
///
/// Every tally event replaces the previous counts for its election. Results are
/// persisted so they can be shown without a live subscription.
pub struct ResultsAggregator<T: Transport, S: SecureStore + 'static> {
    transport: Arc<T>,
    shared: Arc<Shared<S>>,
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<T: Transport, S: SecureStore + 'static> ResultsAggregator<T, S> {
    pub fn new(transport: Arc<T>, store: S) -> Self {
        let (updates, _) = broadcast::channel(64);
        ResultsAggregator {
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(Results::default()),
                store,
                updates,
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start following tally events for `election_id`. Watching twice is a no-op.
    pub async fn watch(&self, election_id: &str) -> Result<(), Error> {
        if self.is_watching(election_id) {
            return Ok(());
        }

        self.restore(election_id)?;

        let filter = Filter::kind(EventKind::Tally).tag(TAG_ELECTION, election_id);
        let mut events = self.transport.subscribe(filter).await?;

        let shared = self.shared.clone();
        let id = election_id.to_owned();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let tally = match Message::decode(&event) {
                    Ok(Message::Tally(tally)) => tally,
                    Ok(other) => {
                        warn!("results for {}: ignoring {} event", id, other.kind());
                        continue;
                    }
                    Err(e) => {
                        warn!("results for {}: dropping event {}: {}", id, event.id, e);
                        continue;
                    }
                };
                if tally.election_id != id {
                    continue;
                }
                if let Err(e) = shared.apply(tally) {
                    error!("results for {}: cannot apply tally: {}", id, e);
                }
            }
            debug!("tally subscription for {} ended", id);
        });

        let mut watches = self.watches.lock().map_err(|_| poisoned())?;
        if let Some(previous) = watches.insert(election_id.to_owned(), handle) {
            previous.abort();
        }
        info!("watching results of {}", election_id);
        Ok(())
    }

    /// Stop following `election_id`. Already applied results are kept.
    pub fn unwatch(&self, election_id: &str) {
        if let Ok(mut watches) = self.watches.lock() {
            if let Some(handle) = watches.remove(election_id) {
                handle.abort();
            }
        }
    }

    pub fn is_watching(&self, election_id: &str) -> bool {
        self.watches
            .lock()
            .map(|w| w.contains_key(election_id))
            .unwrap_or(false)
    }

    /// Apply a tally directly, as the subscription would
    pub fn apply(&self, tally: TallyEvent) -> Result<bool, Error> {
        self.shared.apply(tally)
    }

    /// Use `election` for candidate names and status in its results
    pub fn attach_election(&self, election: &Election) -> Result<(), Error> {
        let updated = {
            let mut state = self.shared.lock()?;
            state.elections.insert(election.id.clone(), election.clone());
            match state.results.get_mut(&election.id) {
                Some(result) => {
                    result.attach(election);
                    Some(result.clone())
                }
                None => None,
            }
        };

        if let Some(result) = updated {
            self.shared
                .store
                .write_json(&results_key(&result.election_id), &result)?;
            let _ = self.shared.updates.send(result.election_id);
        }
        Ok(())
    }

    /// The latest result of `election_id`, from memory or else from storage
    pub fn restore(&self, election_id: &str) -> Result<Option<ElectionResult>, Error> {
        if let Some(result) = self.result(election_id) {
            return Ok(Some(result));
        }

        let stored: Option<ElectionResult> = match self.shared.store.read_json(&results_key(election_id)) {
            Ok(stored) => stored,
            Err(Error::Serialization(e)) => {
                warn!("ignoring unreadable stored results for {}: {}", election_id, e);
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(result) = &stored {
            let mut state = self.shared.lock()?;
            state
                .results
                .entry(election_id.to_owned())
                .or_insert_with(|| result.clone());
        }
        Ok(stored)
    }

    pub fn result(&self, election_id: &str) -> Option<ElectionResult> {
        let state = self.shared.lock().ok()?;
        state.results.get(election_id).cloned()
    }

    pub fn results(&self) -> Vec<ElectionResult> {
        match self.shared.lock() {
            Ok(state) => state.results.values().cloned().collect(),
            Err(_) => vec![],
        }
    }

    /// Ids of elections whose results changed.
    ///
    /// Every new stream first yields the ids already known, then live updates.
    /// Observers that fall behind skip ahead rather than block the aggregator.
    pub fn updates(&self) -> BoxStream<'static, String> {
        let receiver = self.shared.updates.subscribe();
        let known: Vec<String> = match self.shared.lock() {
            Ok(state) => state.results.keys().cloned().collect(),
            Err(_) => vec![],
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(id) => return Some((id, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("results observer skipped {} updates", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(known).chain(live).boxed()
    }

    /// Stop every subscription
    pub fn stop(&self) {
        if let Ok(mut watches) = self.watches.lock() {
            for (_, handle) in watches.drain() {
                handle.abort();
            }
        }
    }
}

impl<T: Transport, S: SecureStore + 'static> Drop for ResultsAggregator<T, S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poisoned() -> Error {
    Error::Storage("results lock poisoned".to_owned())
}
