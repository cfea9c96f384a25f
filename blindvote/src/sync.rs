use crate::*;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// An election moved from one status to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub election_id: String,
    pub from: ElectionStatus,
    pub to: ElectionStatus,
}

/// What applying one election definition did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated(Option<StatusChange>),
    Unchanged,

    /// Only expired elections were dropped
    Expired,
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

/// The visible elections, keyed by id and ordered by start time, most recent first.
///
/// Applying the same definition twice leaves the same state. Definitions for
/// different ids can arrive in any order.
#[derive(Debug, Clone)]
pub struct ElectionSet {
    elections: IndexMap<String, Election>,
    retention: chrono::Duration,
}

impl ElectionSet {
    pub fn new(retention: chrono::Duration) -> Self {
        ElectionSet {
            elections: IndexMap::new(),
            retention,
        }
    }

    fn is_expired(&self, election: &Election, now: DateTime<Utc>) -> bool {
        election.end_time < now - self.retention
    }

    /// Merge one definition into the set
    pub fn apply(&mut self, election: Election, now: DateTime<Utc>) -> Applied {
        let pruned = self.prune(now);

        if self.is_expired(&election, now) {
            let removed = self.elections.shift_remove(&election.id).is_some();
            return if removed || pruned > 0 {
                Applied::Expired
            } else {
                Applied::Unchanged
            };
        }

        let applied = match self.elections.get_mut(&election.id) {
            Some(existing) if *existing == election => {
                if pruned > 0 {
                    Applied::Updated(None)
                } else {
                    return Applied::Unchanged;
                }
            }
            Some(existing) => {
                let change = if existing.status != election.status {
                    Some(StatusChange {
                        election_id: election.id.clone(),
                        from: existing.status,
                        to: election.status,
                    })
                } else {
                    None
                };
                *existing = election;
                Applied::Updated(change)
            }
            None => {
                self.elections.insert(election.id.clone(), election);
                Applied::Inserted
            }
        };

        self.sort();
        applied
    }

    /// Drop elections past the retention window, returning how many went
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.elections.len();
        let cutoff = now - self.retention;
        self.elections.retain(|_, e| e.end_time >= cutoff);
        before - self.elections.len()
    }

    fn sort(&mut self) {
        self.elections.sort_by(|_, a, _, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    pub fn get(&self, election_id: &str) -> Option<&Election> {
        self.elections.get(election_id)
    }

    pub fn len(&self) -> usize {
        self.elections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Election> {
        self.elections.values()
    }

    pub fn to_vec(&self) -> Vec<Election> {
        self.elections.values().cloned().collect()
    }
}

/// Progress of the first load, for deciding between a spinner, a list and an empty state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Loaded,
    Empty,
    Failed(String),
}

/// An immutable view of the engine's elections
#[derive(Debug, Clone)]
pub struct ElectionSnapshot {
    pub elections: Arc<Vec<Election>>,
    pub state: LoadState,
}

struct SyncState {
    set: ElectionSet,
    load: LoadState,
}

struct SyncShared {
    state: Mutex<SyncState>,
    snapshots: watch::Sender<ElectionSnapshot>,
    changes: broadcast::Sender<StatusChange>,
}

impl SyncShared {
    fn publish(&self, state: &SyncState) {
        let snapshot = ElectionSnapshot {
            elections: Arc::new(state.set.to_vec()),
            state: state.load.clone(),
        };
        // The engine holds a receiver, so this only fails once it is gone
        let _ = self.snapshots.send(snapshot);
    }

    // Merge one event. Parse errors are contained here.
    fn handle(&self, event: &Event, source: &str) {
        let election = match Message::decode(event) {
            Ok(Message::ElectionDefinition(election)) => election,
            Ok(other) => {
                warn!("{}: ignoring {} event {}", source, other.kind(), event.id);
                return;
            }
            Err(e) => {
                warn!("{}: dropping malformed election event {}: {}", source, event.id, e);
                return;
            }
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                error!("{}: election state lock poisoned", source);
                return;
            }
        };

        let id = election.id.clone();
        let applied = state.set.apply(election, Utc::now());
        if !applied.changed() {
            return;
        }

        if state.load != LoadState::Loaded && !state.set.is_empty() {
            state.load = LoadState::Loaded;
        }
        self.publish(&state);

        match applied {
            Applied::Updated(Some(change)) => {
                info!("election {} is now {} (was {})", change.election_id, change.to, change.from);
                let _ = self.changes.send(change);
            }
            Applied::Inserted => debug!("{}: new election {}", source, id),
            Applied::Expired => debug!("{}: election {} has expired", source, id),
            _ => {}
        }
    }

    // Expire elections even when no events arrive
    fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        let pruned = state.set.prune(now);
        if pruned > 0 {
            debug!("expired {} election(s)", pruned);
            self.publish(&state);
        }
        pruned
    }

    fn set_load(&self, load: LoadState) {
        if let Ok(mut state) = self.state.lock() {
            state.load = load;
            self.publish(&state);
        }
    }
}

/// Keeps the list of elections up to date.
///
/// Two producers feed the same idempotent merge: a live subscription, and a
/// periodic reconciliation pass that re-reads recent definitions for a short
/// window to recover anything the subscription missed. The reconciliation pass
/// never touches the load state.
pub struct ElectionSyncEngine<T: Transport> {
    config: Config,
    transport: Arc<T>,
    shared: Arc<SyncShared>,
    snapshots: watch::Receiver<ElectionSnapshot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> ElectionSyncEngine<T> {
    pub fn new(config: Config, transport: Arc<T>) -> Self {
        let initial = ElectionSnapshot {
            elections: Arc::new(vec![]),
            state: LoadState::Loading,
        };
        let (snapshot_sender, snapshots) = watch::channel(initial);
        let (changes, _) = broadcast::channel(64);
        let retention = config.retention_window();

        ElectionSyncEngine {
            config,
            transport,
            shared: Arc::new(SyncShared {
                state: Mutex::new(SyncState {
                    set: ElectionSet::new(retention),
                    load: LoadState::Loading,
                }),
                snapshots: snapshot_sender,
                changes,
            }),
            snapshots,
            tasks: Mutex::new(vec![]),
        }
    }

    /// Subscribe and start the background tasks.
    ///
    /// A failed subscription leaves the engine in `LoadState::Failed`.
    pub async fn start(&self) -> Result<(), Error> {
        self.stop();
        self.shared.set_load(LoadState::Loading);

        let mut events = match self.transport.subscribe(election_filter()).await {
            Ok(events) => events,
            Err(e) => {
                error!("cannot subscribe to elections: {}", e);
                self.shared.set_load(LoadState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let shared = self.shared.clone();
        let push = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                shared.handle(&event, "election subscription");
            }
            warn!("election subscription ended");
        });

        let shared = self.shared.clone();
        let grace = self.config.initial_grace;
        let grace_timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Ok(mut state) = shared.state.lock() {
                if state.load == LoadState::Loading {
                    state.load = if state.set.is_empty() {
                        LoadState::Empty
                    } else {
                        LoadState::Loaded
                    };
                    shared.publish(&state);
                }
            }
        });

        let reconcile = tokio::spawn(reconcile_loop(
            self.transport.clone(),
            self.shared.clone(),
            self.config.reconcile_interval,
            self.config.reconcile_window,
        ));

        let handles = vec![push, grace_timer, reconcile];
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(_) => {
                handles.iter().for_each(JoinHandle::abort);
                return Err(Error::Configuration("election task list poisoned".to_owned()));
            }
        }

        info!("election sync started");
        Ok(())
    }

    /// Cancel every background task. Applied elections are kept.
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if !tasks.is_empty() {
                debug!("stopping {} election sync task(s)", tasks.len());
            }
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Run one reconciliation pass now
    pub async fn reconcile(&self) -> Result<usize, Error> {
        reconcile_once(&*self.transport, &self.shared, self.config.reconcile_window).await
    }

    /// The current elections and load state
    pub fn snapshot(&self) -> ElectionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Changes to the snapshot from now on
    pub fn subscribe(&self) -> watch::Receiver<ElectionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Status transitions of known elections
    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.changes.subscribe()
    }

    pub fn election(&self, election_id: &str) -> Option<Election> {
        let state = self.shared.state.lock().ok()?;
        state.set.get(election_id).cloned()
    }
}

impl<T: Transport> Drop for ElectionSyncEngine<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn election_filter() -> Filter {
    Filter::kind(EventKind::ElectionDefinition)
}

async fn reconcile_loop<T: Transport>(
    transport: Arc<T>,
    shared: Arc<SyncShared>,
    interval: std::time::Duration,
    window: std::time::Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match reconcile_once(&*transport, &shared, window).await {
            Ok(n) => debug!("reconciliation saw {} election event(s)", n),
            Err(e) => warn!("reconciliation failed: {}", e),
        }
    }
}

// Re-read definitions for a bounded window and merge them
async fn reconcile_once<T: Transport + ?Sized>(
    transport: &T,
    shared: &SyncShared,
    window: std::time::Duration,
) -> Result<usize, Error> {
    let mut events = transport.subscribe(election_filter()).await?;
    let mut seen = 0;

    let drain = async {
        while let Some(event) = events.next().await {
            shared.handle(&event, "reconciliation");
            seen += 1;
        }
    };
    // Hitting the window is the normal way out
    let _ = tokio::time::timeout(window, drain).await;
    shared.prune(Utc::now());

    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn election(id: &str, start_offset_hours: i64, status: ElectionStatus) -> Election {
        let (authority, _) = test_authority();
        let start = Utc::now() + ChronoDuration::hours(start_offset_hours);
        Election {
            id: id.to_owned(),
            name: format!("Election {}", id),
            candidates: vec![Candidate::new(1, "C1"), Candidate::new(2, "C2")],
            rsa_pub_key: authority.public_key_der().unwrap(),
            start_time: start,
            end_time: start + ChronoDuration::hours(1),
            status,
        }
    }

    fn definition(election: &Election) -> EventDraft {
        EventDraft::new(EventKind::ElectionDefinition, election.to_json().unwrap())
    }

    fn ids(elections: &[Election]) -> Vec<&str> {
        elections.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn apply_is_idempotent() {
        let now = Utc::now();
        let mut set = ElectionSet::new(ChronoDuration::hours(12));
        let e1 = election("E1", 0, ElectionStatus::Open);

        assert_eq!(set.apply(e1.clone(), now), Applied::Inserted);
        assert_eq!(set.apply(e1.clone(), now), Applied::Unchanged);
        assert_eq!(set.len(), 1);

        let mut renamed = e1.clone();
        renamed.name = "Renamed".to_owned();
        assert_eq!(set.apply(renamed, now), Applied::Updated(None));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("E1").unwrap().name, "Renamed");
    }

    #[test]
    fn detects_status_changes() {
        let now = Utc::now();
        let mut set = ElectionSet::new(ChronoDuration::hours(12));
        let mut e1 = election("E1", 0, ElectionStatus::Open);
        set.apply(e1.clone(), now);

        e1.status = ElectionStatus::InProgress;
        assert_eq!(
            set.apply(e1, now),
            Applied::Updated(Some(StatusChange {
                election_id: "E1".to_owned(),
                from: ElectionStatus::Open,
                to: ElectionStatus::InProgress,
            }))
        );
    }

    #[test]
    fn sorted_by_start_most_recent_first() {
        let now = Utc::now();
        let mut set = ElectionSet::new(ChronoDuration::hours(12));
        set.apply(election("B", -2, ElectionStatus::Finished), now);
        set.apply(election("A", 3, ElectionStatus::Open), now);
        set.apply(election("C", 1, ElectionStatus::Open), now);

        let mut tie = election("D", 0, ElectionStatus::Open);
        tie.start_time = set.get("C").unwrap().start_time;
        set.apply(tie, now);

        assert_eq!(ids(&set.to_vec()), vec!["A", "C", "D", "B"]);

        // Moving an election re-sorts it
        let mut moved = set.get("B").unwrap().clone();
        moved.start_time = now + ChronoDuration::hours(5);
        moved.end_time = moved.start_time + ChronoDuration::hours(1);
        set.apply(moved, now);
        assert_eq!(ids(&set.to_vec()), vec!["B", "A", "C", "D"]);
    }

    #[test]
    fn stale_elections_are_never_visible() {
        let now = Utc::now();
        let mut set = ElectionSet::new(ChronoDuration::hours(12));

        // Ended 13 hours ago
        let old = election("OLD", -14, ElectionStatus::Finished);
        assert_eq!(set.apply(old.clone(), now), Applied::Unchanged);
        assert!(set.is_empty());

        // Ended 11 hours ago, then time moves on
        let recent = election("RECENT", -12, ElectionStatus::Finished);
        assert_eq!(set.apply(recent, now), Applied::Inserted);
        set.apply(election("NEW", 1, ElectionStatus::Open), now);
        assert_eq!(set.apply(old, now + ChronoDuration::hours(2)), Applied::Expired);
        assert_eq!(ids(&set.to_vec()), vec!["NEW"]);
    }

    #[tokio::test(start_paused = true)]
    async fn push_and_grace_timer() {
        let relay = MemRelay::new();
        let endpoints = vec!["wss://relay.example".to_owned()];
        let ec = relay.client("ec");
        ec.connect(&endpoints).await.unwrap();
        let client = Arc::new(relay.client("voter"));
        client.connect(&endpoints).await.unwrap();

        let engine = ElectionSyncEngine::new(Config::new(endpoints, "ec"), client);
        engine.start().await.unwrap();
        assert_eq!(engine.snapshot().state, LoadState::Loading);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(engine.snapshot().state, LoadState::Empty);

        let mut changes = engine.status_changes();
        let mut snapshots = engine.subscribe();
        let mut e1 = election("E1", 0, ElectionStatus::Open);
        ec.publish(None, definition(&e1)).await.unwrap();
        snapshots.changed().await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, LoadState::Loaded);
        assert_eq!(ids(&snapshot.elections), vec!["E1"]);

        // Garbage is dropped without stopping the subscription
        ec.publish(None, EventDraft::new(EventKind::ElectionDefinition, "{".to_owned()))
            .await
            .unwrap();

        e1.status = ElectionStatus::InProgress;
        ec.publish(None, definition(&e1)).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.from, ElectionStatus::Open);
        assert_eq!(change.to, ElectionStatus::InProgress);
        assert_eq!(engine.election("E1").unwrap().status, ElectionStatus::InProgress);
        assert_eq!(engine.snapshot().elections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_recovers_missed_events() {
        let relay = MemRelay::new();
        let endpoints = vec!["wss://relay.example".to_owned()];
        let client = Arc::new(relay.client("voter"));
        client.connect(&endpoints).await.unwrap();

        let engine = ElectionSyncEngine::new(Config::new(endpoints, "ec"), client);
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.snapshot().state, LoadState::Empty);

        // Arrives while nothing is listening
        engine.stop();
        let missed = Event::build("ec", Utc::now(), definition(&election("E9", 0, ElectionStatus::Open))).unwrap();
        relay.inject(missed).unwrap();
        assert!(engine.snapshot().elections.is_empty());

        assert_eq!(engine.reconcile().await.unwrap(), 1);
        assert_eq!(ids(&engine.snapshot().elections), vec!["E9"]);

        // Nothing new the second time round
        assert_eq!(engine.reconcile().await.unwrap(), 1);
        assert_eq!(engine.snapshot().elections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_runs_on_interval() {
        let relay = MemRelay::new();
        let endpoints = vec!["wss://relay.example".to_owned()];
        let client = Arc::new(relay.client("voter"));
        client.connect(&endpoints).await.unwrap();

        let engine = ElectionSyncEngine::new(Config::new(endpoints.clone(), "ec"), client.clone());
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut snapshots = engine.subscribe();

        // Dropping the connection ends the live subscription, so only the timer can find this
        client.disconnect().await.unwrap();
        relay
            .inject(Event::build("ec", Utc::now(), definition(&election("E2", 1, ElectionStatus::Open))).unwrap())
            .unwrap();
        client.connect(&endpoints).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        snapshots.changed().await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(ids(&snapshot.elections), vec!["E2"]);
        // Silent: the state did not go back to loading
        assert_eq!(snapshot.state, LoadState::Loaded);
    }

    #[tokio::test]
    async fn reconciliation_expires_elections_without_events() {
        let relay = MemRelay::new();
        let endpoints = vec!["wss://relay.example".to_owned()];
        let client = Arc::new(relay.client("voter"));
        client.connect(&endpoints).await.unwrap();

        let mut config = Config::new(endpoints, "ec");
        config.reconcile_window = Duration::from_millis(50);
        let engine = ElectionSyncEngine::new(config, client);

        // About to fall out of the retention window
        let mut ending = election("E1", -13, ElectionStatus::Finished);
        ending.end_time = Utc::now() - ChronoDuration::hours(12) + ChronoDuration::milliseconds(300);
        let event = Event::build("ec", Utc::now(), definition(&ending)).unwrap();

        // Seen once, never stored on this relay
        engine.shared.handle(&event, "push");
        assert_eq!(ids(&engine.snapshot().elections), vec!["E1"]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.reconcile().await.unwrap(), 0);
        assert!(engine.snapshot().elections.is_empty());
        assert!(engine.election("E1").is_none());
    }

    #[test]
    fn prune_drops_only_expired() {
        let now = Utc::now();
        let mut set = ElectionSet::new(ChronoDuration::hours(12));
        set.apply(election("OLDISH", -12, ElectionStatus::Finished), now);
        set.apply(election("NEW", 1, ElectionStatus::Open), now);

        assert_eq!(set.prune(now), 0);
        assert_eq!(set.prune(now + ChronoDuration::hours(2)), 1);
        assert_eq!(ids(&set.to_vec()), vec!["NEW"]);
    }

    #[tokio::test]
    async fn failed_subscription() {
        let relay = MemRelay::new();
        let client = Arc::new(relay.client("voter"));
        let engine = ElectionSyncEngine::new(Config::new(vec!["wss://relay.example".to_owned()], "ec"), client);

        assert!(matches!(engine.start().await, Err(Error::Transport(_))));
        assert!(matches!(engine.snapshot().state, LoadState::Failed(_)));
    }
}
