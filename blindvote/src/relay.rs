use crate::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Observed health of one relay endpoint. Purely informational.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
    pub latency: Option<Duration>,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RelayStatus {
    fn new(url: &str) -> Self {
        RelayStatus {
            url: url.to_owned(),
            connected: false,
            latency: None,
            last_error: None,
            last_seen: None,
        }
    }
}

#[derive(Default)]
struct Hub {
    history: Vec<Event>,
    next_client: usize,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    client: usize,
    filter: Filter,
    sender: UnboundedSender<Event>,
}

impl Hub {
    // Store the event and fan it out, dropping subscribers that went away
    fn deliver(&mut self, event: Event) {
        self.subscribers.retain(|sub| {
            if sub.filter.matches(&event) {
                sub.sender.unbounded_send(event.clone()).is_ok()
            } else {
                !sub.sender.is_closed()
            }
        });
        self.history.push(event);
    }
}

/// An in-process relay.
///
/// Keeps every published event and replays matching history to each new
/// subscription before streaming live events, the way a real relay answers a
/// subscription with stored events first.
#[derive(Default, Clone)]
pub struct MemRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client connection with the given public identity
    pub fn client(&self, public_key: &str) -> MemRelayClient {
        let id = match self.hub.lock() {
            Ok(mut hub) => {
                hub.next_client += 1;
                hub.next_client
            }
            Err(_) => 0,
        };
        MemRelayClient {
            id,
            hub: self.hub.clone(),
            public_key: public_key.to_owned(),
            status: Arc::new(Mutex::new(vec![])),
            fail_publishes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Inject a pre-built event, bypassing any client
    pub fn inject(&self, event: Event) -> Result<(), Error> {
        let mut hub = self.hub.lock().map_err(|_| poisoned())?;
        hub.deliver(event);
        Ok(())
    }

    /// Number of events stored
    pub fn len(&self) -> usize {
        self.hub.lock().map(|hub| hub.history.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One client's connection to a `MemRelay`
#[derive(Clone)]
pub struct MemRelayClient {
    id: usize,
    hub: Arc<Mutex<Hub>>,
    public_key: String,
    status: Arc<Mutex<Vec<RelayStatus>>>,
    fail_publishes: Arc<AtomicUsize>,
}

impl MemRelayClient {
    /// Make the next `n` publishes fail with a transport error
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        let status = self.status.lock().map_err(|_| poisoned())?;
        if status.iter().any(|s| s.connected) {
            Ok(())
        } else {
            Err(Error::Transport("not connected to any relay".to_owned()))
        }
    }

    fn record_error(&self, message: &str) {
        if let Ok(mut status) = self.status.lock() {
            for relay in status.iter_mut() {
                relay.last_error = Some(message.to_owned());
            }
        }
    }

    fn record_seen(&self) {
        if let Ok(mut status) = self.status.lock() {
            let now = Utc::now();
            for relay in status.iter_mut().filter(|s| s.connected) {
                relay.last_seen = Some(now);
            }
        }
    }
}

#[async_trait]
impl Transport for MemRelayClient {
    async fn connect(&self, endpoints: &[String]) -> Result<(), Error> {
        if endpoints.is_empty() {
            return Err(Error::Transport("no relay endpoints given".to_owned()));
        }

        let mut status = self.status.lock().map_err(|_| poisoned())?;
        *status = endpoints
            .iter()
            .map(|url| {
                let mut relay = RelayStatus::new(url);
                relay.connected = true;
                relay.latency = Some(Duration::from_millis(0));
                relay.last_seen = Some(Utc::now());
                relay
            })
            .collect();

        debug!("{} connected to {} relay(s)", self.public_key, endpoints.len());
        Ok(())
    }

    /// Ends every open subscription of this client
    async fn disconnect(&self) -> Result<(), Error> {
        {
            let mut hub = self.hub.lock().map_err(|_| poisoned())?;
            let id = self.id;
            hub.subscribers.retain(|sub| sub.client != id);
        }

        let mut status = self.status.lock().map_err(|_| poisoned())?;
        for relay in status.iter_mut() {
            relay.connected = false;
            relay.latency = None;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<EventStream, Error> {
        self.ensure_connected()?;

        let (sender, receiver) = unbounded();
        let mut hub = self.hub.lock().map_err(|_| poisoned())?;
        for event in hub.history.iter().filter(|e| filter.matches(e)) {
            // The receiver is still in hand, so this cannot fail
            let _ = sender.unbounded_send(event.clone());
        }
        hub.subscribers.push(Subscriber {
            client: self.id,
            filter,
            sender,
        });

        Ok(receiver.boxed())
    }

    async fn publish(&self, recipient: Option<&str>, draft: EventDraft) -> Result<Event, Error> {
        self.ensure_connected()?;

        let failures = self.fail_publishes.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_publishes.store(failures - 1, Ordering::SeqCst);
            let message = "relay rejected publish".to_owned();
            self.record_error(&message);
            return Err(Error::Transport(message));
        }

        let draft = match recipient {
            Some(recipient) => draft.tag(TAG_RECIPIENT, recipient),
            None => draft,
        };
        let event = Event::build(&self.public_key, Utc::now(), draft)?;

        {
            let mut hub = self.hub.lock().map_err(|_| poisoned())?;
            hub.deliver(event.clone());
        }
        self.record_seen();

        Ok(event)
    }

    fn public_key(&self) -> String {
        self.public_key.clone()
    }

    fn relay_status(&self) -> Vec<RelayStatus> {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn poisoned() -> Error {
    Error::Transport("relay lock poisoned".to_owned())
}
