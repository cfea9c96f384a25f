use blindvote::*;
use chrono::{Duration, Utc};
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;

const EC_IDENTITY: &str = "ec";
const ELECTION_ID: &str = "demo";

pub async fn command_demo(matches: &clap::ArgMatches<'_>, relays: Vec<String>) {
    let voters: usize = match matches.value_of("voters").unwrap_or("5").parse() {
        Ok(n) if n > 0 => n,
        _ => crate::exit_with("demo", "--voters must be a positive number"),
    };

    let config = Config::new(relays, EC_IDENTITY);
    if let Err(e) = config.validate() {
        crate::exit_with("demo", e);
    }

    if let Err(e) = run(config, voters).await {
        crate::exit_with("demo", e);
    }
}

async fn run(config: Config, voters: usize) -> Result<(), Error> {
    let relay = MemRelay::new();

    // Election commission
    info!("generating election commission key");
    let (authority, secret) = Authority::new(2048)?;
    let ec = Arc::new(relay.client(EC_IDENTITY));
    ec.connect(&config.relays).await?;

    let now = Utc::now();
    let election = Election {
        id: ELECTION_ID.to_owned(),
        name: "Demo election".to_owned(),
        candidates: vec![
            Candidate::new(1, "Alice"),
            Candidate::new(2, "Bob"),
            Candidate::new(3, "Carol"),
        ],
        rsa_pub_key: authority.public_key_der()?,
        start_time: now - Duration::seconds(1),
        end_time: now + Duration::hours(1),
        status: ElectionStatus::Open,
    };
    ec.publish(
        None,
        EventDraft::new(EventKind::ElectionDefinition, election.to_json()?),
    )
    .await?;
    let responder = spawn_signature_responder(ec.clone(), authority.clone(), secret, election.id.clone());

    // Voters
    for n in 0..voters {
        let voter = Arc::new(relay.client(&format!("voter-{}", n)));
        voter.connect(&config.relays).await?;

        let synced = sync_election(&config, voter.clone()).await?;
        let candidate = match synced.candidates.choose(&mut rand::thread_rng()) {
            Some(candidate) => candidate.id,
            None => return Err(Error::InvalidCandidate(0)),
        };

        let mut machine =
            VotingSessionMachine::start(config.clone(), voter, MemStore::default(), &synced, candidate)?;
        let vote = machine.run().await?;
        let token = vote.token();
        println!("voter-{} voted, token {}...", n, hex::encode(&token[..token.len().min(8)]));
    }
    responder.abort();

    // Count what arrived and publish the tally
    let mut received = ec
        .subscribe(Filter::kind(EventKind::Vote).tag(TAG_ELECTION, ELECTION_ID))
        .await?;
    let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..voters {
        let event = match received.next().await {
            Some(event) => event,
            None => return Err(Error::Transport("vote subscription ended".to_owned())),
        };
        let vote = match Message::decode(&event)? {
            Message::Vote(vote) => vote,
            other => return Err(Error::Parse(format!("unexpected {} event", other.kind()))),
        };
        if !vote.verify(&authority.public_key)? || !seen.insert(vote.hashed_nonce().to_vec()) {
            warn!("rejecting vote {}", event.id);
            continue;
        }
        *counts.entry(vote.candidate_id()).or_default() += 1;
    }

    let observer = Arc::new(relay.client("observer"));
    observer.connect(&config.relays).await?;
    let results = ResultsAggregator::new(observer, MemStore::default());
    results.attach_election(&election)?;
    results.watch(ELECTION_ID).await?;
    let mut updates = results.updates();

    let pairs: Vec<(u32, u64)> = counts.into_iter().collect();
    ec.publish(
        None,
        EventDraft::new(EventKind::Tally, serde_json::to_string(&pairs)?).tag(TAG_ELECTION, ELECTION_ID),
    )
    .await?;
    updates.next().await;

    let result = results
        .result(ELECTION_ID)
        .ok_or_else(|| Error::Transport("no tally received".to_owned()))?;
    print_result(&result);
    results.stop();

    Ok(())
}

// Wait for the election list to contain the demo election
async fn sync_election(config: &Config, voter: Arc<MemRelayClient>) -> Result<Election, Error> {
    let sync = ElectionSyncEngine::new(config.clone(), voter);
    let mut snapshots = sync.subscribe();
    sync.start().await?;

    let wait = async {
        loop {
            if let Some(election) = sync.election(ELECTION_ID) {
                return Ok(election);
            }
            if snapshots.changed().await.is_err() {
                return Err(Error::Transport("election sync stopped".to_owned()));
            }
        }
    };
    let timeout = config.signature_timeout;
    let election = match tokio::time::timeout(timeout, wait).await {
        Ok(election) => election?,
        Err(_) => return Err(Error::Timeout(timeout)),
    };

    sync.stop();
    Ok(election)
}

fn print_result(result: &ElectionResult) {
    let percentages = result.percentages();
    println!("Tally:");
    for (candidate, votes) in result.ranking() {
        println!(
            "  {} got {} votes ({:.1}%)",
            result.candidate_name(candidate).unwrap_or("unknown"),
            votes,
            percentages.get(&candidate).copied().unwrap_or(0.0)
        );
    }
    match result.winner().and_then(|w| result.candidate_name(w)) {
        Some(name) => println!("Winner: {}", name),
        None => println!("No winner"),
    }
}
