use crate::*;
use blind_rsa_signatures::PublicKey;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;

/// Storage key of the active voting session
pub const SESSION_KEY: &str = "blindvote.session";

/// The persisted session record, including completed ones kept for audit
pub fn stored_session<S: SecureStore + ?Sized>(store: &S) -> Result<VotingSession, Error> {
    match store.read(SESSION_KEY)? {
        Some(bytes) => VotingSession::decode(&bytes),
        None => Err(Error::NoActiveSession),
    }
}

/// Drives one voting attempt through its steps.
///
/// Each step either succeeds and advances, or records an error and stays put.
/// The session is persisted after every transition so it can be resumed after a
/// crash. There is at most one session per store.
pub struct VotingSessionMachine<T: Transport, S: SecureStore> {
    config: Config,
    transport: Arc<T>,
    store: S,
    session: VotingSession,
    authority_key: PublicKey,
    identity: Option<VoterIdentity>,
}

impl<T: Transport, S: SecureStore> VotingSessionMachine<T, S> {
    /// Begin a new session for `candidate_id` in `election`
    pub fn start(
        config: Config,
        transport: Arc<T>,
        store: S,
        election: &Election,
        candidate_id: u32,
    ) -> Result<Self, Error> {
        config.validate()?;

        if let Some(bytes) = store.read(SESSION_KEY)? {
            match VotingSession::decode(&bytes) {
                Ok(existing) if !existing.is_complete() => {
                    return Err(Error::SessionActive(existing.id))
                }
                Ok(existing) => debug!("replacing completed session {}", existing.id),
                Err(e) => warn!("replacing unreadable stored session: {}", e),
            }
        }

        let candidate = election
            .candidate(candidate_id)
            .cloned()
            .ok_or(Error::InvalidCandidate(candidate_id))?;
        if !election.is_open_at(Utc::now()) {
            return Err(Error::ElectionNotOpen(election.id.clone()));
        }
        let authority_key = election.public_key()?;

        let session = VotingSession::new(election.clone(), candidate, &transport.public_key());
        let machine = VotingSessionMachine {
            config,
            transport,
            store,
            session,
            authority_key,
            identity: None,
        };
        machine.persist()?;

        info!(
            "started voting session {} for election {}",
            machine.session.id, election.id
        );
        Ok(machine)
    }

    /// Load the persisted session, if there is one.
    ///
    /// A session that fails its integrity checks is deleted and the error returned.
    pub fn resume(config: Config, transport: Arc<T>, store: S) -> Result<Option<Self>, Error> {
        config.validate()?;

        let bytes = match store.read(SESSION_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let (session, authority_key, identity) = match Self::check_stored(&bytes) {
            Ok(checked) => checked,
            Err(e) => {
                error!("discarding stored voting session: {}", e);
                store.delete(SESSION_KEY)?;
                return Err(e);
            }
        };

        info!(
            "resumed voting session {} at step {}",
            session.id, session.step
        );
        Ok(Some(VotingSessionMachine {
            config,
            transport,
            store,
            session,
            authority_key,
            identity,
        }))
    }

    fn check_stored(
        bytes: &[u8],
    ) -> Result<(VotingSession, PublicKey, Option<VoterIdentity>), Error> {
        let session = VotingSession::decode(bytes)?;
        let authority_key = parse_public_key(&session.ec_public_key)?;

        let identity = match &session.nonce {
            Some(record) => Some(VoterIdentity::from_stored(
                &record.nonce,
                &record.hashed_nonce,
            )?),
            None => None,
        };

        // Every step past nonce generation depends on what it produced.
        // Once complete only the signature and vote remain.
        let step = session.step;
        let in_flight = step > VotingStep::GenerateNonce && step < VotingStep::Complete;
        if in_flight && (identity.is_none() || session.blinding.is_none()) {
            return Err(Error::Integrity);
        }
        if step == VotingStep::Complete && session.vote.is_none() {
            return Err(Error::Integrity);
        }
        if step > VotingStep::WaitForSignature && session.signature.is_none() {
            return Err(Error::Integrity);
        }

        if let Some(signature) = &session.signature {
            signature.reverify(session.randomizer(), &authority_key)?;
            if let Some(identity) = &identity {
                if signature.message() != &identity.hashed_nonce()[..] {
                    return Err(Error::Integrity);
                }
            }
            if let Some(vote) = &session.vote {
                if signature.message() != vote.hashed_nonce() {
                    return Err(Error::Integrity);
                }
            }
        }

        Ok((session, authority_key, identity))
    }

    /// Delete any persisted session
    pub fn discard(store: &S) -> Result<(), Error> {
        store.delete(SESSION_KEY)
    }

    pub fn step(&self) -> VotingStep {
        self.session.step
    }

    /// The error that halted the current step, if any
    pub fn error(&self) -> Option<&StepError> {
        self.session.error.as_ref()
    }

    pub fn session(&self) -> &VotingSession {
        &self.session
    }

    /// The hashed nonce, which outlives the raw nonce once the vote is cast
    pub fn hashed_nonce(&self) -> Option<&[u8]> {
        match (&self.identity, &self.session.vote) {
            (Some(identity), _) => Some(&identity.hashed_nonce()[..]),
            (None, Some(vote)) => Some(vote.hashed_nonce()),
            (None, None) => None,
        }
    }

    /// The vote, once cast
    pub fn vote(&self) -> Option<&CastableVote> {
        self.session.vote.as_ref()
    }

    /// Perform the current step and move to the next
    pub async fn advance(&mut self) -> Result<VotingStep, Error> {
        if let Some(error) = &self.session.error {
            if error.retryable {
                return Err(Error::InvalidStep(self.session.step));
            }
            return Err(Error::SessionFailed(error.message.clone()));
        }
        self.execute().await
    }

    /// Advance until the vote has been cast
    pub async fn run(&mut self) -> Result<CastableVote, Error> {
        while self.session.step != VotingStep::Complete {
            self.advance().await?;
        }
        self.session
            .vote
            .clone()
            .ok_or_else(|| Error::InvalidStep(VotingStep::Complete))
    }

    /// Re-run the step that failed, from the persisted session state.
    ///
    /// Only the failed step is repeated. From `Initial` the whole pipeline runs.
    /// Terminal errors cannot be retried; use `restart` instead.
    pub async fn retry_current_step(&mut self) -> Result<VotingStep, Error> {
        if self.session.step == VotingStep::Initial {
            self.session.error = None;
            self.run().await?;
            return Ok(self.session.step);
        }

        let reconnect_first = match &self.session.error {
            None => return Err(Error::InvalidStep(self.session.step)),
            Some(error) if !error.retryable => {
                return Err(Error::SessionFailed(error.message.clone()))
            }
            Some(error) => error.reconnect,
        };

        if reconnect_first {
            info!("reconnecting before retrying step {}", self.session.step);
            if let Err(e) = reconnect(&*self.transport, &self.config.relays).await {
                self.fail(self.session.step, &e);
                return Err(e);
            }
        }

        self.session.error = None;
        self.execute().await
    }

    /// Throw away this attempt and start again with a fresh nonce.
    ///
    /// Not possible once the vote has been cast.
    pub fn restart(&mut self) -> Result<(), Error> {
        if self.session.step == VotingStep::Complete {
            return Err(Error::InvalidStep(VotingStep::Complete));
        }

        let old_id = self.session.id;
        let election = self.session.election.clone();
        let candidate = self.session.candidate.clone();

        self.store.delete(SESSION_KEY)?;
        self.session = VotingSession::new(election, candidate, &self.transport.public_key());
        self.authority_key = parse_public_key(&self.session.ec_public_key)?;
        self.identity = None;
        self.persist()?;

        info!("restarted voting session {} as {}", old_id, self.session.id);
        Ok(())
    }

    async fn execute(&mut self) -> Result<VotingStep, Error> {
        let step = self.session.step;
        let result = match step {
            VotingStep::Initial => Ok(()),
            VotingStep::GenerateNonce => self.generate_nonce(),
            VotingStep::SendBlindedNonce => self.send_blinded_nonce().await,
            VotingStep::WaitForSignature => self.wait_for_signature().await,
            VotingStep::CastVote => self.cast_vote().await,
            VotingStep::Complete => return Ok(VotingStep::Complete),
        };

        if let Err(e) = result {
            self.fail(step, &e);
            return Err(e);
        }

        self.session.step = step.next();
        self.session.error = None;
        if self.session.step == VotingStep::Complete {
            // Keep the record, drop the secrets. The vote carries the hashed nonce.
            self.session.blinding = None;
            self.session.nonce = None;
            self.identity = None;
        }

        if let Err(e) = self.persist() {
            self.fail(self.session.step, &e);
            return Err(e);
        }

        debug!(
            "voting session {}: {} -> {}",
            self.session.id, step, self.session.step
        );
        Ok(self.session.step)
    }

    fn fail(&mut self, step: VotingStep, error: &Error) {
        if error.is_terminal() {
            error!(
                "voting session {} failed at step {}: {}",
                self.session.id, step, error
            );
        } else {
            warn!(
                "voting session {} failed at step {}: {}",
                self.session.id, step, error
            );
        }
        self.session.error = Some(StepError::from(error));

        if let Error::Integrity = error {
            if let Err(e) = self.store.delete(SESSION_KEY) {
                error!("cannot discard corrupted session: {}", e);
            }
        } else if let Err(e) = self.persist() {
            error!("cannot persist failed session {}: {}", self.session.id, e);
        }
    }

    fn persist(&self) -> Result<(), Error> {
        self.store.write(SESSION_KEY, &self.session.encode()?)
    }

    fn generate_nonce(&mut self) -> Result<(), Error> {
        let identity = VoterIdentity::generate();
        let blinding = blind(identity.hashed_nonce(), &self.authority_key)?;

        self.session.nonce = Some(NonceRecord::from(&identity));
        self.session.blinding = Some(blinding);

        // A signature is useless without the blinding secret, so it must hit storage first
        if let Err(e) = self.persist() {
            self.session.nonce = None;
            self.session.blinding = None;
            return Err(e);
        }

        self.identity = Some(identity);
        Ok(())
    }

    async fn send_blinded_nonce(&mut self) -> Result<(), Error> {
        let blinded_nonce = match &self.session.blinding {
            Some(blinding) => blinding.blinded_message.clone(),
            None => return Err(Error::Integrity),
        };

        let election_id = self.session.election.id.clone();
        let request = SignatureRequest {
            election_id: election_id.clone(),
            blinded_nonce,
            voter_public_key: self.session.voter_public_key.clone(),
        };
        let draft = EventDraft::new(EventKind::SignatureRequest, serde_json::to_string(&request)?)
            .tag(TAG_ELECTION, &election_id);

        let event = self
            .transport
            .publish(Some(&self.config.ec_public_key), draft)
            .await?;
        self.session.request_event_id = Some(event.id);

        Ok(())
    }

    async fn wait_for_signature(&mut self) -> Result<(), Error> {
        let election_id = self.session.election.id.clone();
        let request_id = self.session.request_event_id.clone();
        let filter = Filter::kind(EventKind::SignatureResponse)
            .tag(TAG_ELECTION, &election_id)
            .tag(TAG_RECIPIENT, &self.session.voter_public_key)
            .since(self.session.created_at);

        let mut events = self.transport.subscribe(filter).await?;
        let wait = async {
            while let Some(event) = events.next().await {
                match Message::decode(&event) {
                    Ok(Message::SignatureResponse(response)) => {
                        if response.election_id != election_id {
                            continue;
                        }
                        if let (Some(expected), Some(answered)) = (&request_id, &response.request_id) {
                            if expected != answered {
                                debug!("skipping signature response to request {}", answered);
                                continue;
                            }
                        }
                        return Ok(response);
                    }
                    Ok(_) => continue,
                    Err(e) => warn!("dropping malformed signature response {}: {}", event.id, e),
                }
            }
            Err(Error::Transport("signature subscription closed".to_owned()))
        };

        let timeout = self.config.signature_timeout;
        let response = match tokio::time::timeout(timeout, wait).await {
            Ok(response) => response?,
            Err(_) => return Err(Error::Timeout(timeout)),
        };

        let (identity, blinding) = match (&self.identity, &self.session.blinding) {
            (Some(identity), Some(blinding)) => (identity, blinding),
            _ => return Err(Error::Integrity),
        };

        let token = unblind(
            &response.blind_signature,
            &blinding.secret,
            blinding.randomizer.as_deref(),
            identity.hashed_nonce(),
            &self.authority_key,
        )?;
        let signature = VoteSignature::verified(
            token,
            blinding.randomizer.as_deref(),
            identity.hashed_nonce(),
            &self.authority_key,
        )?;

        self.session.signature = Some(signature);
        Ok(())
    }

    async fn cast_vote(&mut self) -> Result<(), Error> {
        let signature = self.session.signature.as_ref().ok_or(Error::Integrity)?;
        let randomizer = self.session.randomizer().map(<[u8]>::to_vec);
        let vote = CastableVote::new(
            &self.session.election.id,
            signature,
            randomizer,
            self.session.candidate.id,
            &self.session.voter_public_key,
        );

        let draft = EventDraft::new(EventKind::Vote, vote.to_json()?)
            .tag(TAG_ELECTION, &self.session.election.id);

        // Done once the relay accepts it; acceptance by the commission is its own business
        self.transport
            .publish(Some(&self.config.ec_public_key), draft)
            .await?;
        self.session.vote = Some(vote);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        relay: MemRelay,
        voter: Arc<MemRelayClient>,
        ec: Arc<MemRelayClient>,
        store: MemStore,
        config: Config,
        election: Election,
    }

    async fn fixture() -> Fixture {
        let (authority, _) = test_authority();
        let relay = MemRelay::new();
        let mut config = Config::new(vec!["wss://relay.example".to_owned()], "ec");
        config.signature_timeout = Duration::from_secs(5);

        let voter = Arc::new(relay.client("voter"));
        let ec = Arc::new(relay.client("ec"));
        voter.connect(&config.relays).await.unwrap();
        ec.connect(&config.relays).await.unwrap();

        let now = Utc::now();
        let election = Election {
            id: "E1".to_owned(),
            name: "Test election".to_owned(),
            candidates: vec![Candidate::new(1, "C1"), Candidate::new(2, "C2")],
            rsa_pub_key: authority.public_key_der().unwrap(),
            start_time: now - ChronoDuration::seconds(1),
            end_time: now + ChronoDuration::hours(1),
            status: ElectionStatus::Open,
        };

        Fixture {
            relay,
            voter,
            ec,
            store: MemStore::default(),
            config,
            election,
        }
    }

    fn responder(f: &Fixture) -> tokio::task::JoinHandle<()> {
        let (authority, secret) = test_authority();
        spawn_signature_responder(
            f.ec.clone(),
            authority.clone(),
            secret.clone(),
            f.election.id.clone(),
        )
    }

    #[tokio::test]
    async fn votes_end_to_end() {
        let f = fixture().await;
        let _responder = responder(&f);
        let (authority, _) = test_authority();

        let mut machine = VotingSessionMachine::start(
            f.config.clone(),
            f.voter.clone(),
            f.store.clone(),
            &f.election,
            1,
        )
        .unwrap();
        assert_eq!(machine.step(), VotingStep::Initial);

        let vote = machine.run().await.unwrap();
        assert_eq!(machine.step(), VotingStep::Complete);
        assert!(machine.error().is_none());
        assert_eq!(vote.candidate_id(), 1);
        assert_eq!(vote.hashed_nonce(), &machine.hashed_nonce().unwrap()[..]);
        assert!(vote.verify(&authority.public_key).unwrap());

        // Secrets are gone, the record is kept
        let stored = stored_session(&f.store).unwrap();
        assert!(stored.is_complete());
        assert!(stored.blinding.is_none());
        assert!(stored.nonce.is_none());
        assert_eq!(stored.vote.as_ref(), Some(&vote));

        // A completed record still resumes for audit
        let audited = VotingSessionMachine::resume(f.config.clone(), f.voter.clone(), f.store.clone())
            .unwrap()
            .unwrap();
        assert_eq!(audited.step(), VotingStep::Complete);
        assert_eq!(audited.hashed_nonce().unwrap(), vote.hashed_nonce());

        // The commission received exactly one vote
        let mut votes = f
            .ec
            .subscribe(Filter::kind(EventKind::Vote).tag(TAG_RECIPIENT, "ec"))
            .await
            .unwrap();
        let event = votes.next().await.unwrap();
        match Message::decode(&event).unwrap() {
            Message::Vote(received) => assert_eq!(received, vote),
            other => panic!("unexpected message {:?}", other.kind()),
        }
        assert_eq!(f.relay.len(), 3);

        // Nothing left to do
        assert_eq!(machine.advance().await.unwrap(), VotingStep::Complete);
        assert!(machine.restart().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_without_new_nonce() {
        let f = fixture().await;
        let mut machine = VotingSessionMachine::start(
            f.config.clone(),
            f.voter.clone(),
            f.store.clone(),
            &f.election,
            2,
        )
        .unwrap();

        assert_eq!(machine.advance().await.unwrap(), VotingStep::GenerateNonce);
        assert_eq!(machine.advance().await.unwrap(), VotingStep::SendBlindedNonce);
        let hashed_nonce = machine.hashed_nonce().unwrap().to_vec();
        assert_eq!(machine.advance().await.unwrap(), VotingStep::WaitForSignature);

        // No commission is listening
        let result = machine.advance().await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(machine.step(), VotingStep::WaitForSignature);
        assert!(machine.error().unwrap().retryable);

        // Can't just carry on
        assert!(matches!(machine.advance().await, Err(Error::InvalidStep(_))));

        let _responder = responder(&f);
        assert_eq!(machine.retry_current_step().await.unwrap(), VotingStep::CastVote);
        assert_eq!(machine.hashed_nonce().unwrap(), &hashed_nonce[..]);
        assert!(machine.error().is_none());

        // The request was only sent once
        let mut requests = f
            .ec
            .subscribe(Filter::kind(EventKind::SignatureRequest))
            .await
            .unwrap();
        assert!(requests.next().await.is_some());
        assert_eq!(f.relay.len(), 2);

        assert_eq!(machine.advance().await.unwrap(), VotingStep::Complete);
    }

    #[tokio::test]
    async fn bad_signature_is_terminal() {
        let f = fixture().await;
        let mut machine = VotingSessionMachine::start(
            f.config.clone(),
            f.voter.clone(),
            f.store.clone(),
            &f.election,
            1,
        )
        .unwrap();
        for _ in 0..3 {
            machine.advance().await.unwrap();
        }
        let first_nonce = machine.hashed_nonce().unwrap().to_vec();

        // A response that does not match our blinding
        let response = SignatureResponse {
            election_id: "E1".to_owned(),
            blind_signature: vec![1u8; 256],
            request_id: None,
        };
        let draft = EventDraft::new(
            EventKind::SignatureResponse,
            serde_json::to_string(&response).unwrap(),
        )
        .tag(TAG_ELECTION, "E1");
        f.ec.publish(Some("voter"), draft).await.unwrap();

        let result = machine.advance().await;
        assert!(matches!(
            result,
            Err(Error::SignatureVerification) | Err(Error::Unblind(_))
        ));
        assert!(!machine.error().unwrap().retryable);
        assert!(machine.session().signature.is_none());
        assert!(matches!(
            machine.retry_current_step().await,
            Err(Error::SessionFailed(_))
        ));

        // A fresh session gets a fresh nonce
        machine.restart().unwrap();
        assert_eq!(machine.step(), VotingStep::Initial);
        assert!(machine.error().is_none());
        machine.advance().await.unwrap();
        machine.advance().await.unwrap();
        assert_ne!(machine.hashed_nonce().unwrap(), &first_nonce[..]);
    }

    #[tokio::test]
    async fn transport_error_reconnects_and_retries() {
        let f = fixture().await;
        let mut machine = VotingSessionMachine::start(
            f.config.clone(),
            f.voter.clone(),
            f.store.clone(),
            &f.election,
            1,
        )
        .unwrap();
        machine.advance().await.unwrap();
        machine.advance().await.unwrap();

        f.voter.fail_next_publishes(1);
        assert!(matches!(machine.advance().await, Err(Error::Transport(_))));
        assert_eq!(machine.step(), VotingStep::SendBlindedNonce);
        assert!(machine.error().unwrap().reconnect);

        f.voter.disconnect().await.unwrap();
        assert_eq!(
            machine.retry_current_step().await.unwrap(),
            VotingStep::WaitForSignature
        );
        assert!(f.voter.relay_status()[0].connected);
        assert!(machine.session().request_event_id.is_some());
    }

    #[tokio::test]
    async fn resume_after_crash() {
        let f = fixture().await;
        let hashed_nonce = {
            let mut machine = VotingSessionMachine::start(
                f.config.clone(),
                f.voter.clone(),
                f.store.clone(),
                &f.election,
                1,
            )
            .unwrap();
            machine.advance().await.unwrap();
            machine.advance().await.unwrap();
            machine.hashed_nonce().unwrap().to_vec()
        };

        // Only one session at a time
        assert!(matches!(
            VotingSessionMachine::start(
                f.config.clone(),
                f.voter.clone(),
                f.store.clone(),
                &f.election,
                1
            ),
            Err(Error::SessionActive(_))
        ));

        let _responder = responder(&f);
        let mut machine =
            VotingSessionMachine::resume(f.config.clone(), f.voter.clone(), f.store.clone())
                .unwrap()
                .unwrap();
        assert_eq!(machine.step(), VotingStep::SendBlindedNonce);
        assert_eq!(machine.hashed_nonce().unwrap(), &hashed_nonce[..]);

        let vote = machine.run().await.unwrap();
        assert_eq!(vote.hashed_nonce(), &hashed_nonce[..]);
    }

    #[tokio::test]
    async fn tampered_session_is_discarded() {
        let f = fixture().await;
        {
            let mut machine = VotingSessionMachine::start(
                f.config.clone(),
                f.voter.clone(),
                f.store.clone(),
                &f.election,
                1,
            )
            .unwrap();
            machine.advance().await.unwrap();
            machine.advance().await.unwrap();
        }

        let mut session = VotingSession::decode(&f.store.read(SESSION_KEY).unwrap().unwrap()).unwrap();
        if let Some(record) = session.nonce.as_mut() {
            record.nonce[0] ^= 0xff;
        }
        f.store.write(SESSION_KEY, &session.encode().unwrap()).unwrap();

        let resumed = VotingSessionMachine::resume(f.config.clone(), f.voter.clone(), f.store.clone());
        assert!(matches!(resumed, Err(Error::Integrity)));
        assert!(f.store.read(SESSION_KEY).unwrap().is_none());

        let none = VotingSessionMachine::resume(f.config.clone(), f.voter.clone(), f.store.clone());
        assert!(none.unwrap().is_none());
        assert!(matches!(stored_session(&f.store), Err(Error::NoActiveSession)));
    }

    #[tokio::test]
    async fn start_preconditions() {
        let f = fixture().await;

        assert!(matches!(
            VotingSessionMachine::start(f.config.clone(), f.voter.clone(), f.store.clone(), &f.election, 9),
            Err(Error::InvalidCandidate(9))
        ));

        let mut closed = f.election.clone();
        closed.status = ElectionStatus::Finished;
        assert!(matches!(
            VotingSessionMachine::start(f.config.clone(), f.voter.clone(), f.store.clone(), &closed, 1),
            Err(Error::ElectionNotOpen(_))
        ));

        let bad_config = Config::new(vec![], "ec");
        assert!(matches!(
            VotingSessionMachine::start(bad_config, f.voter.clone(), f.store.clone(), &f.election, 1),
            Err(Error::Configuration(_))
        ));
        assert!(f.store.is_empty());
    }
}
