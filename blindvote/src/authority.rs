use crate::*;
use blind_rsa_signatures::{KeyPair, Options, PublicKey, SecretKey};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// An election commission's blind-signing identity.
///
/// The commission signs blinded nonces without learning them. Voters only ever
/// see `public_key`.
#[derive(Clone)]
pub struct Authority {
    pub id: Uuid,
    pub public_key: PublicKey,
}

impl Authority {
    /// Generate a new authority keypair
    pub fn new(modulus_bits: usize) -> Result<(Self, SecretKey), Error> {
        if modulus_bits < MIN_MODULUS_BITS {
            return Err(Error::InvalidKey(format!(
                "refusing to generate a {} bit key",
                modulus_bits
            )));
        }

        let mut csprng = rand::rngs::OsRng;
        let KeyPair { pk, sk } = KeyPair::generate(&mut csprng, modulus_bits)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        let authority = Authority {
            id: Uuid::new_v4(),
            public_key: pk,
        };
        Ok((authority, sk))
    }

    /// DER encoding of the public key, as published in election definitions
    pub fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        self.public_key
            .to_der()
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Sign a blinded message
    pub fn sign_blinded(&self, secret: &SecretKey, blinded_message: &[u8]) -> Result<Vec<u8>, Error> {
        let mut csprng = rand::rngs::OsRng;
        let blind_sig = secret
            .blind_sign(&mut csprng, blinded_message, &Options::default())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(blind_sig.0)
    }
}

/// Answer signature requests addressed to `transport`'s identity for one election.
///
/// Runs until the subscription ends or the returned handle is aborted.
pub fn spawn_signature_responder<T: Transport>(
    transport: Arc<T>,
    authority: Authority,
    secret: SecretKey,
    election_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let filter = Filter::kind(EventKind::SignatureRequest)
            .tag(TAG_ELECTION, &election_id)
            .tag(TAG_RECIPIENT, &transport.public_key());

        let mut events = match transport.subscribe(filter).await {
            Ok(events) => events,
            Err(e) => {
                error!("signature responder for {} cannot subscribe: {}", election_id, e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            let request = match Message::decode(&event) {
                Ok(Message::SignatureRequest(request)) => request,
                Ok(other) => {
                    warn!("signature responder ignoring {} event {}", other.kind(), event.id);
                    continue;
                }
                Err(e) => {
                    warn!("signature responder dropping event {}: {}", event.id, e);
                    continue;
                }
            };

            let blind_signature = match authority.sign_blinded(&secret, &request.blinded_nonce) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!("cannot sign request from {}: {}", request.voter_public_key, e);
                    continue;
                }
            };

            let response = SignatureResponse {
                election_id: request.election_id.clone(),
                blind_signature,
                request_id: Some(event.id.clone()),
            };
            let content = match serde_json::to_string(&response) {
                Ok(content) => content,
                Err(e) => {
                    error!("cannot encode signature response: {}", e);
                    continue;
                }
            };
            let draft = EventDraft::new(EventKind::SignatureResponse, content)
                .tag(TAG_ELECTION, &request.election_id);

            match transport.publish(Some(&request.voter_public_key), draft).await {
                Ok(_) => debug!("signed blinded nonce for {}", request.voter_public_key),
                Err(e) => warn!("cannot deliver signature to {}: {}", request.voter_public_key, e),
            }
        }
    })
}

#[cfg(test)]
lazy_static::lazy_static! {
    static ref TEST_AUTHORITY: (Authority, SecretKey) =
        Authority::new(2048).expect("generate test authority");
}

/// A 2048-bit authority shared across tests, since key generation is slow
#[cfg(test)]
pub(crate) fn test_authority() -> (&'static Authority, &'static SecretKey) {
    (&TEST_AUTHORITY.0, &TEST_AUTHORITY.1)
}
