use crate::*;
use blind_rsa_signatures::{BlindSignature, MessageRandomizer, Options, PublicKey, Secret, Signature};
use std::convert::TryInto;

/// Smallest RSA modulus we accept from an election authority
pub const MIN_MODULUS_BITS: usize = 2048;

/// Output of blinding a message.
///
/// The secret never leaves the device. The randomizer travels with the blinded
/// message and is needed again to unblind and verify, so the two are kept
/// together for the lifetime of a session.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BlindingResult {
    #[serde(with = "b64_bytes")]
    pub blinded_message: Vec<u8>,

    #[serde(with = "b64_bytes")]
    pub secret: Vec<u8>,

    #[serde(with = "b64_bytes_opt")]
    pub randomizer: Option<Vec<u8>>,
}

impl std::fmt::Debug for BlindingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlindingResult")
            .field("blinded_message", &base64::encode(&self.blinded_message))
            .field("secret", &"<redacted>")
            .field("randomizer", &self.randomizer.as_ref().map(base64::encode))
            .finish()
    }
}

fn options() -> Options {
    Options::default()
}

/// Parse an authority public key from DER
pub fn parse_public_key(der: &[u8]) -> Result<PublicKey, Error> {
    PublicKey::from_der(der).map_err(|e| Error::InvalidKey(e.to_string()))
}

fn to_randomizer(randomizer: Option<&[u8]>) -> Result<Option<MessageRandomizer>, Error> {
    match randomizer {
        None => Ok(None),
        Some(bytes) => {
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::Unblind("randomizer must be 32 bytes".to_owned()))?;
            Ok(Some(MessageRandomizer(bytes)))
        }
    }
}

/// Blind `message` for signing by the holder of `authority_public_key`.
///
/// The message randomizer is always enabled.
pub fn blind(message: &[u8], authority_public_key: &PublicKey) -> Result<BlindingResult, Error> {
    let mut rng = rand::rngs::OsRng;
    let result = authority_public_key
        .blind(&mut rng, message, true, &options())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;

    // The blinded message is always encoded at the full modulus length
    let modulus_bits = result.blind_msg.0.len() * 8;
    if modulus_bits < MIN_MODULUS_BITS {
        return Err(Error::InvalidKey(format!(
            "modulus of {} bits is below the minimum of {}",
            modulus_bits, MIN_MODULUS_BITS
        )));
    }

    let randomizer = match result.msg_randomizer {
        Some(randomizer) => randomizer.0.to_vec(),
        None => {
            return Err(Error::InvalidKey(
                "blinding produced no message randomizer".to_owned(),
            ))
        }
    };

    Ok(BlindingResult {
        blinded_message: result.blind_msg.0,
        secret: result.secret.0,
        randomizer: Some(randomizer),
    })
}

/// Remove the blinding factor from a signature returned by the authority.
///
/// Malformed inputs yield `Error::Unblind`. A blind signature that does not
/// match the blinded message yields `Error::SignatureVerification`.
pub fn unblind(
    blind_signature: &[u8],
    secret: &[u8],
    randomizer: Option<&[u8]>,
    original_message: &[u8],
    authority_public_key: &PublicKey,
) -> Result<Vec<u8>, Error> {
    if blind_signature.is_empty() || secret.is_empty() {
        return Err(Error::Unblind("empty signature or secret".to_owned()));
    }
    let randomizer = to_randomizer(randomizer)?;

    let signature = authority_public_key
        .finalize(
            &BlindSignature(blind_signature.to_vec()),
            &Secret(secret.to_vec()),
            randomizer,
            original_message,
            &options(),
        )
        .map_err(|e| match e {
            blind_rsa_signatures::Error::VerificationFailed => Error::SignatureVerification,
            e => Error::Unblind(e.to_string()),
        })?;

    Ok(signature.0)
}

/// Verify an unblinded signature over `message`.
///
/// Returns `Ok(false)` for any signature that does not verify, including one made
/// for a different message or randomizer. Errors are reserved for operational
/// failures such as an unusable key.
pub fn verify(
    signature: &[u8],
    randomizer: Option<&[u8]>,
    message: &[u8],
    authority_public_key: &PublicKey,
) -> Result<bool, Error> {
    let randomizer = match to_randomizer(randomizer) {
        Ok(randomizer) => randomizer,
        Err(_) => return Ok(false),
    };

    match Signature(signature.to_vec()).verify(authority_public_key, randomizer, message, &options()) {
        Ok(()) => Ok(true),
        Err(blind_rsa_signatures::Error::InvalidKey) => {
            Err(Error::InvalidKey("authority key rejected during verification".to_owned()))
        }
        Err(e) => {
            debug!("signature rejected: {}", e);
            Ok(false)
        }
    }
}
