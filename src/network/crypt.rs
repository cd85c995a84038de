//! Login cryptography for the front leg.
//!
//! Signed compact tokens (Ed25519), identity chain verification, the
//! X25519 key exchange that follows login, and the per-direction frame
//! cipher that is switched on once the handshake token has been sent.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of the per-session symmetric key
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce direction tag for server -> client frames
pub const DIR_CLIENTBOUND: u8 = 0x00;
/// Nonce direction tag for client -> server frames
pub const DIR_SERVERBOUND: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Malformed token: {0}")]
    MalformedToken(&'static str),

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Token JSON invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid public key")]
    InvalidKey,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Token expired")]
    Expired,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Identity chain is empty")]
    EmptyChain,

    #[error("Identity chain broken at link {0}")]
    BrokenChain(usize),

    #[error("Missing claim: {0}")]
    MissingClaim(&'static str),

    #[error("Frame authentication failed")]
    FrameAuthentication,
}

/// Decode a standard-base64 Ed25519 verifying key.
pub fn decode_verifying_key(b64: &str) -> Result<VerifyingKey, CryptoError> {
    let raw = STANDARD.decode(b64.trim())?;
    let bytes: [u8; 32] = raw.try_into().map_err(|_| CryptoError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey)
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Fresh random signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::from_bytes(&rand::random::<[u8; 32]>())
}

/// Sign `payload` into a compact `header.payload.signature` token.
///
/// The header names the signer through `x5u` so the receiver can verify
/// without any out-of-band key distribution.
pub fn encode_token(key: &SigningKey, payload: &Value) -> Result<String, CryptoError> {
    let header = json!({
        "alg": "EdDSA",
        "x5u": encode_verifying_key(&key.verifying_key()),
    });
    let head = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
    let signing_input = format!("{}.{}", head, body);
    let signature = key.sign(signing_input.as_bytes());
    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// A token split into its parts, signature not yet checked.
struct RawToken<'a> {
    header: Value,
    payload: Value,
    signing_input: &'a str,
    signature: Signature,
}

fn split_token(token: &str) -> Result<RawToken<'_>, CryptoError> {
    let last_dot = token.rfind('.').ok_or(CryptoError::MalformedToken("no signature"))?;
    let signing_input = &token[..last_dot];
    let (head, body) = signing_input
        .split_once('.')
        .ok_or(CryptoError::MalformedToken("no payload"))?;

    let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(head)?)?;
    let payload: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body)?)?;

    let sig_raw = URL_SAFE_NO_PAD.decode(&token[last_dot + 1..])?;
    let sig_bytes: [u8; 64] = sig_raw
        .try_into()
        .map_err(|_| CryptoError::MalformedToken("signature length"))?;

    match header.get("alg").and_then(Value::as_str) {
        Some("EdDSA") => {}
        Some(other) => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        None => return Err(CryptoError::MalformedToken("no alg")),
    }

    Ok(RawToken {
        header,
        payload,
        signing_input,
        signature: Signature::from_bytes(&sig_bytes),
    })
}

/// The key a token claims to be signed by (its `x5u` header).
pub fn token_signer(token: &str) -> Result<VerifyingKey, CryptoError> {
    let raw = split_token(token)?;
    header_signer(&raw.header)
}

fn header_signer(header: &Value) -> Result<VerifyingKey, CryptoError> {
    let x5u = header
        .get("x5u")
        .and_then(Value::as_str)
        .ok_or(CryptoError::MissingClaim("x5u"))?;
    decode_verifying_key(x5u)
}

fn check_validity(payload: &Value, now: i64) -> Result<(), CryptoError> {
    if let Some(exp) = payload.get("exp").and_then(Value::as_i64) {
        if now >= exp {
            return Err(CryptoError::Expired);
        }
    }
    if let Some(nbf) = payload.get("nbf").and_then(Value::as_i64) {
        if now < nbf {
            return Err(CryptoError::NotYetValid);
        }
    }
    Ok(())
}

/// Verify `token` against `key` and return its payload.
pub fn verify_token(token: &str, key: &VerifyingKey, now: i64) -> Result<Value, CryptoError> {
    let raw = split_token(token)?;
    key.verify(raw.signing_input.as_bytes(), &raw.signature)
        .map_err(|_| CryptoError::BadSignature)?;
    check_validity(&raw.payload, now)?;
    Ok(raw.payload)
}

/// Outcome of walking an identity chain.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    /// First link was signed by a trusted root
    pub signed: bool,
    /// Key the client-data token must be signed with
    pub identity_key: VerifyingKey,
    /// `extraData` claims of the last link
    pub extra_data: Value,
}

/// Walk the chain link by link.
///
/// Every link must verify under its own `x5u`, and from the second link on
/// that `x5u` must equal the previous payload's `identityPublicKey`.
pub fn verify_chain(
    chain: &[String],
    trusted_roots: &[VerifyingKey],
    now: i64,
) -> Result<VerifiedChain, CryptoError> {
    if chain.is_empty() {
        return Err(CryptoError::EmptyChain);
    }

    let mut signed = false;
    let mut expected: Option<VerifyingKey> = None;
    let mut last_payload = Value::Null;

    for (idx, token) in chain.iter().enumerate() {
        let raw = split_token(token)?;
        let signer = header_signer(&raw.header)?;

        if let Some(prev) = expected {
            if prev != signer {
                return Err(CryptoError::BrokenChain(idx));
            }
        } else {
            signed = trusted_roots.contains(&signer);
        }

        signer
            .verify(raw.signing_input.as_bytes(), &raw.signature)
            .map_err(|_| CryptoError::BadSignature)?;
        check_validity(&raw.payload, now)?;

        let next = raw
            .payload
            .get("identityPublicKey")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MissingClaim("identityPublicKey"))?;
        expected = Some(decode_verifying_key(next)?);
        last_payload = raw.payload;
    }

    let identity_key = expected.ok_or(CryptoError::EmptyChain)?;
    let extra_data = last_payload
        .get("extraData")
        .cloned()
        .ok_or(CryptoError::MissingClaim("extraData"))?;

    Ok(VerifiedChain {
        signed,
        identity_key,
        extra_data,
    })
}

/// What the server sends and keeps after its half of the key exchange.
pub struct ServerKeyExchange {
    pub token: String,
    pub key: [u8; SESSION_KEY_LEN],
}

fn derive_session_key(salt: &[u8], shared: &[u8; 32]) -> [u8; SESSION_KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(shared);
    hasher.finalize().into()
}

/// Server half: ephemeral X25519 secret against the client's identity key.
///
/// The client's X25519 public key is the Montgomery form of its Ed25519
/// identity key.
pub fn server_key_exchange(client_identity: &VerifyingKey) -> Result<ServerKeyExchange, CryptoError> {
    let secret = StaticSecret::from(rand::random::<[u8; 32]>());
    let public = PublicKey::from(&secret);
    let salt: [u8; 16] = rand::random();

    let peer = PublicKey::from(client_identity.to_montgomery().to_bytes());
    let shared = secret.diffie_hellman(&peer);
    let key = derive_session_key(&salt, shared.as_bytes());

    let signer = generate_signing_key();
    let token = encode_token(
        &signer,
        &json!({
            "salt": STANDARD.encode(salt),
            "x25519": STANDARD.encode(public.as_bytes()),
        }),
    )?;

    Ok(ServerKeyExchange { token, key })
}

/// Client half: derive the same key from the handshake token.
pub fn client_key_exchange(
    identity: &SigningKey,
    token: &str,
    now: i64,
) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
    let signer = token_signer(token)?;
    let payload = verify_token(token, &signer, now)?;

    let salt = STANDARD.decode(
        payload
            .get("salt")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MissingClaim("salt"))?,
    )?;
    let server_pub: [u8; 32] = STANDARD
        .decode(
            payload
                .get("x25519")
                .and_then(Value::as_str)
                .ok_or(CryptoError::MissingClaim("x25519"))?,
        )?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey)?;

    let secret = StaticSecret::from(identity.to_scalar_bytes());
    let shared = secret.diffie_hellman(&PublicKey::from(server_pub));
    Ok(derive_session_key(&salt, shared.as_bytes()))
}

/// One direction of the encrypted front transport.
///
/// Nonce: direction byte, three zero bytes, little-endian frame counter.
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    direction: u8,
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: &[u8; SESSION_KEY_LEN], direction: u8) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            direction,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = self.direction;
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    pub fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptoError::FrameAuthentication)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| CryptoError::FrameAuthentication)
    }
}

/// Seal a one-off blob under a shared deployment key.
///
/// Output is `nonce || ciphertext`; used for the identity suffix the
/// backend decodes with the same key.
pub fn seal_with_shared_key(key: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce: [u8; 12] = rand::random();
    let mut out = nonce.to_vec();
    out.extend(
        cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptoError::FrameAuthentication)?,
    );
    Ok(out)
}

pub fn open_with_shared_key(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 12 {
        return Err(CryptoError::FrameAuthentication);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&sealed[..12]), &sealed[12..])
        .map_err(|_| CryptoError::FrameAuthentication)
}
