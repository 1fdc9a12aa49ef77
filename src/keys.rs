//! Signing key management — RSA key material and JWKS publication.
//!
//! Key material lives in a single backing record (fixed name, dedicated
//! namespace). Entries are keyed `<kid>.pem` for the private half (exactly
//! one — the active signer) and `<kid>.pub` for public halves. Extra public
//! entries are retained during rotation so previously issued tokens still
//! verify; rotation itself is an administrative act outside this module.
//!
//! # Security properties
//!
//! - Published JWKS never includes keys below a 2048-bit modulus; such
//!   entries are skipped with a warning, not an error.
//! - Auto-provisioning generates a 3072-bit pair and treats a concurrent
//!   "already exists" on create as success, so replica races are benign.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{ObjectStore, Record};

/// Fixed name of the signing-key record.
pub const SIGNING_KEY_RECORD: &str = "oidc-signing-keys";

const PRIVATE_SUFFIX: &str = ".pem";
const PUBLIC_SUFFIX: &str = ".pub";

/// Modulus size of auto-provisioned keys.
const GENERATED_KEY_BITS: usize = 3072;
/// Keys below this modulus are excluded from the published JWKS.
const MIN_PUBLISHED_KEY_BITS: usize = 2048;

/// JWKS document per RFC 7517.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    /// Published public keys.
    pub keys: Vec<JsonWebKey>,
}

/// A single RSA signature-verification key.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key type; always `RSA`.
    pub kty: String,
    /// Key use; always `sig`.
    #[serde(rename = "use")]
    pub public_key_use: String,
    /// Signature algorithm; always `RS256`.
    pub alg: String,
    /// Key identifier matching the JWT header `kid`.
    pub kid: String,
    /// Base64url modulus, no padding.
    pub n: String,
    /// Base64url public exponent, no padding.
    pub e: String,
}

/// Signing key manager over the backing record.
pub struct SigningKeys {
    store: Arc<dyn ObjectStore>,
    namespace: String,
}

impl SigningKeys {
    /// Create a manager reading/writing the given namespace.
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Provision the key record if it does not exist yet.
    ///
    /// Generates a fresh 3072-bit RSA pair, PEM-encodes both halves under
    /// the same kid, and persists them atomically. A concurrent create by
    /// another replica is treated as success.
    pub async fn ensure_keys(&self) -> Result<()> {
        match self.store.get(&self.namespace, SIGNING_KEY_RECORD).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let private = RsaPrivateKey::new(&mut OsRng, GENERATED_KEY_BITS)
            .map_err(|e| Error::SigningKey(format!("failed to generate RSA key: {e}")))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::SigningKey(format!("failed to encode private key: {e}")))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::SigningKey(format!("failed to encode public key: {e}")))?;

        let kid = generate_kid()?;
        let mut record = Record::new(SIGNING_KEY_RECORD);
        record.data.insert(
            format!("{kid}{PRIVATE_SUFFIX}"),
            private_pem.as_bytes().to_vec(),
        );
        record
            .data
            .insert(format!("{kid}{PUBLIC_SUFFIX}"), public_pem.into_bytes());

        match self.store.create(&self.namespace, record).await {
            Ok(()) => {
                debug!(kid, "provisioned signing key pair");
                Ok(())
            }
            // Lost the provisioning race to a peer replica.
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The active signing key and its kid.
    ///
    /// Fails if the record holds zero or more than one private entry.
    pub async fn signing_key(&self) -> Result<(EncodingKey, String)> {
        let record = self.store.get(&self.namespace, SIGNING_KEY_RECORD).await?;

        let mut private_entries = record
            .data
            .iter()
            .filter(|(key, _)| key.ends_with(PRIVATE_SUFFIX));
        let (key_name, pem) = private_entries
            .next()
            .ok_or_else(|| Error::SigningKey("no private key in signing key record".into()))?;
        if private_entries.next().is_some() {
            return Err(Error::SigningKey(
                "multiple private keys in signing key record".into(),
            ));
        }

        let encoding_key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::SigningKey(format!("malformed private key: {e}")))?;
        let kid = key_name.trim_end_matches(PRIVATE_SUFFIX).to_string();
        Ok((encoding_key, kid))
    }

    /// Exact-match public key lookup by kid.
    pub async fn public_key(&self, kid: &str) -> Result<DecodingKey> {
        let record = self.store.get(&self.namespace, SIGNING_KEY_RECORD).await?;
        let pem = record
            .data
            .get(&format!("{kid}{PUBLIC_SUFFIX}"))
            .ok_or_else(|| Error::SigningKey(format!("public key not found for kid {kid}")))?;

        DecodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::SigningKey(format!("malformed public key for kid {kid}: {e}")))
    }

    /// Render the published JWKS.
    ///
    /// Iterates all public entries, skipping (with a warning) keys that do
    /// not parse or whose modulus is below 2048 bits. An empty key set is
    /// valid output.
    pub async fn jwks(&self) -> Result<JsonWebKeySet> {
        let record = self.store.get(&self.namespace, SIGNING_KEY_RECORD).await?;

        let mut keys = Vec::new();
        for (key_name, pem) in &record.data {
            let Some(kid) = key_name.strip_suffix(PUBLIC_SUFFIX) else {
                continue;
            };

            let pem = match std::str::from_utf8(pem) {
                Ok(pem) => pem,
                Err(_) => {
                    warn!(kid, "skipping non-UTF-8 public key entry");
                    continue;
                }
            };
            let public = match RsaPublicKey::from_public_key_pem(pem) {
                Ok(public) => public,
                Err(e) => {
                    warn!(kid, error = %e, "skipping unparseable public key");
                    continue;
                }
            };

            let bits = public.size() * 8;
            if bits < MIN_PUBLISHED_KEY_BITS {
                warn!(kid, bits, "skipping public key below 2048-bit modulus");
                continue;
            }

            keys.push(JsonWebKey {
                kty: "RSA".to_string(),
                public_key_use: "sig".to_string(),
                alg: "RS256".to_string(),
                kid: kid.to_string(),
                n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
            });
        }

        Ok(JsonWebKeySet { keys })
    }
}

/// Generate a random key identifier.
fn generate_kid() -> Result<String> {
    let mut bytes = [0u8; 8];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}
