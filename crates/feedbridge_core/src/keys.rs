/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::feed_db::FeedDb;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePublicKey, LineEnding},
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

const RSA_BITS: usize = 2048;

/// One JWK key pair as stored and as handed to the protocol runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: Value,
    pub private_key: Value,
}

/// Returns the bot's key pairs, generating and persisting them on first use.
///
/// The stored set is append-only: a legacy single-pair record keeps its RSA
/// pair as the first element and gains an Ed25519 pair; a full set is
/// returned untouched. Ordering is load-bearing (first pair is the
/// legacy-compatible RSA one).
pub fn get_key_pairs(db: &FeedDb, bot_username: &str) -> Result<Vec<KeyPair>> {
    let existing = match db.load_keypairs(bot_username)? {
        Some(raw) => read_key_pairs(&raw)?,
        None => Vec::new(),
    };
    if existing.len() >= 2 {
        return Ok(existing);
    }

    let had_legacy = !existing.is_empty();
    let rsa_pair = match existing.into_iter().next() {
        Some(pair) => pair,
        None => generate_rsa_pair()?,
    };
    let ed25519_pair = generate_ed25519_pair();
    let pairs = vec![rsa_pair, ed25519_pair];
    let raw = serde_json::to_string(&pairs).context("encode key pairs")?;
    db.store_keypairs(bot_username, &raw)?;
    info!(
        bot = bot_username,
        upgraded_legacy = had_legacy,
        "generated key pairs"
    );
    Ok(pairs)
}

/// Normalizes the storage representation: either a bare `{publicKey,
/// privateKey}` object (legacy single-key record) or an array of them.
fn read_key_pairs(raw: &str) -> Result<Vec<KeyPair>> {
    let value: Value = serde_json::from_str(raw).context("parse stored key pairs")?;
    match value {
        Value::Array(_) => serde_json::from_value(value).context("decode key pair list"),
        Value::Object(_) => {
            let single: KeyPair =
                serde_json::from_value(value).context("decode legacy key pair")?;
            Ok(vec![single])
        }
        _ => bail!("unexpected key pair storage shape"),
    }
}

/// SPKI PEM of the first RSA public key, for the actor document.
pub fn rsa_public_key_pem(pairs: &[KeyPair]) -> Result<String> {
    let jwk = pairs
        .iter()
        .map(|p| &p.public_key)
        .find(|k| k.get("kty").and_then(Value::as_str) == Some("RSA"))
        .context("no RSA key pair available")?;
    let n = decode_field(jwk, "n")?;
    let e = decode_field(jwk, "e")?;
    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .context("rebuild RSA public key from JWK")?;
    key.to_public_key_pem(LineEnding::LF)
        .context("encode RSA public key pem")
}

fn decode_field(jwk: &Value, field: &str) -> Result<Vec<u8>> {
    let raw = jwk
        .get(field)
        .and_then(Value::as_str)
        .with_context(|| format!("jwk missing {field:?}"))?;
    B64URL
        .decode(raw)
        .with_context(|| format!("jwk field {field:?} is not base64url"))
}

fn generate_rsa_pair() -> Result<KeyPair> {
    let mut rng = OsRng;
    let key = RsaPrivateKey::new(&mut rng, RSA_BITS).context("generate RSA key")?;
    let n = B64URL.encode(key.n().to_bytes_be());
    let e = B64URL.encode(key.e().to_bytes_be());
    let d = B64URL.encode(key.d().to_bytes_be());
    let primes = key.primes();
    let p = B64URL.encode(primes[0].to_bytes_be());
    let q = B64URL.encode(primes[1].to_bytes_be());
    Ok(KeyPair {
        public_key: json!({ "kty": "RSA", "n": n, "e": e }),
        private_key: json!({ "kty": "RSA", "n": n, "e": e, "d": d, "p": p, "q": q }),
    })
}

fn generate_ed25519_pair() -> KeyPair {
    let mut rng = OsRng;
    let key = SigningKey::generate(&mut rng);
    let x = B64URL.encode(key.verifying_key().to_bytes());
    let d = B64URL.encode(key.to_bytes());
    KeyPair {
        public_key: json!({ "kty": "OKP", "crv": "Ed25519", "x": x }),
        private_key: json!({ "kty": "OKP", "crv": "Ed25519", "x": x, "d": d }),
    }
}
