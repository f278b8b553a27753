// SPDX-License-Identifier: MIT OR Apache-2.0

//! SASL client mechanisms for session negotiation.
//!
//! Mechanism choice: a user-forced mechanism is honoured when the server
//! advertises it; otherwise the strongest supported SCRAM variant wins.
//! On a plaintext transport the client refuses to volunteer PLAIN — the
//! user must force it explicitly — so a server advertising only PLAIN
//! fails negotiation with `SaslMechUnavailable` before any credentials are
//! sent.

use base64::prelude::*;
use rand::RngExt;
use sha2::digest::Digest;
use sha2::{Sha256, Sha512};

use crate::error::{CouchError, Result};

/// Mechanisms this client can drive, strongest first.
const PREFERENCE: [&str; 2] = ["SCRAM-SHA512", "SCRAM-SHA256"];

/// Pick a mechanism from the server's advertised list.
pub fn choose_mechanism(
    advertised: &[&str],
    forced: Option<&str>,
    is_tls: bool,
) -> Result<String> {
    if let Some(forced) = forced {
        if advertised.iter().any(|m| m.eq_ignore_ascii_case(forced)) {
            return Ok(forced.to_ascii_uppercase());
        }
        return Err(CouchError::SaslMechUnavailable(format!(
            "forced mechanism {forced} not advertised"
        )));
    }
    for pref in PREFERENCE {
        if advertised.iter().any(|m| m.eq_ignore_ascii_case(pref)) {
            return Ok(pref.to_string());
        }
    }
    if advertised.iter().any(|m| m.eq_ignore_ascii_case("PLAIN")) {
        if is_tls {
            return Ok("PLAIN".to_string());
        }
        return Err(CouchError::SaslMechUnavailable(
            "refusing PLAIN downgrade on a plaintext transport".into(),
        ));
    }
    Err(CouchError::SaslMechUnavailable(format!(
        "no common mechanism in {advertised:?}"
    )))
}

// HMAC and PBKDF2 over the sha2 primitives; block sizes per FIPS 180-4.

fn hmac<D: Digest>(block_len: usize, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key_block = vec![0u8; block_len];
    if key.len() > block_len {
        let digest = D::new().chain_update(key).finalize();
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();

    let inner = D::new().chain_update(&ipad).chain_update(data).finalize();
    D::new()
        .chain_update(&opad)
        .chain_update(&inner)
        .finalize()
        .to_vec()
}

fn pbkdf2<D: Digest>(block_len: usize, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block_input = salt.to_vec();
    block_input.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac::<D>(block_len, password, &block_input);
    let mut out = u.clone();
    for _ in 1..iterations {
        u = hmac::<D>(block_len, password, &u);
        for (o, b) in out.iter_mut().zip(&u) {
            *o ^= b;
        }
    }
    out
}

/// Which SCRAM hash is in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramHash {
    Sha256,
    Sha512,
}

impl ScramHash {
    fn block_len(self) -> usize {
        match self {
            ScramHash::Sha256 => 64,
            ScramHash::Sha512 => 128,
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => hmac::<Sha256>(self.block_len(), key, data),
            ScramHash::Sha512 => hmac::<Sha512>(self.block_len(), key, data),
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn pbkdf2(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => pbkdf2::<Sha256>(self.block_len(), password, salt, iterations),
            ScramHash::Sha512 => pbkdf2::<Sha512>(self.block_len(), password, salt, iterations),
        }
    }
}

/// Running SASL exchange.
#[derive(Debug)]
pub enum SaslClient {
    Plain {
        username: String,
        password: String,
    },
    Scram(ScramState),
}

#[derive(Debug)]
pub struct ScramState {
    hash: ScramHash,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// Set after the server-first message; used to check server-final.
    server_signature: Option<Vec<u8>>,
}

impl SaslClient {
    pub fn new(mechanism: &str, username: &str, password: &str) -> Result<Self> {
        match mechanism {
            "PLAIN" => Ok(SaslClient::Plain {
                username: username.to_string(),
                password: password.to_string(),
            }),
            "SCRAM-SHA256" | "SCRAM-SHA512" => {
                let hash = if mechanism == "SCRAM-SHA256" {
                    ScramHash::Sha256
                } else {
                    ScramHash::Sha512
                };
                let nonce: String = {
                    let mut rng = rand::rng();
                    (0..24)
                        .map(|_| {
                            let c = rng.random_range(0x21u8..0x7f);
                            // '+' and ',' are structural in SCRAM messages.
                            if c == b',' || c == b'+' {
                                b'.' as char
                            } else {
                                c as char
                            }
                        })
                        .collect()
                };
                Ok(SaslClient::Scram(ScramState {
                    hash,
                    username: username.to_string(),
                    password: password.to_string(),
                    client_first_bare: format!("n={username},r={nonce}"),
                    client_nonce: nonce,
                    server_signature: None,
                }))
            }
            other => Err(CouchError::SaslMechUnavailable(format!(
                "unsupported mechanism {other}"
            ))),
        }
    }

    /// Payload for SASL_AUTH.
    #[must_use]
    pub fn initial_response(&self) -> Vec<u8> {
        match self {
            SaslClient::Plain { username, password } => {
                let mut out = Vec::with_capacity(username.len() + password.len() + 2);
                out.push(0);
                out.extend_from_slice(username.as_bytes());
                out.push(0);
                out.extend_from_slice(password.as_bytes());
                out
            }
            SaslClient::Scram(state) => format!("n,,{}", state.client_first_bare).into_bytes(),
        }
    }

    /// Continue after AUTH_CONTINUE. Returns the SASL_STEP payload.
    pub fn step(&mut self, server_data: &[u8]) -> Result<Vec<u8>> {
        match self {
            SaslClient::Plain { .. } => Err(CouchError::Protocol(
                "unexpected SASL continue for PLAIN".into(),
            )),
            SaslClient::Scram(state) => state.client_final(server_data),
        }
    }

    /// Verify the server-final message (SCRAM only; PLAIN has none).
    pub fn verify_server_final(&self, server_data: &[u8]) -> Result<()> {
        match self {
            SaslClient::Plain { .. } => Ok(()),
            SaslClient::Scram(state) => state.verify_final(server_data),
        }
    }
}

fn scram_field<'a>(message: &'a str, prefix: &str) -> Result<&'a str> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(prefix))
        .ok_or_else(|| CouchError::Protocol(format!("SCRAM message missing {prefix:?} field")))
}

impl ScramState {
    fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| CouchError::Protocol("SCRAM server-first not UTF-8".into()))?;

        let nonce = scram_field(server_first, "r=")?;
        if !nonce.starts_with(&self.client_nonce) {
            return Err(CouchError::Protocol(
                "SCRAM server nonce does not extend client nonce".into(),
            ));
        }
        let salt = BASE64_STANDARD
            .decode(scram_field(server_first, "s=")?)
            .map_err(|_| CouchError::Protocol("SCRAM salt not base64".into()))?;
        let iterations: u32 = scram_field(server_first, "i=")?
            .parse()
            .map_err(|_| CouchError::Protocol("SCRAM iteration count invalid".into()))?;

        let salted = self.hash.pbkdf2(self.password.as_bytes(), &salt, iterations);
        let client_key = self.hash.hmac(&salted, b"Client Key");
        let stored_key = self.hash.digest(&client_key);

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = self.hash.hmac(&salted, b"Server Key");
        self.server_signature = Some(self.hash.hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", BASE64_STANDARD.encode(proof)).into_bytes())
    }

    fn verify_final(&self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| CouchError::Protocol("SCRAM server-final not UTF-8".into()))?;
        let verifier = BASE64_STANDARD
            .decode(scram_field(server_final, "v=")?)
            .map_err(|_| CouchError::Protocol("SCRAM verifier not base64".into()))?;
        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| CouchError::Protocol("SCRAM verifier before client-final".into()))?;
        if &verifier != expected {
            return Err(CouchError::AuthFailed(
                "SCRAM server signature mismatch".into(),
            ));
        }
        Ok(())
    }
}
