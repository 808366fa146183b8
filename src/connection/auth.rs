//! Authentication strategies
//!
//! The peripheral's authentication scheme is unknown, so the manager tries a
//! fixed chain of strategies and stops at the first one that succeeds. A
//! failing chain is not fatal: the session proceeds unauthenticated.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::oplog::OperationalLog;
use crate::protocol::command::{encode_auth_key, encode_auth_response};
use crate::protocol::constants::{AUTH_DIGEST_LEN, AUTH_STATUS_OK};
use crate::radio::RadioLink;

/// What a strategy needs to talk to the peripheral
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Shared key bytes (may be empty)
    pub key: Vec<u8>,
    /// Characteristic used for auth reads and writes
    pub characteristic: Option<Uuid>,
}

impl AuthContext {
    fn characteristic(&self) -> Result<Uuid> {
        self.characteristic
            .ok_or_else(|| EngineError::Authentication("no writable characteristic".to_string()))
    }
}

/// Parse a configured key: hex when it decodes as hex, raw UTF-8 otherwise
pub fn parse_auth_key(raw: &str) -> Vec<u8> {
    let trimmed = raw.trim();
    match hex::decode(trimmed) {
        Ok(bytes) if !trimmed.is_empty() => bytes,
        _ => trimmed.as_bytes().to_vec(),
    }
}

/// First [`AUTH_DIGEST_LEN`] bytes of SHA-256(challenge ‖ key)
pub fn challenge_digest(challenge: &[u8], key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(key);
    hasher.finalize()[..AUTH_DIGEST_LEN].to_vec()
}

/// One way of authenticating against the peripheral
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, link: &mut dyn RadioLink, ctx: &AuthContext) -> Result<()>;
}

/// Write the shared key as a command frame
#[derive(Debug, Default)]
pub struct KeyWriteAuth;

#[async_trait]
impl AuthStrategy for KeyWriteAuth {
    fn name(&self) -> &'static str {
        "key-write"
    }

    async fn authenticate(&self, link: &mut dyn RadioLink, ctx: &AuthContext) -> Result<()> {
        if ctx.key.is_empty() {
            return Err(EngineError::Authentication("no auth key configured".to_string()));
        }
        let frame = encode_auth_key(&ctx.key)?;
        link.write(ctx.characteristic()?, &frame)
            .await
            .map_err(|e| EngineError::Authentication(format!("key write failed: {}", e)))
    }
}

/// Read a challenge, answer with a keyed digest, check the status byte
#[derive(Debug, Default)]
pub struct ChallengeResponseAuth;

#[async_trait]
impl AuthStrategy for ChallengeResponseAuth {
    fn name(&self) -> &'static str {
        "challenge-response"
    }

    async fn authenticate(&self, link: &mut dyn RadioLink, ctx: &AuthContext) -> Result<()> {
        let characteristic = ctx.characteristic()?;

        let challenge = link
            .read(characteristic)
            .await
            .map_err(|e| EngineError::Authentication(format!("challenge read failed: {}", e)))?;
        if challenge.is_empty() {
            return Err(EngineError::Authentication("peripheral sent no challenge".to_string()));
        }

        let response = encode_auth_response(&challenge_digest(&challenge, &ctx.key))?;
        link.write(characteristic, &response)
            .await
            .map_err(|e| EngineError::Authentication(format!("response write failed: {}", e)))?;

        let status = link
            .read(characteristic)
            .await
            .map_err(|e| EngineError::Authentication(format!("status read failed: {}", e)))?;
        match status.first() {
            Some(&AUTH_STATUS_OK) => Ok(()),
            other => Err(EngineError::Authentication(format!(
                "challenge response rejected (status {:02X?})",
                other
            ))),
        }
    }
}

/// Platform bonding handshake
#[derive(Debug, Default)]
pub struct BondingAuth;

#[async_trait]
impl AuthStrategy for BondingAuth {
    fn name(&self) -> &'static str {
        "bonding"
    }

    async fn authenticate(&self, link: &mut dyn RadioLink, _ctx: &AuthContext) -> Result<()> {
        link.bond()
            .await
            .map_err(|e| EngineError::Authentication(format!("bonding failed: {}", e)))
    }
}

/// Key write, then challenge-response, then bonding
pub fn default_chain() -> Vec<Box<dyn AuthStrategy>> {
    vec![
        Box::new(KeyWriteAuth),
        Box::new(ChallengeResponseAuth),
        Box::new(BondingAuth),
    ]
}

/// Try each strategy in order
///
/// Returns the name of the first strategy that succeeded, or `None` when the
/// chain is exhausted. Each failure is logged as an authentication error.
pub async fn run_chain(
    chain: &[Box<dyn AuthStrategy>],
    link: &mut dyn RadioLink,
    ctx: &AuthContext,
    attempt_timeout: Duration,
    log: &OperationalLog,
) -> Option<&'static str> {
    for strategy in chain {
        log.debug(format!("Trying {} authentication", strategy.name()));

        let outcome = match tokio::time::timeout(attempt_timeout, strategy.authenticate(link, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Authentication(format!(
                "timed out after {} ms",
                attempt_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(()) => {
                log.info(format!("Authenticated with {}", strategy.name()));
                return Some(strategy.name());
            }
            Err(e) => {
                let e = match e {
                    EngineError::Authentication(_) => e,
                    other => EngineError::Authentication(other.to_string()),
                };
                log.warn(format!("{} ({})", e, strategy.name()));
            }
        }
    }

    log.warn(format!(
        "All {} authentication strategies failed; monitoring unauthenticated",
        chain.len()
    ));
    None
}
