// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Account-signed link tokens.
//!
//! App and path links can carry a short-lived JWT signed with the account
//! private key (ES384, the curve the transport keypair uses), so a link can
//! be opened without a separate console login.

use std::time::Duration;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, SdkError};

/// Options for minting one link token.
#[derive(Debug, Clone)]
pub struct JwtOpts {
    /// Emit the bare link without a token.
    pub no_jwt: bool,
    /// Token validity; zero falls back to 24 h.
    pub valid_for: Duration,
    /// Subject claim; empty falls back to "jwt-user".
    pub user_id: String,
    /// Role claim; empty falls back to "user".
    pub role: String,
}

impl Default for JwtOpts {
    fn default() -> Self {
        Self {
            no_jwt: false,
            valid_for: Duration::from_secs(24 * 60 * 60),
            user_id: "jwt-user".to_string(),
            role: "user".to_string(),
        }
    }
}

impl JwtOpts {
    pub fn validate(&self) -> Result<()> {
        if self.valid_for > Duration::from_secs(30 * 24 * 60 * 60) {
            return Err(SdkError::Validate(
                "link token validity cannot exceed 30 days".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LinkClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Mint an account-signed link token from a PEM EC private key.
pub(crate) fn make_jwt_with_key(key_pem: &[u8], acc_id: &str, opts: &JwtOpts) -> Result<String> {
    opts.validate()?;
    let key = EncodingKey::from_ec_pem(key_pem)
        .map_err(|e| SdkError::Config(format!("cannot load account key for jwt: {}", e)))?;
    let valid_for = if opts.valid_for.is_zero() {
        Duration::from_secs(24 * 60 * 60)
    } else {
        opts.valid_for
    };
    let now = chrono::Utc::now().timestamp();
    let claims = LinkClaims {
        iss: "panelhost".to_string(),
        sub: if opts.user_id.is_empty() {
            "jwt-user".to_string()
        } else {
            opts.user_id.clone()
        },
        aud: acc_id.to_string(),
        role: if opts.role.is_empty() {
            "user".to_string()
        } else {
            opts.role.clone()
        },
        iat: now - 5,
        exp: now + valid_for.as_secs() as i64,
        jti: uuid::Uuid::new_v4().to_string(),
    };
    encode(&Header::new(Algorithm::ES384), &claims, &key)
        .map_err(|e| SdkError::Config(format!("cannot sign link token: {}", e)))
}

/// Mint a link token using the configured account key file.
pub fn make_account_jwt(config: &Config, opts: &JwtOpts) -> Result<String> {
    let key_pem = std::fs::read(&config.key_file_name).map_err(|e| {
        SdkError::Config(format!(
            "cannot read key file {}: {}",
            config.key_file_name, e
        ))
    })?;
    make_jwt_with_key(&key_pem, &config.acc_id, opts)
}
