// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Client configuration.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SdkError};
use crate::jwt::JwtOpts;

/// Client version string sent as ambient metadata on every call.
pub const CLIENT_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

pub(crate) const CONSOLE_HOST_PROD: &str = "console.panelhost.io";
pub(crate) const CONSOLE_HOST_DEV: &str = "console.panelhost-dev.io:8080";

const DEFAULT_KEY_FILE: &str = "panelhost-client.key";
const DEFAULT_CERT_FILE: &str = "panelhost-client.crt";

/// Client configuration.
///
/// Unset fields are resolved from `PANELHOST_*` environment variables and
/// then from defaults when the client starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Account identifier; must match the TLS certificate CN when supplied.
    pub acc_id: String,
    /// Permit anonymous provisioning.
    pub anon_acc: bool,
    /// Logical namespace, defaults to "default".
    pub zone_name: String,
    /// Process name published on connect (defaults to the executable name).
    pub proc_name: String,
    /// Process tags published on connect.
    pub proc_tags: HashMap<String, String>,
    /// TLS private key path.
    pub key_file_name: String,
    /// TLS certificate path; CN must match `acc_id`.
    pub cert_file_name: String,
    /// Mint self-signed material on first run (anonymous accounts only).
    pub auto_keygen: bool,
    /// Drain deadline for `wait_for_clear`, default 1 s.
    pub min_clear_timeout: Duration,
    /// Enable diagnostic logging.
    pub verbose: bool,
    /// "prod" or "dev"; selects the console hostnames.
    pub env: String,
    /// Override the RPC target host (skips the bootstrap lookup).
    pub server_host: String,
    /// Override the RPC target port.
    pub server_port: u16,
    /// External shutdown signal; cancelling it closes the client.
    pub shutdown: Option<CancellationToken>,
    /// Default validity for minted link tokens.
    pub jwt_duration: Duration,
    /// Default user id claim for minted link tokens.
    pub jwt_user_id: String,
    /// Default role claim for minted link tokens.
    pub jwt_role: String,
    /// Suppress JWT tokens in logged app links.
    pub no_show_jwt: bool,
    /// Disable the synthetic NoAuth action on root handler requests.
    pub no_default_auth: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acc_id: String::new(),
            anon_acc: false,
            zone_name: String::new(),
            proc_name: String::new(),
            proc_tags: HashMap::new(),
            key_file_name: String::new(),
            cert_file_name: String::new(),
            auto_keygen: false,
            min_clear_timeout: Duration::from_secs(1),
            verbose: false,
            env: String::new(),
            server_host: String::new(),
            server_port: 0,
            shutdown: None,
            jwt_duration: Duration::from_secs(24 * 60 * 60),
            jwt_user_id: "jwt-user".to_string(),
            jwt_role: "user".to_string(),
            no_show_jwt: false,
            no_default_auth: false,
        }
    }
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill unset fields from environment variables and defaults. Called by
    /// the client on start; idempotent.
    pub fn setup_defaults(&mut self) -> Result<()> {
        if self.acc_id.is_empty() {
            self.acc_id = env::var("PANELHOST_ACC_ID").unwrap_or_default();
        }
        if self.zone_name.is_empty() {
            self.zone_name = env::var("PANELHOST_ZONE").unwrap_or_else(|_| "default".to_string());
        }
        if !crate::paths::is_path_frag_valid(&self.zone_name) {
            return Err(SdkError::Config(format!(
                "invalid zone name '{}'",
                self.zone_name
            )));
        }
        if self.proc_name.is_empty() {
            self.proc_name = env::var("PANELHOST_PROC_NAME").unwrap_or_default();
        }
        if self.proc_name.is_empty() {
            self.proc_name = env::current_exe()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "unknown".to_string());
        }
        if self.key_file_name.is_empty() {
            self.key_file_name =
                env::var("PANELHOST_KEY_FILE").unwrap_or_else(|_| DEFAULT_KEY_FILE.to_string());
        }
        if self.cert_file_name.is_empty() {
            self.cert_file_name =
                env::var("PANELHOST_CERT_FILE").unwrap_or_else(|_| DEFAULT_CERT_FILE.to_string());
        }
        if self.env.is_empty() {
            self.env = env::var("PANELHOST_ENV").unwrap_or_else(|_| "prod".to_string());
        }
        if !self.verbose {
            self.verbose = env_bool("PANELHOST_VERBOSE");
        }
        if self.server_host.is_empty() {
            self.server_host = env::var("PANELHOST_SERVER_HOST").unwrap_or_default();
        }
        if self.server_port == 0 {
            self.server_port = env::var("PANELHOST_SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
        if self.min_clear_timeout.is_zero() {
            self.min_clear_timeout = Duration::from_secs(1);
        }
        Ok(())
    }

    /// Console host for the bootstrap lookup and account links.
    pub fn console_host(&self) -> &'static str {
        if self.env == "prod" {
            CONSOLE_HOST_PROD
        } else {
            CONSOLE_HOST_DEV
        }
    }

    /// Default link-token options derived from this configuration.
    pub fn jwt_opts(&self) -> JwtOpts {
        JwtOpts {
            no_jwt: self.no_show_jwt,
            valid_for: self.jwt_duration,
            user_id: self.jwt_user_id.clone(),
            role: self.jwt_role.clone(),
        }
    }

    // builder-style setters

    pub fn with_acc_id(mut self, acc_id: impl Into<String>) -> Self {
        self.acc_id = acc_id.into();
        self
    }

    pub fn with_anon_acc(mut self, anon: bool) -> Self {
        self.anon_acc = anon;
        self
    }

    pub fn with_zone_name(mut self, zone: impl Into<String>) -> Self {
        self.zone_name = zone.into();
        self
    }

    pub fn with_proc_name(mut self, name: impl Into<String>) -> Self {
        self.proc_name = name.into();
        self
    }

    pub fn with_proc_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.proc_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_keypair(
        mut self,
        key_file: impl Into<String>,
        cert_file: impl Into<String>,
    ) -> Self {
        self.key_file_name = key_file.into();
        self.cert_file_name = cert_file.into();
        self
    }

    pub fn with_auto_keygen(mut self, auto: bool) -> Self {
        self.auto_keygen = auto;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn with_min_clear_timeout(mut self, timeout: Duration) -> Self {
        self.min_clear_timeout = timeout;
        self
    }

    pub fn with_no_default_auth(mut self, disable: bool) -> Self {
        self.no_default_auth = disable;
        self
    }
}
