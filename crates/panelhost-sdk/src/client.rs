// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! The cloud client: connection identity negotiation, the reconnecting
//! request-stream loop, and the RPC surface used by apps and the filesystem
//! client.
//!
//! One `CloudClient` owns one transport. The connection identity (`conn_id`)
//! is negotiated by `ConnectClient`, cleared on any disconnect or
//! `badconnid` status, and carried on every outbound call. While it is
//! empty, no RPC other than `ConnectClient` is attempted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use panelhost_protocol::wire::{
    rpc_request, rpc_response, AccInfo, BackendPushMessage, CallDataHandlerMessage,
    ConnectClientMessage, FileInfoMessage, OpenAppMessage, ReflectZoneMessage, RemoveAppMessage,
    RemovePathMessage, RequestMessage, RequestStreamMessage, RpcRequest, RtnStatus,
    SendResponseMessage, SetBlobMessage, SetPathMessage, StartStreamMessage, WriteAppMessage,
};
use panelhost_protocol::{ChannelState, ClientError, ConsoleClient, ConsoleClientConfig};

use crate::app::{App, AppConfig, BlobData};
use crate::backoff::ExpoWait;
use crate::config::{Config, CLIENT_VERSION};
use crate::dispatch::dispatch_request;
use crate::error::{ErrCode, Result, SdkError};
use crate::fs::FsClient;
use crate::jwt::{make_account_jwt, JwtOpts};
use crate::keygen;
use crate::paths;
use crate::request::{now_ms, start_stream_request, AppRequest, ResponseSender, StreamOpts};
use crate::runtime::RuntimeRef;

const MB: f64 = 1_000_000.0;
const BOOTSTRAP_PATH: &str = "/grpc-server";
/// A stream that survived this long resets the reconnect backoff.
const HEALTHY_STREAM_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct BootstrapData {
    grpcserver: String,
    grpcport: u16,
}

#[derive(Debug, Deserialize)]
struct BootstrapRtn {
    success: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Option<BootstrapData>,
}

/// Zone reflection: the console's view of this account's zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectZone {
    #[serde(rename = "accid", default)]
    pub acc_id: String,
    #[serde(rename = "zonename", default)]
    pub zone_name: String,
    #[serde(default)]
    pub apps: HashMap<String, ReflectApp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReflectApp {
    #[serde(rename = "appname", default)]
    pub app_name: String,
    #[serde(rename = "proclinks", default)]
    pub proc_links: Vec<String>,
}

struct ClientState {
    acc_info: Option<AccInfo>,
    /// App name -> runtime, for inbound app requests.
    app_runtimes: HashMap<String, RuntimeRef>,
    /// Filesystem path -> runtime, for inbound `path` requests.
    link_runtimes: HashMap<String, RuntimeRef>,
    exit_err: Option<SdkError>,
    perm_err: bool,
}

/// Client for the console service. Create with [`CloudClient::start`]; one
/// instance per process is the normal arrangement (see [`crate::global`]),
/// but nothing requires it.
pub struct CloudClient {
    config: Config,
    proc_run_id: String,
    start_ts: i64,
    transport: ConsoleClient,
    conn_id: RwLock<String>,
    state: Mutex<ClientState>,
    done: tokio_util::sync::CancellationToken,
    inflight: AtomicI64,
    /// Back-reference for handing out owning handles (dispatch tasks, the
    /// filesystem client). Set by `Arc::new_cyclic` in `build`.
    weak_self: std::sync::Weak<CloudClient>,
}

/// Local enforcement of the account blob size limit; the upload RPC is not
/// attempted for oversize payloads.
pub(crate) fn check_blob_limit(acc_info: Option<&AccInfo>, size: usize) -> Result<()> {
    if let Some(info) = acc_info {
        if info.blob_size_limit_mb > 0.0 && size as f64 > info.blob_size_limit_mb * MB {
            return Err(SdkError::limit(
                "cannot upload blob",
                "BlobSizeLimitMB",
                info.blob_size_limit_mb,
            ));
        }
    }
    Ok(())
}

fn host_data() -> HashMap<String, String> {
    let mut data = HashMap::new();
    data.insert(
        "HostName".to_string(),
        std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
    );
    data.insert("Pid".to_string(), std::process::id().to_string());
    data
}

impl CloudClient {
    /// Resolve configuration, bring up the transport, negotiate a connection
    /// identity, and spawn the reconnect loop.
    pub async fn start(mut config: Config) -> Result<Arc<CloudClient>> {
        config.setup_defaults()?;
        keygen::ensure_keypair(&mut config)?;

        if config.server_host.is_empty() {
            let (host, port) = Self::lookup_console_endpoint(&config).await?;
            info!(host = %host, port = port, "using console endpoint from bootstrap lookup");
            config.server_host = host;
            config.server_port = port;
        }

        let client = Self::build(config)?;

        if let Some(shutdown) = client.config.shutdown.clone() {
            let external = client.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                external.external_shutdown().await;
            });
        }

        if let Err(e) = client.transport.connect().await {
            debug!(error = %e, "initial dial failed, reconnect loop will retry");
        }

        info!(
            acc_id = %client.config.acc_id,
            zone = %client.config.zone_name,
            proc_name = %client.config.proc_name,
            proc_run_id = %client.proc_run_id,
            "cloud client initialized"
        );

        match client.send_connect_client(false).await {
            Ok(()) => {}
            Err(e) if e.can_retry() => {
                warn!(error = %e, "connect failed, will retry");
            }
            Err(e) => {
                client.set_exit_err(e.clone());
                return Err(e);
            }
        }

        let looper = client.clone();
        tokio::spawn(async move {
            looper.run_request_stream_loop().await;
        });

        Ok(client)
    }

    fn build(config: Config) -> Result<Arc<CloudClient>> {
        let cert_pem = std::fs::read(&config.cert_file_name).map_err(|e| {
            SdkError::Config(format!(
                "cannot load certificate {}: {}",
                config.cert_file_name, e
            ))
        })?;
        let key_pem = std::fs::read(&config.key_file_name).map_err(|e| {
            SdkError::Config(format!("cannot load key {}: {}", config.key_file_name, e))
        })?;

        let transport_config = ConsoleClientConfig {
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            cert_pem,
            key_pem,
            ..Default::default()
        };
        let transport = ConsoleClient::new(transport_config)
            .map_err(|e| SdkError::Config(format!("cannot create transport: {}", e)))?;

        Ok(Arc::new_cyclic(|weak| CloudClient {
            config,
            proc_run_id: uuid::Uuid::new_v4().to_string(),
            start_ts: now_ms(),
            transport,
            conn_id: RwLock::new(String::new()),
            state: Mutex::new(ClientState {
                acc_info: None,
                app_runtimes: HashMap::new(),
                link_runtimes: HashMap::new(),
                exit_err: None,
                perm_err: false,
            }),
            done: tokio_util::sync::CancellationToken::new(),
            inflight: AtomicI64::new(0),
            weak_self: weak.clone(),
        }))
    }

    fn arc(&self) -> Arc<CloudClient> {
        self.weak_self
            .upgrade()
            .expect("client is only constructed behind an Arc")
    }

    async fn lookup_console_endpoint(config: &Config) -> Result<(String, u16)> {
        let url = format!(
            "https://{}{}?accid={}",
            config.console_host(),
            BOOTSTRAP_PATH,
            config.acc_id
        );
        let resp = reqwest::get(&url)
            .await
            .map_err(|e| SdkError::Config(format!("cannot look up console endpoint: {}", e)))?;
        let rtn: BootstrapRtn = resp.json().await.map_err(|e| {
            SdkError::Config(format!(
                "cannot look up console endpoint (decoding response): {}",
                e
            ))
        })?;
        if !rtn.success {
            return Err(SdkError::Config(format!(
                "cannot look up console endpoint (error response): {}",
                rtn.error
            )));
        }
        match rtn.data {
            Some(data) if !data.grpcserver.is_empty() && data.grpcport != 0 => {
                Ok((data.grpcserver, data.grpcport))
            }
            _ => Err(SdkError::Config(
                "cannot look up console endpoint (bad response)".to_string(),
            )),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn proc_run_id(&self) -> &str {
        &self.proc_run_id
    }

    fn conn_id(&self) -> String {
        self.conn_id.read().unwrap().clone()
    }

    fn conn_id_is_empty(&self) -> bool {
        self.conn_id.read().unwrap().is_empty()
    }

    fn clear_conn_id(&self) {
        self.conn_id.write().unwrap().clear();
    }

    fn set_exit_err(&self, err: SdkError) {
        let mut state = self.state.lock().unwrap();
        if state.exit_err.is_none() {
            state.exit_err = Some(err);
        }
    }

    /// The reason for shutdown, `None` while the client is running.
    pub fn exit_err(&self) -> Option<SdkError> {
        self.state.lock().unwrap().exit_err.clone()
    }

    /// Account info from the last successful connect.
    pub fn acc_info(&self) -> Option<AccInfo> {
        self.state.lock().unwrap().acc_info.clone()
    }

    pub fn is_connected(&self) -> bool {
        {
            let state = self.state.lock().unwrap();
            if state.exit_err.is_some() {
                return false;
            }
        }
        !self.conn_id_is_empty()
    }

    /// Close the transport and latch the shutdown exit error. The reconnect
    /// loop observes the shutdown state and closes the done channel.
    pub async fn external_shutdown(&self) {
        self.set_exit_err(SdkError::Shutdown);
        self.transport.close().await;
        // in case the loop never started
        self.done.cancel();
    }

    /// Block until the client shuts down; returns the exit error.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        self.done.cancelled().await;
        match self.exit_err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Give in-flight handlers a window to finish before shutdown.
    pub async fn wait_for_clear(&self) {
        let deadline = Instant::now() + self.config.min_clear_timeout;
        loop {
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // -- identity negotiation --

    fn reconnect_app_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.app_runtimes.keys().cloned().collect();
        names.sort();
        names
    }

    #[tracing::instrument(skip_all, fields(acc_id = %self.config.acc_id, is_reconnect = is_reconnect))]
    async fn send_connect_client(&self, is_reconnect: bool) -> Result<()> {
        let msg = ConnectClientMessage {
            ts: now_ms(),
            proc_run_id: self.proc_run_id.clone(),
            acc_id: self.config.acc_id.clone(),
            zone_name: self.config.zone_name.clone(),
            anon_acc: self.config.anon_acc,
            proc_name: self.config.proc_name.clone(),
            proc_tags: self.config.proc_tags.clone(),
            host_data: host_data(),
            start_ts: self.start_ts,
            reconnect_app_runtimes: if is_reconnect {
                self.reconnect_app_names()
            } else {
                Vec::new()
            },
        };
        let envelope = RpcRequest {
            conn_id: self.conn_id(),
            client_version: CLIENT_VERSION.to_string(),
            request: Some(rpc_request::Request::ConnectClient(msg)),
        };
        let resp = match self.transport.call(&envelope).await {
            Ok(resp) => resp,
            Err(e) => {
                self.clear_conn_id();
                return Err(SdkError::from(e));
            }
        };
        let resp = match resp.response {
            Some(rpc_response::Response::ConnectClient(resp)) => resp,
            _ => {
                self.clear_conn_id();
                return Err(SdkError::rpc("ConnectClient", "unexpected response"));
            }
        };
        for rec_err in &resp.reconnect_errs {
            warn!(error = %rec_err, "app rebind error on reconnect");
        }
        if let Some(status) = &resp.status {
            if let Some(err) = SdkError::from_status("ConnectClient", status) {
                self.clear_conn_id();
                if !err.can_retry() {
                    self.state.lock().unwrap().perm_err = true;
                }
                warn!(error = %err, "ConnectClient failed");
                return Err(err);
            }
        }
        *self.conn_id.write().unwrap() = resp.conn_id.clone();
        let acc_info = resp.acc_info.clone().unwrap_or_default();
        {
            let mut state = self.state.lock().unwrap();
            state.acc_info = resp.acc_info;
        }
        if !is_reconnect {
            if acc_info.new_account {
                info!(acc_id = %self.config.acc_id, "new account provisioned");
            } else if acc_info.acc_type == "anon" {
                info!("connected with an anonymous account");
            }
            info!(
                acc_id = %self.config.acc_id,
                zone = %self.config.zone_name,
                acc_type = %acc_info.acc_type,
                "cloud client connected"
            );
        } else {
            debug!(
                acc_id = %self.config.acc_id,
                conn_id = %resp.conn_id,
                "cloud client reconnected"
            );
        }
        Ok(())
    }

    // -- reconnect loop / request stream --

    async fn run_request_stream_loop(&self) {
        let mut wait = ExpoWait::new();
        loop {
            match self.transport.state().await {
                ChannelState::Shutdown => {
                    info!("request stream loop exiting, transport shutdown");
                    self.set_exit_err(SdkError::Shutdown);
                    break;
                }
                ChannelState::Connecting | ChannelState::TransientFailure => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    wait.reset();
                    if let Err(e) = self.transport.connect().await {
                        debug!(error = %e, "redial failed");
                    }
                    continue;
                }
                _ => {}
            }
            if !wait.wait().await {
                continue;
            }
            if self.conn_id_is_empty() {
                match self.send_connect_client(true).await {
                    Ok(()) => {}
                    Err(e) if e.can_retry() => continue,
                    Err(e) => {
                        warn!(error = %e, "request stream loop exiting, permanent error");
                        self.set_exit_err(e);
                        break;
                    }
                }
            }
            let (ran_ok, err_code) = self.run_request_stream().await;
            if ran_ok {
                wait.reset();
            }
            if err_code == ErrCode::BadConnId {
                // rejected identity: renegotiate immediately, no backoff
                self.clear_conn_id();
                wait.reset();
                continue;
            }
            wait.force_wait = true;
        }
        self.done.cancel();
    }

    /// Consume the request stream until it ends. Returns whether the stream
    /// was healthy long enough to reset backoff, plus the ending error code.
    async fn run_request_stream(&self) -> (bool, ErrCode) {
        let envelope = RpcRequest {
            conn_id: self.conn_id(),
            client_version: CLIENT_VERSION.to_string(),
            request: Some(rpc_request::Request::RequestStream(RequestStreamMessage {
                ts: now_ms(),
            })),
        };
        debug!("request stream starting");
        let mut stream = match self.transport.open_request_stream(&envelope).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "error opening request stream");
                return (false, ErrCode::Rpc);
            }
        };
        let started = Instant::now();
        let ending: ErrCode;
        loop {
            match stream.next_request().await {
                Ok(None) => {
                    debug!("request stream done: eof");
                    ending = ErrCode::Eof;
                    break;
                }
                Err(ClientError::ErrorFrame { code, message }) => {
                    debug!(code = %code, message = %message, "request stream error frame");
                    ending = ErrCode::from_str(&code);
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "request stream transport error");
                    ending = ErrCode::Rpc;
                    break;
                }
                Ok(Some(msg)) => {
                    if let Some(status) = &msg.status {
                        if let Some(err) = SdkError::from_status("RequestStream", status) {
                            debug!(error = %err, "request stream status");
                            ending = err.code();
                            break;
                        }
                    }
                    self.spawn_dispatch(msg);
                }
            }
        }
        (
            started.elapsed() >= Duration::from_secs(HEALTHY_STREAM_SECS),
            ending,
        )
    }

    fn spawn_dispatch(&self, msg: RequestMessage) {
        debug!(
            app = %msg.app_name,
            request_type = %msg.request_type,
            path = %msg.path,
            req_id = %msg.req_id,
            "inbound request"
        );
        let runtime = self.lookup_runtime(&msg);
        let sender: Arc<dyn ResponseSender> = self.arc();
        let no_default_auth = self.config.no_default_auth;
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let client = self.arc();
        tokio::spawn(async move {
            dispatch_request(runtime, sender, msg, no_default_auth).await;
            client.inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn lookup_runtime(&self, msg: &RequestMessage) -> Option<RuntimeRef> {
        let state = self.state.lock().unwrap();
        if msg.request_type == "path" {
            if let Some(runtime) = state.link_runtimes.get(&msg.path) {
                return Some(runtime.clone());
            }
            // fall back to the parent path with the fragment stripped
            if let Some((parent, _frag)) = msg.path.rsplit_once('/') {
                let parent = if parent.is_empty() { "/" } else { parent };
                return state.link_runtimes.get(parent).cloned();
            }
            return None;
        }
        if let Some(runtime) = state.app_runtimes.get(&msg.app_name) {
            return Some(runtime.clone());
        }
        // app runtimes linked through the filesystem surface
        if !msg.path.is_empty() {
            if let Some(runtime @ RuntimeRef::App(_)) = state.link_runtimes.get(&msg.path) {
                return Some(runtime.clone());
            }
        }
        None
    }

    pub(crate) fn register_link_runtime(&self, path: &str, runtime: RuntimeRef) {
        let mut state = self.state.lock().unwrap();
        state.link_runtimes.insert(path.to_string(), runtime);
    }

    fn register_app_runtime(&self, app_name: &str, runtime: RuntimeRef) {
        let mut state = self.state.lock().unwrap();
        state.app_runtimes.insert(app_name.to_string(), runtime);
    }

    // -- rpc plumbing --

    fn envelope(&self, request: rpc_request::Request) -> RpcRequest {
        RpcRequest {
            conn_id: self.conn_id(),
            client_version: CLIENT_VERSION.to_string(),
            request: Some(request),
        }
    }

    async fn unary(
        &self,
        call_name: &str,
        request: rpc_request::Request,
    ) -> Result<rpc_response::Response> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let resp = self.transport.call(&self.envelope(request)).await?;
        resp.response
            .ok_or_else(|| SdkError::rpc(call_name, "empty response"))
    }

    fn handle_status(&self, call_name: &str, status: Option<&RtnStatus>) -> Result<()> {
        if let Some(status) = status {
            if let Some(err) = SdkError::from_status(call_name, status) {
                if self.config.verbose {
                    warn!(call = %call_name, error = %err, "console call failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // -- app operations --

    /// Publish the app descriptor (and any queued blobs) without binding its
    /// runtime to this process.
    pub async fn write_app(&self, app: &mut App) -> Result<()> {
        let result = self.base_write_app(app, false).await;
        self.show_app_link(app.app_name());
        result
    }

    /// Publish the app and bind its runtime so inbound requests dispatch to
    /// this process.
    pub async fn write_and_connect_app(&self, app: &mut App) -> Result<()> {
        let result = self.base_write_app(app, true).await;
        match &result {
            Ok(()) => {}
            Err(e) if e.can_retry() => {
                // the reconnect loop rebinds registered apps; keep the
                // registration so a transient failure heals itself
            }
            Err(_) => return result,
        }
        self.register_app_runtime(
            app.app_name(),
            RuntimeRef::App(app.runtime().clone()),
        );
        self.show_app_link(app.app_name());
        result
    }

    /// Bind an already-published app's runtime without rewriting the
    /// descriptor.
    pub async fn connect_app_runtime(&self, app: &App) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let acfg = app.app_config()?;
        let resp = self
            .unary(
                "ConnectAppRuntime",
                rpc_request::Request::WriteApp(WriteAppMessage {
                    ts: now_ms(),
                    app_name: acfg.app_name.clone(),
                    app_config_json: String::new(),
                    connect_app: true,
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::WriteApp(resp) => {
                self.handle_status("ConnectAppRuntime", resp.status.as_ref())?;
            }
            _ => return Err(SdkError::rpc("ConnectAppRuntime", "unexpected response")),
        }
        self.register_app_runtime(app.app_name(), RuntimeRef::App(app.runtime().clone()));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(app = %app.app_name(), connect = connect))]
    async fn base_write_app(&self, app: &mut App, connect: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let mut acfg = app.app_config()?;
        acfg.proc_run_id = self.proc_run_id.clone();
        acfg.client_version = CLIENT_VERSION.to_string();
        let config_json = serde_json::to_string(&acfg)
            .map_err(|e| SdkError::json_marshal("AppConfig", e))?;
        let resp = self
            .unary(
                "WriteApp",
                rpc_request::Request::WriteApp(WriteAppMessage {
                    ts: now_ms(),
                    app_name: acfg.app_name.clone(),
                    app_config_json: config_json,
                    connect_app: connect,
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::WriteApp(resp) => {
                self.handle_status("WriteApp", resp.status.as_ref())?;
                for (name, warning) in &resp.option_warnings {
                    warn!(app = %acfg.app_name, option = %name, warning = %warning, "app option warning");
                }
            }
            _ => return Err(SdkError::rpc("WriteApp", "unexpected response")),
        }
        for (blob, bytes) in app.pending_blobs().to_vec() {
            self.set_blob_data(&acfg, blob, bytes).await?;
        }
        app.clear_pending_blobs();
        Ok(())
    }

    /// Remove an app (descriptor, data, and blobs) from the console.
    #[tracing::instrument(skip(self))]
    pub async fn remove_app(&self, app_name: &str) -> Result<()> {
        if !paths::is_app_name_valid(app_name) {
            return Err(SdkError::Validate(format!(
                "invalid app name '{}'",
                app_name
            )));
        }
        let resp = self
            .unary(
                "RemoveApp",
                rpc_request::Request::RemoveApp(RemoveAppMessage {
                    ts: now_ms(),
                    app_name: app_name.to_string(),
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::RemoveApp(resp) => {
                self.handle_status("RemoveApp", resp.status.as_ref())?;
            }
            _ => return Err(SdkError::rpc("RemoveApp", "unexpected response")),
        }
        {
            let mut state = self.state.lock().unwrap();
            state.app_runtimes.remove(app_name);
        }
        info!(app = %app_name, "removed app");
        Ok(())
    }

    /// Fetch an app's console-held descriptor for modification, or a fresh
    /// app when none exists.
    pub async fn open_app(&self, app_name: &str) -> Result<App> {
        let resp = self
            .unary(
                "OpenApp",
                rpc_request::Request::OpenApp(OpenAppMessage {
                    ts: now_ms(),
                    app_name: app_name.to_string(),
                }),
            )
            .await?;
        let resp = match resp {
            rpc_response::Response::OpenApp(resp) => resp,
            _ => return Err(SdkError::rpc("OpenApp", "unexpected response")),
        };
        self.handle_status("OpenApp", resp.status.as_ref())?;
        if resp.app_config_json.is_empty() {
            return Ok(App::new(app_name));
        }
        let config: AppConfig = serde_json::from_str(&resp.app_config_json)
            .map_err(|e| SdkError::json_unmarshal("AppConfig", e))?;
        Ok(App::from_config(config))
    }

    /// The console's view of this zone.
    pub async fn reflect_zone(&self) -> Result<ReflectZone> {
        let resp = self
            .unary(
                "ReflectZone",
                rpc_request::Request::ReflectZone(ReflectZoneMessage { ts: now_ms() }),
            )
            .await?;
        let resp = match resp {
            rpc_response::Response::ReflectZone(resp) => resp,
            _ => return Err(SdkError::rpc("ReflectZone", "unexpected response")),
        };
        self.handle_status("ReflectZone", resp.status.as_ref())?;
        serde_json::from_str(&resp.json_data)
            .map_err(|e| SdkError::json_unmarshal("ReflectZone", e))
    }

    /// Invoke another process's data handler through the console.
    pub async fn call_data_handler(
        &self,
        app_name: &str,
        path: &str,
        data: impl serde::Serialize,
    ) -> Result<serde_json::Value> {
        let json_data = serde_json::to_string(&data)
            .map_err(|e| SdkError::json_marshal("CallDataHandler", e))?;
        let resp = self
            .unary(
                "CallDataHandler",
                rpc_request::Request::CallDataHandler(CallDataHandlerMessage {
                    ts: now_ms(),
                    app_name: app_name.to_string(),
                    path: path.to_string(),
                    json_data,
                }),
            )
            .await?;
        let resp = match resp {
            rpc_response::Response::CallDataHandler(resp) => resp,
            _ => return Err(SdkError::rpc("CallDataHandler", "unexpected response")),
        };
        self.handle_status("CallDataHandler", resp.status.as_ref())?;
        if resp.json_data.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&resp.json_data)
            .map_err(|e| SdkError::json_unmarshal("CallDataHandler", e))
    }

    /// Ask connected frontends to re-pull a data path.
    pub async fn backend_push(&self, app_name: &str, path: &str) -> Result<()> {
        let resp = self
            .unary(
                "BackendPush",
                rpc_request::Request::BackendPush(BackendPushMessage {
                    ts: now_ms(),
                    app_name: app_name.to_string(),
                    path: path.to_string(),
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::BackendPush(resp) => {
                self.handle_status("BackendPush", resp.status.as_ref())
            }
            _ => Err(SdkError::rpc("BackendPush", "unexpected response")),
        }
    }

    /// Upload one blob for an app version. The account blob size limit is
    /// enforced locally before any RPC.
    #[tracing::instrument(skip_all, fields(app = %acfg.app_name, blob_key = %blob.blob_key, size = bytes.len()))]
    pub async fn set_blob_data(
        &self,
        acfg: &AppConfig,
        blob: BlobData,
        bytes: Bytes,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        check_blob_limit(self.acc_info().as_ref(), bytes.len())?;
        let blob_data_json =
            serde_json::to_string(&blob).map_err(|e| SdkError::json_marshal("BlobData", e))?;
        let resp = self
            .unary(
                "SetBlobData",
                rpc_request::Request::SetBlob(SetBlobMessage {
                    ts: now_ms(),
                    app_name: acfg.app_name.clone(),
                    app_version: acfg.app_version.clone(),
                    blob_data_json,
                    blob_bytes: bytes.to_vec(),
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::SetBlob(resp) => {
                self.handle_status("SetBlobData", resp.status.as_ref())
            }
            _ => Err(SdkError::rpc("SetBlobData", "unexpected response")),
        }
    }

    // -- filesystem surface plumbing --

    pub(crate) async fn set_path_rpc(
        &self,
        path: &str,
        file_opts_json: String,
        body: Option<Bytes>,
    ) -> Result<()> {
        check_blob_limit(
            self.acc_info().as_ref(),
            body.as_ref().map(|b| b.len()).unwrap_or(0),
        )?;
        let resp = self
            .unary(
                "SetPath",
                rpc_request::Request::SetPath(SetPathMessage {
                    ts: now_ms(),
                    path: path.to_string(),
                    file_opts_json,
                    has_body: body.is_some(),
                    body: body.map(|b| b.to_vec()).unwrap_or_default(),
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::SetPath(resp) => {
                self.handle_status("SetPath", resp.status.as_ref())
            }
            _ => Err(SdkError::rpc("SetPath", "unexpected response")),
        }
    }

    pub(crate) async fn remove_path_rpc(&self, path: &str) -> Result<()> {
        let resp = self
            .unary(
                "RemovePath",
                rpc_request::Request::RemovePath(RemovePathMessage {
                    ts: now_ms(),
                    path: path.to_string(),
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::RemovePath(resp) => {
                self.handle_status("RemovePath", resp.status.as_ref())?;
            }
            _ => return Err(SdkError::rpc("RemovePath", "unexpected response")),
        }
        let mut state = self.state.lock().unwrap();
        state.link_runtimes.remove(path);
        Ok(())
    }

    pub(crate) async fn file_info_rpc(
        &self,
        path: &str,
        dir_opts_json: String,
    ) -> Result<String> {
        let resp = self
            .unary(
                "FileInfo",
                rpc_request::Request::FileInfo(FileInfoMessage {
                    ts: now_ms(),
                    path: path.to_string(),
                    dir_opts_json,
                }),
            )
            .await?;
        match resp {
            rpc_response::Response::FileInfo(resp) => {
                self.handle_status("FileInfo", resp.status.as_ref())?;
                Ok(resp.file_info_json)
            }
            _ => Err(SdkError::rpc("FileInfo", "unexpected response")),
        }
    }

    // -- links --

    fn acc_host(&self) -> Result<String> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        let acc_info = self.acc_info();
        if let Some(info) = &acc_info {
            if !info.acc_cname.is_empty() {
                if self.config.env != "prod" {
                    return Ok(format!("https://{}:8080", info.acc_cname));
                }
                return Ok(format!("https://{}", info.acc_cname));
            }
        }
        Ok(format!(
            "https://acc-{}.{}",
            self.config.acc_id,
            self.config.console_host()
        ))
    }

    /// URL for an app (by name) or a filesystem path (by `/`-prefixed path),
    /// with a link token unless suppressed.
    pub async fn make_app_url(
        &self,
        app_name_or_path: &str,
        jwt_opts: Option<JwtOpts>,
    ) -> Result<String> {
        if app_name_or_path.is_empty() {
            return Err(SdkError::Validate("invalid app path".to_string()));
        }
        if app_name_or_path.starts_with('/') {
            return self.make_path_url_inner("", app_name_or_path, jwt_opts);
        }
        let base_url = format!(
            "{}{}",
            self.acc_host()?,
            paths::make_app_path(&self.config.zone_name, app_name_or_path)
        );
        let opts = jwt_opts.unwrap_or_else(|| self.config.jwt_opts());
        if opts.no_jwt {
            return Ok(base_url);
        }
        let token = make_account_jwt(&self.config, &opts)?;
        Ok(format!("{}?jwt={}", base_url, token))
    }

    pub(crate) fn make_path_url_inner(
        &self,
        root_path: &str,
        path: &str,
        jwt_opts: Option<JwtOpts>,
    ) -> Result<String> {
        if !paths::is_full_path_valid(path) {
            return Err(SdkError::Validate(format!("invalid path '{}'", path)));
        }
        let link = format!("{}/@fs{}{}", self.acc_host()?, root_path, path);
        let opts = jwt_opts.unwrap_or_else(|| self.config.jwt_opts());
        if opts.no_jwt {
            return Ok(link);
        }
        opts.validate()?;
        let token = make_account_jwt(&self.config, &opts)?;
        Ok(format!("{}?jwt={}", link, token))
    }

    fn show_app_link(&self, app_name: &str) {
        let acc_jwt_enabled = self
            .acc_info()
            .map(|info| info.acc_jwt_enabled)
            .unwrap_or(false);
        let host = match self.acc_host() {
            Ok(host) => host,
            Err(_) => return,
        };
        let base = format!(
            "{}{}",
            host,
            paths::make_app_path(&self.config.zone_name, app_name)
        );
        if self.config.no_show_jwt || !acc_jwt_enabled {
            info!(app = %app_name, link = %base, "app link");
            return;
        }
        match make_account_jwt(&self.config, &self.config.jwt_opts()) {
            Ok(token) => {
                info!(app = %app_name, link = %format!("{}?jwt={}", base, token), "app link")
            }
            Err(e) => warn!(app = %app_name, error = %e, "cannot build app link"),
        }
    }
}

impl CloudClient {
    /// Filesystem surface rooted at `/`.
    pub fn fs(&self) -> FsClient {
        FsClient::new(self.arc(), String::new())
    }

    /// Filesystem surface rooted at an app's path space.
    pub fn app_fs(&self, app_name: &str) -> FsClient {
        FsClient::new(self.arc(), paths::app_path_from_name(app_name))
    }

    /// Open a bare outbound stream with no attached clients. The caller owns
    /// the returned request and must call `done()`.
    pub async fn start_bare_stream(
        &self,
        app_name: &str,
        opts: StreamOpts,
    ) -> Result<AppRequest> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        {
            let state = self.state.lock().unwrap();
            if !state.app_runtimes.contains_key(app_name) {
                return Err(SdkError::Validate(format!(
                    "no active app '{}' for bare stream",
                    app_name
                )));
            }
        }
        let sender: Arc<dyn ResponseSender> = self.arc();
        start_stream_request(sender, app_name, "", opts).await
    }

    /// Whether the client latched a permanent connect failure.
    pub fn perm_err(&self) -> bool {
        self.state.lock().unwrap().perm_err
    }
}

#[async_trait::async_trait]
impl ResponseSender for CloudClient {
    async fn send_response(&self, msg: SendResponseMessage) -> Result<i32> {
        let resp = self
            .unary("SendResponse", rpc_request::Request::SendResponse(msg))
            .await?;
        match resp {
            rpc_response::Response::SendResponse(resp) => {
                self.handle_status("SendResponse", resp.status.as_ref())?;
                Ok(resp.num_stream_clients)
            }
            _ => Err(SdkError::rpc("SendResponse", "unexpected response")),
        }
    }

    async fn start_stream(&self, msg: StartStreamMessage) -> Result<String> {
        let existing = msg.existing_req_id.clone();
        let resp = self
            .unary("StartStream", rpc_request::Request::StartStream(msg))
            .await?;
        match resp {
            rpc_response::Response::StartStream(resp) => {
                self.handle_status("StartStream", resp.status.as_ref())?;
                if !existing.is_empty() && resp.req_id != existing {
                    return Err(SdkError::Validate(format!(
                        "stream returned req id {} does not match existing req id {}",
                        resp.req_id, existing
                    )));
                }
                Ok(resp.req_id)
            }
            _ => Err(SdkError::rpc("StartStream", "unexpected response")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AppRuntime, LinkRuntime};

    fn test_client() -> Option<Arc<CloudClient>> {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("c.key").to_string_lossy().into_owned();
        let cert_file = dir.path().join("c.crt").to_string_lossy().into_owned();
        keygen::create_keypair(&key_file, &cert_file, "acc-test").ok()?;
        let mut config = Config::new()
            .with_acc_id("acc-test")
            .with_keypair(&key_file, &cert_file)
            .with_server("127.0.0.1", 59990);
        config.setup_defaults().ok()?;
        // UDP bind may fail in sandboxed environments
        CloudClient::build(config).ok()
    }

    #[test]
    fn test_check_blob_limit() {
        // S6: 2 MB payload against a 1 MB account limit, no RPC attempted
        let info = AccInfo {
            blob_size_limit_mb: 1.0,
            ..Default::default()
        };
        let err = check_blob_limit(Some(&info), 2_000_000).unwrap_err();
        assert!(matches!(err, SdkError::Limit { .. }));
        assert!(!err.can_retry());

        assert!(check_blob_limit(Some(&info), 1_000_000).is_ok());
        assert!(check_blob_limit(None, usize::MAX).is_ok());
    }

    #[tokio::test]
    async fn test_initial_state_not_connected() {
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        assert!(!client.is_connected());
        assert!(client.conn_id_is_empty());
        assert!(client.acc_info().is_none());
        assert!(client.exit_err().is_none());
    }

    #[tokio::test]
    async fn test_ops_require_conn_id() {
        // invariant: while conn id is empty, only ConnectClient may go out
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        assert!(matches!(
            client.backend_push("a", "/x").await,
            Err(SdkError::NotConnected)
        ));
        assert!(matches!(
            client.reflect_zone().await,
            Err(SdkError::NotConnected)
        ));
        let acfg = App::new("a").app_config().unwrap();
        assert!(matches!(
            client
                .set_blob_data(&acfg, BlobData::from_bytes("k", "t", b"x"), Bytes::from("x"))
                .await,
            Err(SdkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_exit_err_latches_first_error() {
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        client.set_exit_err(SdkError::Shutdown);
        client.set_exit_err(SdkError::BadConnId);
        assert!(matches!(client.exit_err(), Some(SdkError::Shutdown)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_app_names_sorted() {
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        client.register_app_runtime("zeta", RuntimeRef::App(Arc::new(AppRuntime::new())));
        client.register_app_runtime("alpha", RuntimeRef::App(Arc::new(AppRuntime::new())));
        assert_eq!(client.reconnect_app_names(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_lookup_runtime_by_app_and_path() {
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        client.register_app_runtime("myapp", RuntimeRef::App(Arc::new(AppRuntime::new())));
        client.register_link_runtime(
            "/linked/handler",
            RuntimeRef::Link(Arc::new(LinkRuntime::new())),
        );

        let mut msg = RequestMessage {
            request_type: "handler".to_string(),
            app_name: "myapp".to_string(),
            ..Default::default()
        };
        assert!(client.lookup_runtime(&msg).is_some());

        msg.app_name = "other".to_string();
        assert!(client.lookup_runtime(&msg).is_none());

        let path_msg = RequestMessage {
            request_type: "path".to_string(),
            path: "/linked/handler".to_string(),
            ..Default::default()
        };
        assert!(client.lookup_runtime(&path_msg).is_some());

        // fragment-qualified path resolves through the parent
        let frag_msg = RequestMessage {
            request_type: "path".to_string(),
            path: "/linked/handler/query".to_string(),
            ..Default::default()
        };
        assert!(client.lookup_runtime(&frag_msg).is_some());

        let missing = RequestMessage {
            request_type: "path".to_string(),
            path: "/not/linked".to_string(),
            ..Default::default()
        };
        assert!(client.lookup_runtime(&missing).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_clear_returns_when_idle() {
        let client = match test_client() {
            Some(c) => c,
            None => return,
        };
        let started = std::time::Instant::now();
        client.wait_for_clear().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_bootstrap_response_decoding() {
        let ok: BootstrapRtn = serde_json::from_str(
            r#"{"success":true,"data":{"grpcserver":"rpc.example.com","grpcport":7632}}"#,
        )
        .unwrap();
        assert!(ok.success);
        let data = ok.data.unwrap();
        assert_eq!(data.grpcserver, "rpc.example.com");
        assert_eq!(data.grpcport, 7632);

        let failed: BootstrapRtn =
            serde_json::from_str(r#"{"success":false,"error":"no such account"}"#).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error, "no such account");
        assert!(failed.data.is_none());
    }
}
