// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Inbound requests and the per-request response buffer.
//!
//! A handler receives an [`AppRequest`]: an immutable view of the inbound
//! request plus a shared [`ResponseBuffer`] that accumulates display-update
//! actions. Actions are delivered in append order; `flush` ships them
//! mid-request, `done` ships them with the terminal marker. The buffer is
//! `Open` until the first `done`, after which all mutation is rejected
//! (repeated `done` is ignored).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use panelhost_protocol::wire::{RrAction, SendResponseMessage, StartStreamMessage};

use crate::error::{Result, SdkError};

/// Current wall clock in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Request types delivered by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Handler,
    Data,
    Init,
    Html,
    /// Linked-runtime request addressed by path fragment.
    Path,
    /// Outbound stream opened by a handler.
    Stream,
    StreamClose,
}

impl RequestType {
    pub fn from_wire(s: &str) -> Option<RequestType> {
        match s {
            "handler" => Some(Self::Handler),
            "data" => Some(Self::Data),
            "init" => Some(Self::Init),
            "html" => Some(Self::Html),
            "path" => Some(Self::Path),
            "stream" => Some(Self::Stream),
            "streamclose" => Some(Self::StreamClose),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Data => "data",
            Self::Init => "init",
            Self::Html => "html",
            Self::Path => "path",
            Self::Stream => "stream",
            Self::StreamClose => "streamclose",
        }
    }
}

/// Immutable description of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub ts: i64,
    pub acc_id: String,
    pub zone_name: String,
    pub req_id: String,
    pub request_type: RequestType,
    pub app_name: String,
    pub path: String,
    /// Last path segment, the registry key for linked runtimes.
    pub path_frag: String,
    pub fe_client_id: String,
    /// Effective deadline after clamping.
    pub timeout: Duration,
}

impl RequestInfo {
    pub fn full_path(&self) -> String {
        if self.app_name.is_empty() {
            self.path.clone()
        } else {
            format!("{}:{}", self.app_name, self.path)
        }
    }

    /// Root handler request: the app's front door, which must always carry
    /// an auth action.
    pub fn is_root_request(&self) -> bool {
        self.request_type == RequestType::Handler && !self.app_name.is_empty() && self.path == "/"
    }
}

pub(crate) fn path_frag_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// One entry of the request's authentication data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAtom {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl AuthAtom {
    /// Automatic atom with a 24 h expiry.
    pub fn auto(auth_type: &str, role: &str) -> AuthAtom {
        AuthAtom {
            scope: String::new(),
            auth_type: auth_type.to_string(),
            auto: true,
            ts: now_ms() + 24 * 60 * 60 * 1000,
            id: String::new(),
            role: role.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeField {
    pub label: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// "challenge", "console", or both comma-separated.
    pub allowedauth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub challengemessage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub challengeerror: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub challengefields: Vec<ChallengeField>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChallengeData {
    #[serde(default)]
    challengedata: std::collections::HashMap<String, String>,
}

/// The closed set of display-update actions.
#[derive(Debug, Clone)]
pub enum RrActionKind {
    SetData { selector: String, data: Value },
    Invalidate { selector: String },
    Html { html: String },
    Event { selector: String, event_type: String, data: Value },
    PanelAuth { atom: AuthAtom },
    PanelAuthChallenge { challenge: AuthChallenge },
    Error { message: String },
}

impl RrActionKind {
    fn is_auth(&self) -> bool {
        matches!(
            self,
            RrActionKind::PanelAuth { .. } | RrActionKind::PanelAuthChallenge { .. }
        )
    }

    fn into_wire(self, ts: i64) -> Result<RrAction> {
        let mut action = RrAction {
            ts,
            ..Default::default()
        };
        match self {
            RrActionKind::SetData { selector, data } => {
                action.action_type = "setdata".to_string();
                action.selector = selector;
                action.json_data = serde_json::to_string(&data)
                    .map_err(|e| SdkError::json_marshal("SetData", e))?;
            }
            RrActionKind::Invalidate { selector } => {
                action.action_type = "invalidate".to_string();
                action.selector = selector;
            }
            RrActionKind::Html { html } => {
                action.action_type = "html".to_string();
                action.html = html;
            }
            RrActionKind::Event {
                selector,
                event_type,
                data,
            } => {
                action.action_type = "event".to_string();
                action.selector = selector;
                action.event_type = event_type;
                action.json_data = serde_json::to_string(&data)
                    .map_err(|e| SdkError::json_marshal("SendEvent", e))?;
            }
            RrActionKind::PanelAuth { atom } => {
                action.action_type = "panelauth".to_string();
                action.json_data = serde_json::to_string(&atom)
                    .map_err(|e| SdkError::json_marshal("PanelAuth", e))?;
            }
            RrActionKind::PanelAuthChallenge { challenge } => {
                action.action_type = "panelauthchallenge".to_string();
                action.json_data = serde_json::to_string(&challenge)
                    .map_err(|e| SdkError::json_marshal("PanelAuthChallenge", e))?;
            }
            RrActionKind::Error { message } => {
                action.action_type = "error".to_string();
                action.err = message;
            }
        }
        Ok(action)
    }
}

/// Seam between the response buffer and the transport. `CloudClient`
/// implements it; tests substitute a capturing mock.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    async fn send_response(&self, msg: SendResponseMessage) -> Result<i32>;
    async fn start_stream(&self, msg: StartStreamMessage) -> Result<String>;
}

struct BufferState {
    actions: Vec<RrAction>,
    done: bool,
    /// An auth action was emitted or auth was explicitly handled.
    auth_impl: bool,
    last_ts: i64,
}

/// Per-request accumulator of response actions with the flush/done
/// lifecycle. All mutators serialise on the internal lock; sends happen
/// outside it.
pub struct ResponseBuffer {
    req_id: String,
    request_type: String,
    app_name: String,
    fe_client_id: String,
    /// Inject a NoAuth action at `done` when no auth action was emitted.
    inject_default_auth: bool,
    /// The request already carried auth atoms.
    authenticated: bool,
    sender: Arc<dyn ResponseSender>,
    state: Mutex<BufferState>,
}

impl ResponseBuffer {
    pub fn new(
        info: &RequestInfo,
        authenticated: bool,
        inject_default_auth: bool,
        sender: Arc<dyn ResponseSender>,
    ) -> Arc<ResponseBuffer> {
        Arc::new(ResponseBuffer {
            req_id: info.req_id.clone(),
            request_type: info.request_type.as_wire().to_string(),
            app_name: info.app_name.clone(),
            fe_client_id: info.fe_client_id.clone(),
            inject_default_auth: inject_default_auth && info.is_root_request(),
            authenticated,
            sender,
            state: Mutex::new(BufferState {
                actions: Vec::new(),
                done: false,
                auth_impl: false,
                last_ts: 0,
            }),
        })
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    fn next_ts(state: &mut BufferState) -> i64 {
        let now = now_ms();
        let ts = if now <= state.last_ts {
            state.last_ts + 1
        } else {
            now
        };
        state.last_ts = ts;
        ts
    }

    /// Append one action. Only legal while the buffer is open.
    pub fn append(&self, kind: RrActionKind) -> Result<()> {
        let is_auth = kind.is_auth();
        let mut state = self.state.lock().unwrap();
        if state.done {
            return Err(SdkError::Validate(format!(
                "response for request {} is already done",
                self.req_id
            )));
        }
        let ts = Self::next_ts(&mut state);
        let action = kind.into_wire(ts)?;
        if is_auth {
            state.auth_impl = true;
        }
        state.actions.push(action);
        Ok(())
    }

    /// Mark auth as explicitly handled without emitting an action.
    pub fn mark_auth_handled(&self) {
        let mut state = self.state.lock().unwrap();
        state.auth_impl = true;
    }

    pub fn auth_handled(&self) -> bool {
        self.state.lock().unwrap().auth_impl
    }

    fn drain(&self, terminal: bool) -> Result<Option<Vec<RrAction>>> {
        let mut state = self.state.lock().unwrap();
        if state.done {
            if terminal {
                // repeated done is idempotently ignored
                return Ok(None);
            }
            return Err(SdkError::Validate(format!(
                "cannot flush request {}, response is already done",
                self.req_id
            )));
        }
        if terminal {
            if self.inject_default_auth && !state.auth_impl && !self.authenticated {
                let ts = Self::next_ts(&mut state);
                let action = RrActionKind::PanelAuth {
                    atom: AuthAtom::auto("noauth", "user"),
                }
                .into_wire(ts)?;
                state.auth_impl = true;
                state.actions.push(action);
            }
            state.done = true;
        }
        Ok(Some(std::mem::take(&mut state.actions)))
    }

    fn response_message(&self, actions: Vec<RrAction>, done: bool) -> SendResponseMessage {
        SendResponseMessage {
            ts: now_ms(),
            req_id: self.req_id.clone(),
            request_type: self.request_type.clone(),
            app_name: self.app_name.clone(),
            fe_client_id: self.fe_client_id.clone(),
            actions,
            response_done: done,
            err: String::new(),
        }
    }

    /// Ship accumulated actions without closing the request.
    pub async fn flush(&self) -> Result<i32> {
        let actions = match self.drain(false)? {
            Some(actions) => actions,
            None => return Ok(0),
        };
        self.sender
            .send_response(self.response_message(actions, false))
            .await
    }

    /// Ship accumulated actions and close the request. Idempotent.
    pub async fn done(&self) -> Result<()> {
        let actions = match self.drain(true)? {
            Some(actions) => actions,
            None => return Ok(()),
        };
        self.sender
            .send_response(self.response_message(actions, true))
            .await?;
        Ok(())
    }
}

/// Options for upgrading a request to a long-lived outbound stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOpts {
    /// Caller-chosen stream id; required for bare streams.
    pub stream_id: String,
    /// Handler path invoked when the last client detaches.
    pub control_path: String,
    /// Keep the stream alive with no attached clients.
    pub no_server_cancel: bool,
}

/// A handler's view of one inbound request.
#[derive(Clone)]
pub struct AppRequest {
    info: Arc<RequestInfo>,
    data: Arc<Value>,
    panel_state: Arc<Value>,
    auth: Arc<Vec<AuthAtom>>,
    buffer: Arc<ResponseBuffer>,
}

impl std::fmt::Debug for AppRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRequest")
            .field("info", &self.info)
            .field("data", &self.data)
            .field("panel_state", &self.panel_state)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl AppRequest {
    pub fn new(
        info: RequestInfo,
        data: Value,
        panel_state: Value,
        auth: Vec<AuthAtom>,
        buffer: Arc<ResponseBuffer>,
    ) -> AppRequest {
        AppRequest {
            info: Arc::new(info),
            data: Arc::new(data),
            panel_state: Arc::new(panel_state),
            auth: Arc::new(auth),
            buffer,
        }
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn req_id(&self) -> &str {
        &self.info.req_id
    }

    pub fn app_name(&self) -> &str {
        &self.info.app_name
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    /// Raw request payload.
    pub fn raw_data(&self) -> &Value {
        &self.data
    }

    /// Decode the request payload into a caller-supplied shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value((*self.data).clone())
            .map_err(|e| SdkError::json_unmarshal("request data", e))
    }

    /// Decode the panel state into a caller-supplied shape.
    pub fn panel_state_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value((*self.panel_state).clone())
            .map_err(|e| SdkError::json_unmarshal("panel state", e))
    }

    pub fn auth_atoms(&self) -> &[AuthAtom] {
        &self.auth
    }

    pub fn is_authenticated(&self) -> bool {
        !self.auth.is_empty()
    }

    pub(crate) fn buffer(&self) -> &Arc<ResponseBuffer> {
        &self.buffer
    }

    // -- response actions --

    pub fn set_data(&self, selector: &str, data: impl Serialize) -> Result<()> {
        let value =
            serde_json::to_value(data).map_err(|e| SdkError::json_marshal("SetData", e))?;
        self.buffer.append(RrActionKind::SetData {
            selector: selector.to_string(),
            data: value,
        })
    }

    pub fn invalidate_data(&self, selector: &str) -> Result<()> {
        self.buffer.append(RrActionKind::Invalidate {
            selector: selector.to_string(),
        })
    }

    pub fn set_html(&self, html: impl Into<String>) -> Result<()> {
        self.buffer.append(RrActionKind::Html { html: html.into() })
    }

    pub fn send_event(
        &self,
        selector: &str,
        event_type: &str,
        data: impl Serialize,
    ) -> Result<()> {
        let value =
            serde_json::to_value(data).map_err(|e| SdkError::json_marshal("SendEvent", e))?;
        self.buffer.append(RrActionKind::Event {
            selector: selector.to_string(),
            event_type: event_type.to_string(),
            data: value,
        })
    }

    // -- auth --

    /// Allow the request through with no authentication, emitting an
    /// automatic atom when the request carries none.
    pub fn no_auth(&self) -> Result<()> {
        self.buffer.mark_auth_handled();
        if !self.is_authenticated() {
            self.buffer.append(RrActionKind::PanelAuth {
                atom: AuthAtom::auto("noauth", "user"),
            })?;
        }
        Ok(())
    }

    /// Challenge-based password auth. Returns `Ok(true)` when the request is
    /// authorized; otherwise a challenge is queued and `Ok(false)` returned.
    pub fn password_auth(&self, password: &str) -> Result<bool> {
        self.buffer.mark_auth_handled();
        if self.is_authenticated() {
            return Ok(true);
        }
        let challenge_data: ChallengeData =
            serde_json::from_value((*self.data).clone()).unwrap_or_default();
        if challenge_data.challengedata.get("password").map(String::as_str) == Some(password) {
            self.buffer.append(RrActionKind::PanelAuth {
                atom: AuthAtom::auto("password", "user"),
            })?;
            return Ok(true);
        }
        let mut challenge = AuthChallenge {
            allowedauth: "challenge,console".to_string(),
            challengefields: vec![ChallengeField {
                label: "App Password".to_string(),
                name: "password".to_string(),
                field_type: "password".to_string(),
            }],
            ..Default::default()
        };
        if challenge_data.challengedata.get("submitted").map(String::as_str) == Some("1") {
            let submitted = challenge_data
                .challengedata
                .get("password")
                .map(String::as_str)
                .unwrap_or("");
            challenge.challengeerror = if submitted.is_empty() {
                "Password cannot be blank".to_string()
            } else {
                "Invalid password".to_string()
            };
        }
        self.buffer
            .append(RrActionKind::PanelAuthChallenge { challenge })?;
        Ok(false)
    }

    // -- lifecycle --

    /// Ship accumulated actions without closing the request.
    pub async fn flush(&self) -> Result<()> {
        self.buffer.flush().await?;
        Ok(())
    }

    /// Close the request. The dispatcher calls this automatically when the
    /// handler returns; explicit calls are idempotent.
    pub async fn done(&self) -> Result<()> {
        self.buffer.done().await
    }

    /// Upgrade to a long-lived outbound stream. The returned request stays
    /// open until its own `done`.
    pub async fn start_stream(&self, opts: StreamOpts) -> Result<AppRequest> {
        start_stream_request(
            self.buffer.sender.clone(),
            &self.info.app_name,
            &self.info.req_id,
            opts,
        )
        .await
    }
}

/// Open an outbound stream request, optionally rebinding an existing
/// request id. Used for both in-request upgrades and bare streams.
pub(crate) async fn start_stream_request(
    sender: Arc<dyn ResponseSender>,
    app_name: &str,
    existing_req_id: &str,
    opts: StreamOpts,
) -> Result<AppRequest> {
    if existing_req_id.is_empty() && opts.stream_id.is_empty() {
        return Err(SdkError::Validate(
            "bare streams require a stream id".to_string(),
        ));
    }
    let msg = StartStreamMessage {
        ts: now_ms(),
        app_name: app_name.to_string(),
        existing_req_id: existing_req_id.to_string(),
        stream_id: opts.stream_id.clone(),
        control_path: opts.control_path.clone(),
        no_server_cancel: opts.no_server_cancel,
    };
    let bound_req_id = sender.start_stream(msg).await?;
    if !existing_req_id.is_empty() && bound_req_id != existing_req_id {
        return Err(SdkError::Validate(format!(
            "stream bound req id {} does not match existing req id {}",
            bound_req_id, existing_req_id
        )));
    }
    let info = RequestInfo {
        ts: now_ms(),
        acc_id: String::new(),
        zone_name: String::new(),
        req_id: bound_req_id,
        request_type: RequestType::Stream,
        app_name: app_name.to_string(),
        path: String::new(),
        path_frag: String::new(),
        fe_client_id: String::new(),
        timeout: Duration::ZERO,
    };
    let buffer = ResponseBuffer::new(&info, false, false, sender);
    Ok(AppRequest::new(
        info,
        Value::Null,
        Value::Null,
        Vec::new(),
        buffer,
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// Capturing sender for buffer and dispatcher tests.
    #[derive(Default)]
    pub struct MockSender {
        pub sent: AsyncMutex<Vec<SendResponseMessage>>,
        pub stream_req_id: std::sync::Mutex<String>,
    }

    #[async_trait]
    impl ResponseSender for MockSender {
        async fn send_response(&self, msg: SendResponseMessage) -> Result<i32> {
            self.sent.lock().await.push(msg);
            Ok(0)
        }

        async fn start_stream(&self, msg: StartStreamMessage) -> Result<String> {
            let configured = self.stream_req_id.lock().unwrap().clone();
            if configured.is_empty() {
                Ok(msg.existing_req_id)
            } else {
                Ok(configured)
            }
        }
    }

    pub fn request_info(req_id: &str, app: &str, rtype: RequestType, path: &str) -> RequestInfo {
        RequestInfo {
            ts: now_ms(),
            acc_id: "acc-test".to_string(),
            zone_name: "default".to_string(),
            req_id: req_id.to_string(),
            request_type: rtype,
            app_name: app.to_string(),
            path: path.to_string(),
            path_frag: path_frag_of(path),
            fe_client_id: String::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn open_buffer(sender: Arc<MockSender>) -> Arc<ResponseBuffer> {
        let info = request_info("r1", "app", RequestType::Handler, "/sub");
        ResponseBuffer::new(&info, false, true, sender)
    }

    #[tokio::test]
    async fn test_append_and_done() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender.clone());
        buffer
            .append(RrActionKind::SetData {
                selector: "$.x".to_string(),
                data: serde_json::json!(42),
            })
            .unwrap();
        buffer.done().await.unwrap();

        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].response_done);
        assert_eq!(sent[0].actions.len(), 1);
        assert_eq!(sent[0].actions[0].action_type, "setdata");
        assert_eq!(sent[0].actions[0].selector, "$.x");
    }

    #[tokio::test]
    async fn test_append_after_done_rejected() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender);
        buffer.done().await.unwrap();
        let err = buffer
            .append(RrActionKind::Invalidate {
                selector: "$".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SdkError::Validate(_)));
    }

    #[tokio::test]
    async fn test_flush_after_done_rejected() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender);
        buffer.done().await.unwrap();
        assert!(buffer.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_done_is_idempotent() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender.clone());
        buffer.done().await.unwrap();
        buffer.done().await.unwrap();
        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1, "exactly one terminal frame on the wire");
    }

    #[tokio::test]
    async fn test_flush_clears_and_stays_open() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender.clone());
        buffer
            .append(RrActionKind::Invalidate {
                selector: "$.a".to_string(),
            })
            .unwrap();
        buffer.flush().await.unwrap();
        buffer.done().await.unwrap();

        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].response_done);
        assert_eq!(sent[0].actions.len(), 1);
        assert!(sent[1].response_done);
        // default auth is injected at done for root requests only; this
        // request has path "/sub" so the terminal frame is action-free
        assert!(sent[1].actions.is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let sender = Arc::new(MockSender::default());
        let buffer = open_buffer(sender.clone());
        for i in 0..10 {
            buffer
                .append(RrActionKind::SetData {
                    selector: format!("$.v{}", i),
                    data: serde_json::json!(i),
                })
                .unwrap();
        }
        buffer.done().await.unwrap();
        let sent = sender.sent.lock().await;
        let ts: Vec<i64> = sent[0].actions.iter().map(|a| a.ts).collect();
        for w in ts.windows(2) {
            assert!(w[1] >= w[0], "timestamps must be non-decreasing: {:?}", ts);
        }
    }

    #[tokio::test]
    async fn test_root_request_auth_injection() {
        let sender = Arc::new(MockSender::default());
        let info = request_info("r-root", "app", RequestType::Handler, "/");
        let buffer = ResponseBuffer::new(&info, false, true, sender.clone());
        buffer.done().await.unwrap();
        let sent = sender.sent.lock().await;
        assert_eq!(sent[0].actions.len(), 1);
        assert_eq!(sent[0].actions[0].action_type, "panelauth");
        let atom: AuthAtom = serde_json::from_str(&sent[0].actions[0].json_data).unwrap();
        assert_eq!(atom.auth_type, "noauth");
        assert_eq!(atom.role, "user");
        assert!(atom.auto);
        assert!(atom.ts > now_ms() + 23 * 60 * 60 * 1000);
    }

    #[tokio::test]
    async fn test_no_injection_when_auth_handled() {
        let sender = Arc::new(MockSender::default());
        let info = request_info("r-root", "app", RequestType::Handler, "/");
        let buffer = ResponseBuffer::new(&info, false, true, sender.clone());
        buffer.mark_auth_handled();
        buffer.done().await.unwrap();
        let sent = sender.sent.lock().await;
        assert!(sent[0].actions.is_empty());
    }

    #[tokio::test]
    async fn test_no_injection_when_disabled() {
        let sender = Arc::new(MockSender::default());
        let info = request_info("r-root", "app", RequestType::Handler, "/");
        let buffer = ResponseBuffer::new(&info, false, false, sender.clone());
        buffer.done().await.unwrap();
        let sent = sender.sent.lock().await;
        assert!(sent[0].actions.is_empty());
    }

    #[tokio::test]
    async fn test_stream_req_id_mismatch() {
        let sender = Arc::new(MockSender::default());
        *sender.stream_req_id.lock().unwrap() = "other-req".to_string();
        let err = start_stream_request(
            sender,
            "app",
            "req-1",
            StreamOpts {
                stream_id: "s1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SdkError::Validate(_)));
        assert!(!err.can_retry());
    }

    #[tokio::test]
    async fn test_bare_stream_requires_stream_id() {
        let sender = Arc::new(MockSender::default());
        let err = start_stream_request(sender, "app", "", StreamOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Validate(_)));
    }

    #[test]
    fn test_request_type_round_trip() {
        for rt in [
            RequestType::Handler,
            RequestType::Data,
            RequestType::Init,
            RequestType::Html,
            RequestType::Path,
            RequestType::Stream,
            RequestType::StreamClose,
        ] {
            assert_eq!(RequestType::from_wire(rt.as_wire()), Some(rt));
        }
        assert_eq!(RequestType::from_wire("bogus"), None);
    }

    #[test]
    fn test_is_root_request() {
        let root = request_info("r", "app", RequestType::Handler, "/");
        assert!(root.is_root_request());
        let sub = request_info("r", "app", RequestType::Handler, "/sub");
        assert!(!sub.is_root_request());
        let data = request_info("r", "app", RequestType::Data, "/");
        assert!(!data.is_root_request());
    }
}
