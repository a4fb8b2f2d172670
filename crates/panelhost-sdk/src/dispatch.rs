// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Per-request dispatch: deadline enforcement, handler invocation, and the
//! terminal response.
//!
//! Each inbound frame is handled on its own task. Ordering between
//! concurrent requests is not promised; actions within one request are
//! delivered in append order. Handler failures never terminate the request
//! stream; they surface as a single `error` action on the request's own
//! response.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use panelhost_protocol::wire::{RequestMessage, SendResponseMessage};

use crate::error::SdkError;
use crate::request::{
    now_ms, path_frag_of, AppRequest, RequestInfo, RequestType, ResponseBuffer, ResponseSender,
    RrActionKind,
};
use crate::runtime::RuntimeRef;

/// Hard cap on a single request's deadline.
const MAX_TIMEOUT_MS: i64 = 60_000;

/// Clamp the server-supplied timeout: zero or out-of-range values fall back
/// to the 60 s cap.
fn effective_timeout(timeout_ms: i64) -> Duration {
    let ms = if timeout_ms <= 0 || timeout_ms > MAX_TIMEOUT_MS {
        MAX_TIMEOUT_MS
    } else {
        timeout_ms
    };
    Duration::from_millis(ms as u64)
}

/// Terminal response for a request targeting an unknown app. User code is
/// never invoked.
pub(crate) async fn send_no_app_response(sender: &Arc<dyn ResponseSender>, msg: &RequestMessage) {
    let resp = SendResponseMessage {
        ts: now_ms(),
        req_id: msg.req_id.clone(),
        request_type: msg.request_type.clone(),
        app_name: msg.app_name.clone(),
        fe_client_id: msg.fe_client_id.clone(),
        actions: Vec::new(),
        response_done: true,
        err: "No App Found".to_string(),
    };
    if let Err(e) = sender.send_response(resp).await {
        debug!(req_id = %msg.req_id, error = %e, "error sending no-app response");
    }
}

fn parse_json_field(field: &str, context: &str, req_id: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(field) {
        Ok(value) => value,
        Err(e) => {
            warn!(req_id = %req_id, context = %context, error = %e, "cannot decode request json");
            Value::Null
        }
    }
}

/// Dispatch one inbound request to `runtime` and issue exactly one terminal
/// response. `runtime == None` means the target app is not in the table.
pub(crate) async fn dispatch_request(
    runtime: Option<RuntimeRef>,
    sender: Arc<dyn ResponseSender>,
    msg: RequestMessage,
    no_default_auth: bool,
) {
    let runtime = match runtime {
        Some(runtime) => runtime,
        None => {
            send_no_app_response(&sender, &msg).await;
            return;
        }
    };

    let request_type = match RequestType::from_wire(&msg.request_type) {
        Some(RequestType::StreamClose) => {
            // stream bookkeeping frame, no response expected
            debug!(req_id = %msg.req_id, "stream close frame");
            return;
        }
        Some(rt) => rt,
        None => {
            warn!(req_id = %msg.req_id, request_type = %msg.request_type, "unknown request type");
            send_no_app_response(&sender, &msg).await;
            return;
        }
    };

    let timeout = effective_timeout(msg.timeout_ms);
    let info = RequestInfo {
        ts: msg.ts,
        acc_id: msg.acc_id.clone(),
        zone_name: msg.zone_name.clone(),
        req_id: msg.req_id.clone(),
        request_type,
        app_name: msg.app_name.clone(),
        path: msg.path.clone(),
        path_frag: path_frag_of(&msg.path),
        fe_client_id: msg.fe_client_id.clone(),
        timeout,
    };

    let data = parse_json_field(&msg.json_data, "data", &msg.req_id);
    let panel_state = parse_json_field(&msg.panel_state_data, "panelstate", &msg.req_id);
    let auth = if msg.auth_data_json.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&msg.auth_data_json).unwrap_or_default()
    };

    let authenticated = !auth.is_empty();
    let buffer = ResponseBuffer::new(&info, authenticated, !no_default_auth, sender);
    let req = AppRequest::new(info, data, panel_state, auth, buffer);

    match tokio::time::timeout(timeout, runtime.run_handler(req.clone())).await {
        Ok(Ok(Some(value))) => {
            // value-returning handlers deliver through an unselected setdata
            if let Err(e) = req.buffer().append(RrActionKind::SetData {
                selector: String::new(),
                data: value,
            }) {
                debug!(req_id = %req.req_id(), error = %e, "cannot append handler return value");
            }
        }
        Ok(Ok(None)) => {}
        Ok(Err(err)) => {
            debug!(req_id = %req.req_id(), error = %err, "handler returned error");
            let _ = req.buffer().append(RrActionKind::Error {
                message: err.to_string(),
            });
        }
        Err(_elapsed) => {
            debug!(req_id = %req.req_id(), timeout_ms = timeout.as_millis() as u64, "handler deadline exceeded");
            let _ = req.buffer().append(RrActionKind::Error {
                message: SdkError::Timeout.to_string(),
            });
        }
    }

    if let Err(e) = req.buffer().done().await {
        debug!(req_id = %req.req_id(), error = %e, "error sending handler response");
    }
}
