// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! RPC message types for the console wire protocol.
//!
//! Every call is wrapped in an [`RpcRequest`] envelope whose `conn_id` and
//! `client_version` fields accompany each message, and answered with an
//! [`RpcResponse`]. Responses carry a [`RtnStatus`] so the console can report
//! call-level failures (including `badconnid`) without tearing down the
//! transport.

use std::collections::HashMap;

/// Call-level status attached to every response (and to in-stream request
/// frames when the console terminates the stream).
#[derive(Clone, PartialEq, prost::Message)]
pub struct RtnStatus {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub err: String,
    /// Error code string, one of the closed set in `panelhost-sdk`.
    #[prost(string, tag = "3")]
    pub err_code: String,
    /// Set when the failure is permanent and the client must not retry.
    #[prost(bool, tag = "4")]
    pub perm_err: bool,
}

impl RtnStatus {
    pub fn ok() -> Self {
        RtnStatus {
            success: true,
            err: String::new(),
            err_code: String::new(),
            perm_err: false,
        }
    }
}

/// Account record returned on every successful connect.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AccInfo {
    /// "anon" or "registered"
    #[prost(string, tag = "1")]
    pub acc_type: String,
    /// Optional vanity host for account links.
    #[prost(string, tag = "2")]
    pub acc_cname: String,
    #[prost(bool, tag = "3")]
    pub new_account: bool,
    #[prost(double, tag = "4")]
    pub blob_size_limit_mb: f64,
    #[prost(double, tag = "5")]
    pub html_size_limit_mb: f64,
    #[prost(bool, tag = "6")]
    pub acc_jwt_enabled: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectClientMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub proc_run_id: String,
    #[prost(string, tag = "3")]
    pub acc_id: String,
    #[prost(string, tag = "4")]
    pub zone_name: String,
    #[prost(bool, tag = "5")]
    pub anon_acc: bool,
    #[prost(string, tag = "6")]
    pub proc_name: String,
    #[prost(map = "string, string", tag = "7")]
    pub proc_tags: HashMap<String, String>,
    #[prost(map = "string, string", tag = "8")]
    pub host_data: HashMap<String, String>,
    #[prost(int64, tag = "9")]
    pub start_ts: i64,
    /// App names to rebind server-side on reconnect.
    #[prost(string, repeated, tag = "10")]
    pub reconnect_app_runtimes: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectClientResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(string, tag = "2")]
    pub conn_id: String,
    #[prost(message, optional, tag = "3")]
    pub acc_info: Option<AccInfo>,
    #[prost(string, repeated, tag = "4")]
    pub reconnect_errs: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestStreamMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
}

/// One inbound end-user request, delivered as a stream frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub acc_id: String,
    #[prost(string, tag = "3")]
    pub zone_name: String,
    #[prost(string, tag = "4")]
    pub req_id: String,
    /// "handler", "data", "init", "html", "path", "streamclose"
    #[prost(string, tag = "5")]
    pub request_type: String,
    #[prost(string, tag = "6")]
    pub app_name: String,
    #[prost(string, tag = "7")]
    pub path: String,
    #[prost(string, tag = "8")]
    pub fe_client_id: String,
    #[prost(string, tag = "9")]
    pub json_data: String,
    #[prost(string, tag = "10")]
    pub auth_data_json: String,
    #[prost(string, tag = "11")]
    pub panel_state_data: String,
    #[prost(int64, tag = "12")]
    pub timeout_ms: i64,
    /// Non-OK status terminates the stream (e.g. badconnid).
    #[prost(message, optional, tag = "13")]
    pub status: Option<RtnStatus>,
}

/// One display-update action inside a response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RrAction {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    /// "setdata", "invalidate", "html", "event", "panelauth",
    /// "panelauthchallenge", "error"
    #[prost(string, tag = "2")]
    pub action_type: String,
    #[prost(string, tag = "3")]
    pub selector: String,
    #[prost(string, tag = "4")]
    pub json_data: String,
    #[prost(string, tag = "5")]
    pub html: String,
    #[prost(string, tag = "6")]
    pub event_type: String,
    #[prost(string, tag = "7")]
    pub err: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendResponseMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub req_id: String,
    #[prost(string, tag = "3")]
    pub request_type: String,
    #[prost(string, tag = "4")]
    pub app_name: String,
    #[prost(string, tag = "5")]
    pub fe_client_id: String,
    #[prost(message, repeated, tag = "6")]
    pub actions: Vec<RrAction>,
    #[prost(bool, tag = "7")]
    pub response_done: bool,
    #[prost(string, tag = "8")]
    pub err: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendResponseResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(int32, tag = "2")]
    pub num_stream_clients: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetBlobMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
    #[prost(string, tag = "3")]
    pub app_version: String,
    #[prost(string, tag = "4")]
    pub blob_data_json: String,
    #[prost(bytes = "vec", tag = "5")]
    pub blob_bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetBlobResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetPathMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub file_opts_json: String,
    #[prost(bool, tag = "4")]
    pub has_body: bool,
    #[prost(bytes = "vec", tag = "5")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetPathResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemovePathMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemovePathResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FileInfoMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub dir_opts_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FileInfoResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    /// JSON array of file info records.
    #[prost(string, tag = "2")]
    pub file_info_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteAppMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
    #[prost(string, tag = "3")]
    pub app_config_json: String,
    #[prost(bool, tag = "4")]
    pub connect_app: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteAppResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(map = "string, string", tag = "2")]
    pub option_warnings: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveAppMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveAppResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenAppMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenAppResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(string, tag = "2")]
    pub app_config_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReflectZoneMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReflectZoneResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(string, tag = "2")]
    pub json_data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CallDataHandlerMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
    #[prost(string, tag = "3")]
    pub path: String,
    #[prost(string, tag = "4")]
    pub json_data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CallDataHandlerResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(string, tag = "2")]
    pub json_data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackendPushMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
    #[prost(string, tag = "3")]
    pub path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackendPushResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartStreamMessage {
    #[prost(int64, tag = "1")]
    pub ts: i64,
    #[prost(string, tag = "2")]
    pub app_name: String,
    /// Request id to rebind onto the stream, empty for a bare stream.
    #[prost(string, tag = "3")]
    pub existing_req_id: String,
    #[prost(string, tag = "4")]
    pub stream_id: String,
    #[prost(string, tag = "5")]
    pub control_path: String,
    #[prost(bool, tag = "6")]
    pub no_server_cancel: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartStreamResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
    #[prost(string, tag = "2")]
    pub req_id: String,
}

/// Payload of an `Error` frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RtnStatus>,
}

/// Request envelope. `conn_id` and `client_version` ride along on every
/// outbound call as the ambient connection metadata.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub conn_id: String,
    #[prost(string, tag = "2")]
    pub client_version: String,
    #[prost(
        oneof = "rpc_request::Request",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23"
    )]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "10")]
        ConnectClient(super::ConnectClientMessage),
        #[prost(message, tag = "11")]
        RequestStream(super::RequestStreamMessage),
        #[prost(message, tag = "12")]
        SendResponse(super::SendResponseMessage),
        #[prost(message, tag = "13")]
        SetBlob(super::SetBlobMessage),
        #[prost(message, tag = "14")]
        SetPath(super::SetPathMessage),
        #[prost(message, tag = "15")]
        RemovePath(super::RemovePathMessage),
        #[prost(message, tag = "16")]
        FileInfo(super::FileInfoMessage),
        #[prost(message, tag = "17")]
        WriteApp(super::WriteAppMessage),
        #[prost(message, tag = "18")]
        RemoveApp(super::RemoveAppMessage),
        #[prost(message, tag = "19")]
        OpenApp(super::OpenAppMessage),
        #[prost(message, tag = "20")]
        ReflectZone(super::ReflectZoneMessage),
        #[prost(message, tag = "21")]
        CallDataHandler(super::CallDataHandlerMessage),
        #[prost(message, tag = "22")]
        BackendPush(super::BackendPushMessage),
        #[prost(message, tag = "23")]
        StartStream(super::StartStreamMessage),
    }
}

/// Response envelope for unary calls.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcResponse {
    #[prost(
        oneof = "rpc_response::Response",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23"
    )]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "10")]
        ConnectClient(super::ConnectClientResponse),
        #[prost(message, tag = "11")]
        SendResponse(super::SendResponseResponse),
        #[prost(message, tag = "12")]
        SetBlob(super::SetBlobResponse),
        #[prost(message, tag = "13")]
        SetPath(super::SetPathResponse),
        #[prost(message, tag = "14")]
        RemovePath(super::RemovePathResponse),
        #[prost(message, tag = "15")]
        FileInfo(super::FileInfoResponse),
        #[prost(message, tag = "16")]
        WriteApp(super::WriteAppResponse),
        #[prost(message, tag = "17")]
        RemoveApp(super::RemoveAppResponse),
        #[prost(message, tag = "18")]
        OpenApp(super::OpenAppResponse),
        #[prost(message, tag = "19")]
        ReflectZone(super::ReflectZoneResponse),
        #[prost(message, tag = "20")]
        CallDataHandler(super::CallDataHandlerResponse),
        #[prost(message, tag = "21")]
        BackendPush(super::BackendPushResponse),
        #[prost(message, tag = "22")]
        StartStream(super::StartStreamResponse),
        #[prost(message, tag = "23")]
        Error(super::ErrorResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_rpc_request_round_trip() {
        let msg = RpcRequest {
            conn_id: "c-1".to_string(),
            client_version: "rust-0.4.0".to_string(),
            request: Some(rpc_request::Request::ConnectClient(ConnectClientMessage {
                ts: 42,
                proc_run_id: "p-1".to_string(),
                acc_id: "acc-1".to_string(),
                zone_name: "default".to_string(),
                anon_acc: true,
                proc_name: "demo".to_string(),
                proc_tags: HashMap::new(),
                host_data: HashMap::new(),
                start_ts: 41,
                reconnect_app_runtimes: vec!["a".to_string()],
            })),
        };
        let bytes = msg.encode_to_vec();
        let decoded = RpcRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_rpc_response_round_trip() {
        let msg = RpcResponse {
            response: Some(rpc_response::Response::ConnectClient(
                ConnectClientResponse {
                    status: Some(RtnStatus::ok()),
                    conn_id: "c-2".to_string(),
                    acc_info: Some(AccInfo {
                        acc_type: "anon".to_string(),
                        acc_cname: String::new(),
                        new_account: false,
                        blob_size_limit_mb: 1.0,
                        html_size_limit_mb: 1.0,
                        acc_jwt_enabled: false,
                    }),
                    reconnect_errs: vec![],
                },
            )),
        };
        let bytes = msg.encode_to_vec();
        let decoded = RpcResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_request_message_status_passthrough() {
        let msg = RequestMessage {
            status: Some(RtnStatus {
                success: false,
                err: "Bad ConnId".to_string(),
                err_code: "badconnid".to_string(),
                perm_err: false,
            }),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        let decoded = RequestMessage::decode(bytes.as_slice()).unwrap();
        let status = decoded.status.unwrap();
        assert!(!status.success);
        assert_eq!(status.err_code, "badconnid");
    }
}
