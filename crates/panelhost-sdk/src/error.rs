// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! SDK error types.
//!
//! Errors carry a code from a closed set plus a retriable bit. The reconnect
//! loop consumes retriable errors; permanent errors latch the client's exit
//! error and shut it down; local errors are returned to the caller and do
//! not affect the connection.

use panelhost_protocol::wire::RtnStatus;
use panelhost_protocol::ClientError;
use thiserror::Error;

/// Closed set of error codes carried on the wire and in [`SdkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    None,
    NotConnected,
    Rpc,
    BadConnId,
    NoHandler,
    Limit,
    Validate,
    JsonMarshal,
    JsonUnmarshal,
    Timeout,
    Eof,
    NoFeStream,
}

impl ErrCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::NotConnected => "notconnected",
            Self::Rpc => "rpc",
            Self::BadConnId => "badconnid",
            Self::NoHandler => "nohandler",
            Self::Limit => "limit",
            Self::Validate => "validate",
            Self::JsonMarshal => "jsonmarshal",
            Self::JsonUnmarshal => "jsonunmarshal",
            Self::Timeout => "timeout",
            Self::Eof => "eof",
            Self::NoFeStream => "nofestream",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "notconnected" => Self::NotConnected,
            "rpc" => Self::Rpc,
            "badconnid" => Self::BadConnId,
            "nohandler" => Self::NoHandler,
            "limit" => Self::Limit,
            "validate" => Self::Validate,
            "jsonmarshal" => Self::JsonMarshal,
            "jsonunmarshal" => Self::JsonUnmarshal,
            "timeout" => Self::Timeout,
            "eof" => Self::Eof,
            "nofestream" => Self::NoFeStream,
            _ => Self::None,
        }
    }
}

/// SDK error. All payloads are plain strings so the latched exit error can be
/// cloned out to every `wait_for_shutdown` caller.
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    #[error("client is not connected")]
    NotConnected,

    #[error("rpc error in {call}: {message}")]
    Rpc {
        call: String,
        message: String,
        retriable: bool,
    },

    #[error("connection id rejected by console")]
    BadConnId,

    #[error("no handler found for {0}")]
    NoHandler(String),

    #[error("account limit exceeded: {message} ({limit_name}={limit_value})")]
    Limit {
        message: String,
        limit_name: String,
        limit_value: f64,
    },

    #[error("validation error: {0}")]
    Validate(String),

    #[error("json marshal error in {context}: {message}")]
    JsonMarshal { context: String, message: String },

    #[error("json unmarshal error in {context}: {message}")]
    JsonUnmarshal { context: String, message: String },

    #[error("request deadline exceeded")]
    Timeout,

    #[error("request stream ended")]
    Eof,

    #[error("no frontend stream attached")]
    NoFeStream,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown requested")]
    Shutdown,

    /// Non-OK status from the console with its original code string.
    #[error("{call} failed: [{code}] {message}")]
    Status {
        call: String,
        code: String,
        message: String,
        perm_err: bool,
    },
}

impl SdkError {
    pub fn code(&self) -> ErrCode {
        match self {
            Self::NotConnected => ErrCode::NotConnected,
            Self::Rpc { .. } => ErrCode::Rpc,
            Self::BadConnId => ErrCode::BadConnId,
            Self::NoHandler(_) => ErrCode::NoHandler,
            Self::Limit { .. } => ErrCode::Limit,
            Self::Validate(_) | Self::Config(_) => ErrCode::Validate,
            Self::JsonMarshal { .. } => ErrCode::JsonMarshal,
            Self::JsonUnmarshal { .. } => ErrCode::JsonUnmarshal,
            Self::Timeout => ErrCode::Timeout,
            Self::Eof => ErrCode::Eof,
            Self::NoFeStream => ErrCode::NoFeStream,
            Self::Shutdown => ErrCode::None,
            Self::Status { code, .. } => ErrCode::from_str(code),
        }
    }

    /// Whether the reconnect loop may retry after this error.
    pub fn can_retry(&self) -> bool {
        match self {
            Self::Rpc { retriable, .. } => *retriable,
            Self::BadConnId | Self::Eof => true,
            Self::Status { perm_err, .. } => !perm_err,
            _ => false,
        }
    }

    /// Build an error from a console status, `None` when the status is OK.
    pub fn from_status(call: &str, status: &RtnStatus) -> Option<SdkError> {
        if status.success {
            return None;
        }
        match ErrCode::from_str(&status.err_code) {
            ErrCode::BadConnId => Some(SdkError::BadConnId),
            _ => Some(SdkError::Status {
                call: call.to_string(),
                code: status.err_code.clone(),
                message: status.err.clone(),
                perm_err: status.perm_err,
            }),
        }
    }

    pub fn rpc(call: &str, err: impl std::fmt::Display) -> SdkError {
        SdkError::Rpc {
            call: call.to_string(),
            message: err.to_string(),
            retriable: true,
        }
    }

    pub fn json_marshal(context: &str, err: impl std::fmt::Display) -> SdkError {
        SdkError::JsonMarshal {
            context: context.to_string(),
            message: err.to_string(),
        }
    }

    pub fn json_unmarshal(context: &str, err: impl std::fmt::Display) -> SdkError {
        SdkError::JsonUnmarshal {
            context: context.to_string(),
            message: err.to_string(),
        }
    }

    pub fn limit(message: &str, limit_name: &str, limit_value: f64) -> SdkError {
        SdkError::Limit {
            message: message.to_string(),
            limit_name: limit_name.to_string(),
            limit_value,
        }
    }
}

impl From<ClientError> for SdkError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ErrorFrame { code, message } => SdkError::Status {
                call: "rpc".to_string(),
                code,
                message,
                perm_err: false,
            },
            ClientError::NotConnected => SdkError::NotConnected,
            other => SdkError::Rpc {
                call: "transport".to_string(),
                message: other.to_string(),
                retriable: true,
            },
        }
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Collapse accumulated registration errors into a single error.
pub fn convert_err_array(errs: &[SdkError]) -> Result<()> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs[0].clone()),
        n => {
            let joined = errs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(SdkError::Validate(format!("{} errors: {}", n, joined)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            ErrCode::NotConnected,
            ErrCode::Rpc,
            ErrCode::BadConnId,
            ErrCode::NoHandler,
            ErrCode::Limit,
            ErrCode::Validate,
            ErrCode::JsonMarshal,
            ErrCode::JsonUnmarshal,
            ErrCode::Timeout,
            ErrCode::Eof,
            ErrCode::NoFeStream,
        ] {
            assert_eq!(ErrCode::from_str(code.as_str()), code);
        }
    }

    #[test]
    fn test_retriable_classification() {
        assert!(SdkError::BadConnId.can_retry());
        assert!(SdkError::Eof.can_retry());
        assert!(SdkError::rpc("X", "boom").can_retry());
        assert!(!SdkError::Validate("bad".to_string()).can_retry());
        assert!(!SdkError::Config("bad".to_string()).can_retry());
        assert!(!SdkError::limit("blob too big", "BlobSizeLimitMB", 1.0).can_retry());
        assert!(!SdkError::Timeout.can_retry());
    }

    #[test]
    fn test_from_status_ok() {
        assert!(SdkError::from_status("X", &RtnStatus::ok()).is_none());
    }

    #[test]
    fn test_from_status_badconnid() {
        let status = RtnStatus {
            success: false,
            err: "Bad ConnId".to_string(),
            err_code: "badconnid".to_string(),
            perm_err: false,
        };
        let err = SdkError::from_status("RequestStream", &status).unwrap();
        assert_eq!(err.code(), ErrCode::BadConnId);
        assert!(err.can_retry());
    }

    #[test]
    fn test_from_status_permanent() {
        let status = RtnStatus {
            success: false,
            err: "account suspended".to_string(),
            err_code: "validate".to_string(),
            perm_err: true,
        };
        let err = SdkError::from_status("ConnectClient", &status).unwrap();
        assert!(!err.can_retry());
        assert_eq!(err.code(), ErrCode::Validate);
    }

    #[test]
    fn test_convert_err_array() {
        assert!(convert_err_array(&[]).is_ok());
        let one = convert_err_array(&[SdkError::Validate("a".to_string())]);
        assert!(matches!(one, Err(SdkError::Validate(_))));
        let two = convert_err_array(&[
            SdkError::Validate("a".to_string()),
            SdkError::Validate("b".to_string()),
        ]);
        let msg = two.unwrap_err().to_string();
        assert!(msg.contains("2 errors"));
    }
}
