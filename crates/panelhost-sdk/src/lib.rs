// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Panelhost SDK - publish interactive apps to the Panelhost console
//! service.
//!
//! A user process registers apps (named handler trees plus static assets)
//! with a remote console over a persistent mutual-TLS RPC channel. The
//! console forwards end-user requests to this process; the SDK dispatches
//! them to the registered handlers and streams display-update actions back.
//!
//! # Quick start
//!
//! ```ignore
//! use panelhost_sdk::{App, CloudClient, Config};
//!
//! #[tokio::main]
//! async fn main() -> panelhost_sdk::Result<()> {
//!     let config = Config::new()
//!         .with_anon_acc(true)
//!         .with_auto_keygen(true);
//!     let client = CloudClient::start(config).await?;
//!
//!     let mut app = App::new("hello");
//!     app.set_html("<panel><h1>hello world</h1></panel>");
//!     app.handler("/", |req| async move {
//!         req.set_data("$.greeting", "hi there")?;
//!         Ok(())
//!     });
//!     app.err()?;
//!     client.write_and_connect_app(&mut app).await?;
//!
//!     client.wait_for_shutdown().await
//! }
//! ```
//!
//! # Architecture
//!
//! - [`CloudClient`] owns the transport, negotiates the connection identity,
//!   and runs the reconnect loop and request dispatcher.
//! - [`App`] / [`runtime::AppRuntime`] hold the handler table and middleware
//!   chain for one app; [`runtime::LinkRuntime`] is the standalone flavour
//!   bound to filesystem paths.
//! - [`request::AppRequest`] is the handler's view of one request; its
//!   response buffer accumulates actions until `flush`/`done`.
//! - [`fs::FsClient`] exposes the virtual filesystem surface.
//!
//! Handlers are async and narrow (`fn(AppRequest) -> Result<Option<Value>>`)
//! with adapter constructors for the common shapes; see [`runtime`].

pub mod app;
pub mod backoff;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod global;
pub mod jwt;
pub mod keygen;
pub mod paths;
pub mod request;
pub mod runtime;

pub use app::{App, AppConfig, AppOption, BlobData, RuntimeValue};
pub use client::{CloudClient, ReflectApp, ReflectZone};
pub use config::{Config, CLIENT_VERSION};
pub use error::{ErrCode, Result, SdkError};
pub use fs::{DirOpts, FileInfo, FileOpts, FsClient};
pub use global::{global, set_global, try_global};
pub use jwt::JwtOpts;
pub use request::{AppRequest, AuthAtom, RequestInfo, RequestType, StreamOpts};
pub use runtime::{AppRuntime, HandlerFn, LinkRuntime, Middleware, MiddlewareFn, NextFn};

// Re-export the account record used in `CloudClient::acc_info`.
pub use panelhost_protocol::wire::AccInfo;
