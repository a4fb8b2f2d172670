// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Panelhost protocol - QUIC + Protobuf wire layer for the console service.
//!
//! This crate provides the transport used by `panelhost-sdk` to talk to the
//! remote console:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    panelhost-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC layer: unary calls + server-streaming request channel  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), mutual TLS pinned to 1.3 / P-384  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every RPC rides in an [`wire::RpcRequest`] envelope carrying the current
//! connection id and the client version string. Each call opens one
//! bidirectional QUIC stream; unary calls read a single `Reply` frame,
//! while the request stream reads `Push` frames until the console closes
//! it. Console faults are decoded at the codec layer (see
//! [`frame::Inbound`]).

pub mod client;
pub mod frame;
pub mod wire;

pub use client::{ChannelState, ClientError, ConsoleClient, ConsoleClientConfig, ServerStream};
pub use frame::{FrameError, FrameHeader, FrameKind, FrameReader, FrameWriter, Inbound};
