// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Optional process-global client.
//!
//! The core API is instance-passed; this is a convenience layer for
//! programs that run exactly one client.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::client::CloudClient;

static CLIENT: OnceCell<Arc<CloudClient>> = OnceCell::new();

/// Register the process-global client.
///
/// # Panics
///
/// Panics if called more than once.
pub fn set_global(client: Arc<CloudClient>) {
    if CLIENT.set(client).is_err() {
        panic!("global client already registered, set_global() may only be called once");
    }
}

/// The registered global client.
///
/// # Panics
///
/// Panics if no client has been registered.
pub fn global() -> &'static Arc<CloudClient> {
    CLIENT
        .get()
        .expect("no global client registered, call set_global() at startup")
}

/// The registered global client, `None` when unset.
pub fn try_global() -> Option<&'static Arc<CloudClient>> {
    CLIENT.get()
}
