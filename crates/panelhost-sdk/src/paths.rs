// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Path grammar shared by the runtime registries and the filesystem surface.
//!
//! A path fragment is one segment: alphanumerics plus `-`, `_`, `.`, at most
//! 100 bytes, or one of the reserved fragments (`@init`, `@html`,
//! `@default`, `@app`, `@fs`). A full path is `/`-prefixed with every
//! segment a valid fragment.

const MAX_FRAG_LEN: usize = 100;
const MAX_PATH_LEN: usize = 512;

const RESERVED_FRAGS: &[&str] = &["@init", "@html", "@default", "@app", "@fs"];

/// Validate one path fragment (a handler name or path segment).
pub fn is_path_frag_valid(frag: &str) -> bool {
    if frag.is_empty() || frag.len() > MAX_FRAG_LEN {
        return false;
    }
    if RESERVED_FRAGS.contains(&frag) {
        return true;
    }
    frag.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Validate a full rooted path (`/seg1/seg2/...`). A bare `/` is valid.
pub fn is_full_path_valid(path: &str) -> bool {
    if path.is_empty() || path.len() > MAX_PATH_LEN || !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    path[1..].split('/').all(is_path_frag_valid)
}

/// Validate an app name. App names are single fragments without the
/// reserved forms.
pub fn is_app_name_valid(name: &str) -> bool {
    if name.starts_with('@') {
        return false;
    }
    is_path_frag_valid(name)
}

/// Path of an app's descriptor in the filesystem surface.
pub fn app_path_from_name(app_name: &str) -> String {
    format!("/@app/{}", app_name)
}

/// Console-side URL path for an app within a zone.
pub fn make_app_path(zone_name: &str, app_name: &str) -> String {
    format!("/zone/{}/{}", zone_name, app_name)
}
