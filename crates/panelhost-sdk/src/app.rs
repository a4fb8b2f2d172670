// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! App descriptors: named handler trees plus options, static seed data, and
//! blob attachments.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, SdkError};
use crate::paths;
use crate::request::{now_ms, AppRequest};
use crate::runtime::AppRuntime;

pub const OPTION_INIT_HANDLER: &str = "inithandler";
pub const OPTION_HTML: &str = "html";
pub const OPTION_AUTH: &str = "auth";
pub const OPTION_OFFLINE_MODE: &str = "offlinemode";
pub const OPTION_TITLE: &str = "title";
pub const OPTION_VISIBILITY: &str = "visibility";

pub const AUTH_TYPE_ZONE: &str = "zone";

pub const VIS_TYPE_HIDDEN: &str = "hidden";
pub const VIS_TYPE_DEFAULT: &str = "default";
pub const VIS_TYPE_VISIBLE: &str = "visible";

pub const HTML_TYPE_STATIC: &str = "static";
pub const HTML_TYPE_DYNAMIC: &str = "dynamic";
pub const HTML_TYPE_DYNAMIC_WHEN_CONNECTED: &str = "dynamic-when-connected";

pub(crate) const ROOT_HTML_KEY: &str = "html:root";
pub(crate) const HTML_MIME_TYPE: &str = "text/html";

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// Superset of all option fields, as marshaled into the app descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppOption {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub opt_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(
        rename = "allowedroles",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enabled: bool,
    #[serde(rename = "apptitle", default, skip_serializing_if = "String::is_empty")]
    pub app_title: String,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub order: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDataVal {
    pub path: String,
    pub data: Value,
}

/// App descriptor, marshaled as JSON into the console's app table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "appname")]
    pub app_name: String,
    /// Freshly minted per publication.
    #[serde(rename = "appversion", default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    /// Set by the console.
    #[serde(rename = "updatedts", default)]
    pub updated_ts: i64,
    #[serde(rename = "procrunid", default, skip_serializing_if = "String::is_empty")]
    pub proc_run_id: String,
    #[serde(
        rename = "clientversion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub client_version: String,
    #[serde(default)]
    pub options: HashMap<String, AppOption>,
    #[serde(rename = "staticdata", default, skip_serializing_if = "Vec::is_empty")]
    pub static_data: Vec<StaticDataVal>,
    #[serde(
        rename = "clearexistingdata",
        default,
        skip_serializing_if = "is_false"
    )]
    pub clear_existing_data: bool,
    #[serde(
        rename = "clearexistingblobs",
        default,
        skip_serializing_if = "is_false"
    )]
    pub clear_existing_blobs: bool,
}

impl AppConfig {
    pub fn allowed_roles(&self) -> Vec<String> {
        self.options
            .get(OPTION_AUTH)
            .map(|opt| opt.allowed_roles.clone())
            .unwrap_or_else(|| vec!["user".to_string()])
    }
}

/// Immutable bytes published alongside an app version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobData {
    #[serde(rename = "blobkey")]
    pub blob_key: String,
    #[serde(rename = "mimetype")]
    pub mime_type: String,
    pub size: i64,
    pub sha256: String,
    #[serde(rename = "updatets", default)]
    pub update_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub removed: bool,
}

/// base64(SHA-256) of the given bytes.
pub(crate) fn sha256_base64(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

impl BlobData {
    /// Build blob metadata from in-memory bytes. The digest and size always
    /// reflect the exact bytes passed; read failures upstream must be
    /// propagated, never mapped to an empty blob.
    pub fn from_bytes(key: &str, mime_type: &str, bytes: &[u8]) -> BlobData {
        BlobData {
            blob_key: key.to_string(),
            mime_type: mime_type.to_string(),
            size: bytes.len() as i64,
            sha256: sha256_base64(bytes),
            update_ts: now_ms(),
            metadata: None,
            removed: false,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> BlobData {
        self.metadata = Some(metadata);
        self
    }
}

/// A value served at runtime: fixed bytes or a producer invoked per request.
/// The producer returns the bytes plus a freshness token; consumers decide
/// caching policy.
#[derive(Clone)]
pub enum RuntimeValue {
    Static(Bytes),
    Dynamic(Arc<dyn Fn() -> Result<(Bytes, String)> + Send + Sync>),
}

impl RuntimeValue {
    pub fn from_string(val: impl Into<String>) -> RuntimeValue {
        RuntimeValue::Static(Bytes::from(val.into()))
    }

    /// File-backed dynamic value; the freshness token is the file mtime.
    pub fn from_file(file_name: impl Into<String>) -> RuntimeValue {
        let file_name = file_name.into();
        RuntimeValue::Dynamic(Arc::new(move || {
            let bytes = std::fs::read(&file_name)
                .map_err(|e| SdkError::Validate(format!("cannot read {}: {}", file_name, e)))?;
            let freshness = std::fs::metadata(&file_name)
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis().to_string())
                .unwrap_or_default();
            Ok((Bytes::from(bytes), freshness))
        }))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, RuntimeValue::Dynamic(_))
    }

    pub fn get(&self) -> Result<(Bytes, String)> {
        match self {
            RuntimeValue::Static(bytes) => Ok((bytes.clone(), String::new())),
            RuntimeValue::Dynamic(producer) => producer(),
        }
    }
}

fn default_auth_opt() -> AppOption {
    AppOption {
        opt_type: AUTH_TYPE_ZONE.to_string(),
        allowed_roles: vec!["user".to_string()],
        ..Default::default()
    }
}

/// A named collection of handlers plus its options and static seed data.
pub struct App {
    pub config: AppConfig,
    runtime: Arc<AppRuntime>,
    /// Blobs queued for upload with the next `write_app`.
    pending_blobs: Vec<(BlobData, Bytes)>,
    is_new: bool,
}

impl App {
    /// New app with a fresh version token and the default options
    /// (zone auth for role `user`, offline mode allowed).
    pub fn new(app_name: &str) -> App {
        let mut options = HashMap::new();
        options.insert(OPTION_AUTH.to_string(), default_auth_opt());
        options.insert(
            OPTION_OFFLINE_MODE.to_string(),
            AppOption {
                opt_type: "allow".to_string(),
                ..Default::default()
            },
        );
        App {
            config: AppConfig {
                app_name: app_name.to_string(),
                app_version: uuid::Uuid::new_v4().to_string(),
                updated_ts: 0,
                proc_run_id: String::new(),
                client_version: String::new(),
                options,
                static_data: Vec::new(),
                clear_existing_data: false,
                clear_existing_blobs: false,
            },
            runtime: Arc::new(AppRuntime::new()),
            pending_blobs: Vec::new(),
            is_new: true,
        }
    }

    /// Rehydrate an app from a console-held descriptor, minting a new
    /// version for the next publication.
    pub fn from_config(mut config: AppConfig) -> App {
        config.app_version = uuid::Uuid::new_v4().to_string();
        App {
            config,
            runtime: Arc::new(AppRuntime::new()),
            pending_blobs: Vec::new(),
            is_new: false,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn runtime(&self) -> &Arc<AppRuntime> {
        &self.runtime
    }

    /// Descriptor path in the filesystem surface.
    pub fn app_path(&self) -> String {
        paths::app_path_from_name(&self.config.app_name)
    }

    /// Validated descriptor for publication.
    pub fn app_config(&self) -> Result<AppConfig> {
        if !paths::is_app_name_valid(&self.config.app_name) {
            return Err(SdkError::Validate(format!(
                "invalid app name '{}'",
                self.config.app_name
            )));
        }
        self.runtime.err()?;
        Ok(self.config.clone())
    }

    pub(crate) fn pending_blobs(&self) -> &[(BlobData, Bytes)] {
        &self.pending_blobs
    }

    pub(crate) fn clear_pending_blobs(&mut self) {
        self.pending_blobs.clear();
    }

    // -- options --

    pub fn set_option(&mut self, name: &str, opt: AppOption) {
        self.config.options.insert(name.to_string(), opt);
    }

    pub fn remove_option(&mut self, name: &str) {
        self.config.options.remove(name);
    }

    fn auth_opt(&self) -> AppOption {
        self.config
            .options
            .get(OPTION_AUTH)
            .cloned()
            .unwrap_or_else(default_auth_opt)
    }

    pub fn set_auth_type(&mut self, auth_type: &str) {
        let mut opt = self.auth_opt();
        opt.opt_type = auth_type.to_string();
        self.set_option(OPTION_AUTH, opt);
    }

    pub fn set_allowed_roles(&mut self, roles: &[&str]) {
        let mut opt = self.auth_opt();
        opt.allowed_roles = roles.iter().map(|r| r.to_string()).collect();
        self.set_option(OPTION_AUTH, opt);
    }

    pub fn set_offline_mode(&mut self, allow: bool) {
        if allow {
            self.set_option(
                OPTION_OFFLINE_MODE,
                AppOption {
                    opt_type: "allow".to_string(),
                    ..Default::default()
                },
            );
        } else {
            self.remove_option(OPTION_OFFLINE_MODE);
        }
    }

    /// Controls whether the app shows in the console's app switcher. Apps
    /// sort by display order, then title; order 0 sorts to the end.
    pub fn set_visibility(&mut self, vis_type: &str, display_order: f64) {
        self.set_option(
            OPTION_VISIBILITY,
            AppOption {
                opt_type: vis_type.to_string(),
                order: display_order,
                ..Default::default()
            },
        );
    }

    pub fn set_title(&mut self, title: &str) {
        if title.is_empty() {
            self.remove_option(OPTION_TITLE);
        } else {
            self.set_option(
                OPTION_TITLE,
                AppOption {
                    app_title: title.to_string(),
                    ..Default::default()
                },
            );
        }
    }

    pub fn clear_existing_data(&mut self) {
        self.config.clear_existing_data = true;
    }

    pub fn clear_existing_blobs(&mut self) {
        self.config.clear_existing_blobs = true;
    }

    /// Seed data applied when the app loads, in order.
    pub fn set_static_data(&mut self, path: &str, data: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(data)
            .map_err(|e| SdkError::json_marshal("StaticData", e))?;
        self.config.static_data.push(StaticDataVal {
            path: path.to_string(),
            data: value,
        });
        Ok(())
    }

    // -- html --

    /// Static root HTML, uploaded as a blob with the next publication.
    pub fn set_html(&mut self, html: impl Into<String>) {
        let bytes = Bytes::from(html.into());
        let blob = BlobData::from_bytes(ROOT_HTML_KEY, HTML_MIME_TYPE, &bytes);
        self.pending_blobs.push((blob, bytes));
        self.set_option(
            OPTION_HTML,
            AppOption {
                opt_type: HTML_TYPE_STATIC.to_string(),
                ..Default::default()
            },
        );
    }

    /// File-backed root HTML: a snapshot is uploaded for offline use and the
    /// html handler re-reads the file while this process is connected.
    pub fn set_html_from_file(&mut self, file_name: &str) -> Result<()> {
        let value = RuntimeValue::from_file(file_name);
        let (bytes, _) = value.get()?;
        let blob = BlobData::from_bytes(ROOT_HTML_KEY, HTML_MIME_TYPE, &bytes);
        self.pending_blobs.push((blob, bytes));
        self.runtime.set_html_handler(html_value_handler(value));
        self.set_option(
            OPTION_HTML,
            AppOption {
                opt_type: HTML_TYPE_DYNAMIC_WHEN_CONNECTED.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Blob published with the next `write_app`.
    pub fn set_blob(&mut self, blob: BlobData, bytes: Bytes) {
        self.pending_blobs.push((blob, bytes));
    }

    /// Read a file and queue it as a blob.
    pub fn set_blob_from_file(
        &mut self,
        key: &str,
        mime_type: &str,
        file_name: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let bytes = std::fs::read(file_name)
            .map_err(|e| SdkError::Validate(format!("cannot read {}: {}", file_name, e)))?;
        let bytes = Bytes::from(bytes);
        let mut blob = BlobData::from_bytes(key, mime_type, &bytes);
        blob.metadata = metadata;
        self.pending_blobs.push((blob, bytes));
        Ok(())
    }

    // -- handler registration --

    pub fn handler<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime.handler(path, f);
    }

    pub fn data_handler<F, Fut>(&self, path: &str, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.runtime.data_handler(path, f);
    }

    pub fn json_handler<T, F, Fut>(&self, path: &str, f: F)
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(AppRequest, T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.runtime.json_handler(path, f);
    }

    /// Register the init handler and advertise it in the app options.
    pub fn init_handler<F, Fut>(&mut self, f: F)
    where
        F: Fn(AppRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.set_option(
            OPTION_INIT_HANDLER,
            AppOption {
                opt_type: "handler".to_string(),
                ..Default::default()
            },
        );
        self.runtime.init_handler(f);
    }

    /// Deferred validation check for builder-style registration.
    pub fn err(&self) -> Result<()> {
        self.runtime.err()
    }
}

fn html_value_handler(value: RuntimeValue) -> crate::runtime::HandlerFn {
    use futures::FutureExt;
    Arc::new(move |req: AppRequest| {
        let value = value.clone();
        async move {
            let (bytes, _freshness) = value.get()?;
            let html = String::from_utf8(bytes.to_vec())
                .map_err(|e| SdkError::Validate(format!("html is not valid utf-8: {}", e)))?;
            req.set_html(html)?;
            Ok(None)
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_app_defaults() {
        let app = App::new("dashboard");
        assert!(app.is_new());
        assert!(!app.config.app_version.is_empty());
        let auth = app.config.options.get(OPTION_AUTH).unwrap();
        assert_eq!(auth.opt_type, AUTH_TYPE_ZONE);
        assert_eq!(auth.allowed_roles, vec!["user".to_string()]);
        assert!(app.config.options.contains_key(OPTION_OFFLINE_MODE));
    }

    #[test]
    fn test_versions_unique_per_publication() {
        let a = App::new("a");
        let b = App::new("a");
        assert_ne!(a.config.app_version, b.config.app_version);

        let reopened = App::from_config(a.config.clone());
        assert_ne!(reopened.config.app_version, a.config.app_version);
        assert!(!reopened.is_new());
    }

    #[test]
    fn test_option_setters() {
        let mut app = App::new("a");
        app.set_title("My App");
        app.set_visibility(VIS_TYPE_VISIBLE, 2.0);
        app.set_allowed_roles(&["admin", "user"]);
        app.set_offline_mode(false);

        assert_eq!(
            app.config.options.get(OPTION_TITLE).unwrap().app_title,
            "My App"
        );
        let vis = app.config.options.get(OPTION_VISIBILITY).unwrap();
        assert_eq!(vis.opt_type, VIS_TYPE_VISIBLE);
        assert_eq!(vis.order, 2.0);
        assert_eq!(
            app.config.options.get(OPTION_AUTH).unwrap().allowed_roles,
            vec!["admin".to_string(), "user".to_string()]
        );
        assert!(!app.config.options.contains_key(OPTION_OFFLINE_MODE));

        app.set_title("");
        assert!(!app.config.options.contains_key(OPTION_TITLE));
    }

    #[test]
    fn test_static_data_ordered() {
        let mut app = App::new("a");
        app.set_static_data("$.first", 1).unwrap();
        app.set_static_data("$.second", 2).unwrap();
        assert_eq!(app.config.static_data.len(), 2);
        assert_eq!(app.config.static_data[0].path, "$.first");
        assert_eq!(app.config.static_data[1].path, "$.second");
    }

    #[test]
    fn test_set_html_queues_blob() {
        let mut app = App::new("a");
        app.set_html("<html><body>hi</body></html>");
        assert_eq!(app.pending_blobs().len(), 1);
        let (blob, bytes) = &app.pending_blobs()[0];
        assert_eq!(blob.blob_key, ROOT_HTML_KEY);
        assert_eq!(blob.mime_type, HTML_MIME_TYPE);
        assert_eq!(blob.size, bytes.len() as i64);
        assert_eq!(
            app.config.options.get(OPTION_HTML).unwrap().opt_type,
            HTML_TYPE_STATIC
        );
    }

    #[test]
    fn test_blob_digest() {
        // base64(sha256("hello world"))
        let blob = BlobData::from_bytes("k", "text/plain", b"hello world");
        assert_eq!(blob.sha256, "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=");
        assert_eq!(blob.size, 11);
    }

    #[test]
    fn test_invalid_app_name_rejected() {
        let app = App::new("bad name");
        assert!(matches!(app.app_config(), Err(SdkError::Validate(_))));
    }

    #[test]
    fn test_runtime_value_static() {
        let v = RuntimeValue::from_string("hello");
        assert!(!v.is_dynamic());
        let (bytes, freshness) = v.get().unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert!(freshness.is_empty());
    }

    #[test]
    fn test_runtime_value_dynamic_missing_file() {
        let v = RuntimeValue::from_file("/definitely/not/a/file");
        assert!(v.is_dynamic());
        assert!(v.get().is_err());
    }

    #[test]
    fn test_app_config_json_field_names() {
        let app = App::new("demo");
        let json = serde_json::to_value(app.app_config().unwrap()).unwrap();
        assert_eq!(json["appname"], "demo");
        assert!(json.get("appversion").is_some());
        assert!(json["options"].get(OPTION_AUTH).is_some());
    }
}
