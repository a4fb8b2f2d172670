// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Virtual filesystem surface: a rooted path space of static blobs, JSON
//! documents, and runtime-linked handlers, backed by unary RPCs.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::app::sha256_base64;
use crate::client::CloudClient;
use crate::error::{Result, SdkError};
use crate::jwt::JwtOpts;
use crate::paths;
use crate::runtime::{AppRuntime, LinkRuntime, RuntimeRef};

pub const MIME_TYPE_HTML: &str = "text/html";
pub const MIME_TYPE_JSON: &str = "application/json";
pub const MIME_TYPE_APP: &str = "application/x-panelhost+json";

pub const FILE_TYPE_STATIC: &str = "static";
pub const FILE_TYPE_RUNTIME_LINK: &str = "rt-link";
pub const FILE_TYPE_APP_RUNTIME_LINK: &str = "rt-app-link";
pub const FILE_TYPE_DIR: &str = "dir";
pub const FILE_TYPE_APP: &str = "app";

const METADATA_JSON_MAX: usize = 10_000;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Options attached to a path write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOpts {
    #[serde(rename = "filetype", default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub size: i64,
    #[serde(rename = "mimetype", default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(
        rename = "allowedroles",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_roles: Vec<String>,
    #[serde(rename = "editroles", default, skip_serializing_if = "Vec::is_empty")]
    pub edit_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display: String,
    #[serde(rename = "metadata", default, skip_serializing_if = "String::is_empty")]
    pub metadata_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "nomkdirs", default, skip_serializing_if = "is_false")]
    pub no_mkdirs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(rename = "appconfig", default, skip_serializing_if = "String::is_empty")]
    pub app_config_json: String,
}

impl FileOpts {
    pub fn mime_type(mime_type: &str) -> FileOpts {
        FileOpts {
            mime_type: mime_type.to_string(),
            ..Default::default()
        }
    }

    pub fn is_link_type(&self) -> bool {
        self.file_type == FILE_TYPE_RUNTIME_LINK || self.file_type == FILE_TYPE_APP_RUNTIME_LINK
    }

    pub fn set_metadata(&mut self, obj: impl Serialize) -> Result<()> {
        let json = serde_json::to_string(&obj)
            .map_err(|e| SdkError::json_marshal("FileOpts metadata", e))?;
        if json.len() > METADATA_JSON_MAX {
            return Err(SdkError::Validate("metadata too large".to_string()));
        }
        self.metadata_json = json;
        Ok(())
    }
}

/// A path's metadata as reported by the console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "parentdir", default)]
    pub parent_dir: String,
    #[serde(rename = "filename", default)]
    pub file_name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "createdts", default)]
    pub created_ts: i64,
    #[serde(rename = "updatedts", default)]
    pub updated_ts: i64,
    #[serde(default)]
    pub sha256: String,
    #[serde(rename = "filetype", default)]
    pub file_type: String,
    #[serde(rename = "mimetype", default)]
    pub mime_type: String,
    #[serde(rename = "allowedroles", default)]
    pub allowed_roles: Vec<String>,
    #[serde(rename = "editroles", default)]
    pub edit_roles: Vec<String>,
    #[serde(default)]
    pub display: String,
    #[serde(rename = "metadata", default)]
    pub metadata_json: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub removed: bool,
    #[serde(rename = "proclinks", default)]
    pub proc_links: Vec<String>,
    #[serde(rename = "appconfig", default)]
    pub app_config_json: String,
}

impl FileInfo {
    pub fn is_link_type(&self) -> bool {
        self.file_type == FILE_TYPE_RUNTIME_LINK || self.file_type == FILE_TYPE_APP_RUNTIME_LINK
    }

    /// Decode the stored metadata into a caller-supplied shape.
    pub fn bind_metadata<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.metadata_json)
            .map_err(|e| SdkError::json_unmarshal("FileInfo metadata", e))
    }
}

/// Listing options for [`FsClient::dir_info`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirOpts {
    #[serde(rename = "rolelist", default, skip_serializing_if = "Vec::is_empty")]
    pub role_list: Vec<String>,
    #[serde(rename = "showhidden", default, skip_serializing_if = "is_false")]
    pub show_hidden: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub recursive: bool,
}

fn validate_fs_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(SdkError::Validate(format!(
            "path must begin with '/': '{}'",
            path
        )));
    }
    if !paths::is_full_path_valid(path) {
        return Err(SdkError::Validate(format!("invalid path '{}'", path)));
    }
    Ok(())
}

/// JSON encoding used for digests and uploads. `serde_json` never
/// HTML-escapes, so the bytes are the canonical encoding.
pub(crate) fn encode_json(data: impl Serialize) -> Result<Vec<u8>> {
    serde_json::to_vec(&data).map_err(|e| SdkError::json_marshal("JsonData", e))
}

/// Fill digest fields from the full content bytes. Any upstream read error
/// must fail the write; an empty blob is only ever the result of explicitly
/// empty content.
pub fn update_file_opts_from_bytes(opts: &mut FileOpts, bytes: &[u8]) {
    opts.file_type = FILE_TYPE_STATIC.to_string();
    opts.sha256 = sha256_base64(bytes);
    opts.size = bytes.len() as i64;
}

/// Client for the virtual filesystem, rooted at `root_path` (empty for the
/// account root).
#[derive(Clone)]
pub struct FsClient {
    client: Arc<CloudClient>,
    root_path: String,
}

impl FsClient {
    pub(crate) fn new(client: Arc<CloudClient>, root_path: String) -> FsClient {
        FsClient { client, root_path }
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.root_path, path)
    }

    /// Write a path entry. Link-type opts carry a runtime binding instead of
    /// a body; static writes carry bytes.
    pub async fn set_raw_path(
        &self,
        path: &str,
        body: Option<Bytes>,
        file_opts: FileOpts,
        runtime: Option<RuntimeRef>,
    ) -> Result<()> {
        validate_fs_path(path)?;
        if runtime.is_some() && !file_opts.is_link_type() {
            return Err(SdkError::Validate(
                "runtime binding requires a link file type".to_string(),
            ));
        }
        if file_opts.is_link_type() && body.is_some() {
            return Err(SdkError::Validate(
                "link paths cannot carry a body".to_string(),
            ));
        }
        let opts_json = serde_json::to_string(&file_opts)
            .map_err(|e| SdkError::json_marshal("FileOpts", e))?;
        let full = self.full_path(path);
        self.client.set_path_rpc(&full, opts_json, body).await?;
        if let Some(runtime) = runtime {
            self.client.register_link_runtime(&full, runtime);
        }
        Ok(())
    }

    /// Serialize `data` as canonical JSON and write it. The stored sha256 is
    /// the digest of exactly those bytes.
    pub async fn set_json_path(
        &self,
        path: &str,
        data: impl Serialize,
        file_opts: Option<FileOpts>,
    ) -> Result<()> {
        let bytes = encode_json(data)?;
        let mut opts = file_opts.unwrap_or_default();
        update_file_opts_from_bytes(&mut opts, &bytes);
        if opts.mime_type.is_empty() {
            opts.mime_type = MIME_TYPE_JSON.to_string();
        }
        self.set_raw_path(path, Some(Bytes::from(bytes)), opts, None)
            .await
    }

    /// Write static bytes.
    pub async fn set_static_path(
        &self,
        path: &str,
        bytes: Bytes,
        file_opts: Option<FileOpts>,
    ) -> Result<()> {
        let mut opts = file_opts.unwrap_or_default();
        update_file_opts_from_bytes(&mut opts, &bytes);
        self.set_raw_path(path, Some(bytes), opts, None).await
    }

    /// Read a local file and write its contents.
    pub async fn set_path_from_file(
        &self,
        path: &str,
        file_name: &str,
        file_opts: Option<FileOpts>,
    ) -> Result<()> {
        let bytes = tokio::fs::read(file_name)
            .await
            .map_err(|e| SdkError::Validate(format!("cannot read {}: {}", file_name, e)))?;
        self.set_static_path(path, Bytes::from(bytes), file_opts)
            .await
    }

    /// Bind a linked runtime at `path`; inbound `path` requests for it are
    /// routed through the runtime's registry.
    pub async fn link_runtime(
        &self,
        path: &str,
        runtime: Arc<LinkRuntime>,
        file_opts: Option<FileOpts>,
    ) -> Result<()> {
        runtime.err()?;
        let mut opts = file_opts.unwrap_or_default();
        opts.file_type = FILE_TYPE_RUNTIME_LINK.to_string();
        self.set_raw_path(path, None, opts, Some(RuntimeRef::Link(runtime)))
            .await
    }

    /// Bind an app runtime at `path`.
    pub async fn link_app_runtime(
        &self,
        path: &str,
        runtime: Arc<AppRuntime>,
        file_opts: Option<FileOpts>,
    ) -> Result<()> {
        runtime.err()?;
        let mut opts = file_opts.unwrap_or_default();
        opts.file_type = FILE_TYPE_APP_RUNTIME_LINK.to_string();
        self.set_raw_path(path, None, opts, Some(RuntimeRef::App(runtime)))
            .await
    }

    /// Re-bind a runtime to an existing link path (e.g. after a restart)
    /// without rewriting its metadata.
    pub async fn connect_link_runtime(
        &self,
        path: &str,
        runtime: Arc<LinkRuntime>,
    ) -> Result<()> {
        runtime.err()?;
        let opts = FileOpts {
            file_type: FILE_TYPE_RUNTIME_LINK.to_string(),
            ..Default::default()
        };
        self.set_raw_path(path, None, opts, Some(RuntimeRef::Link(runtime)))
            .await
    }

    /// Metadata for one path, `None` when it does not exist.
    pub async fn file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        validate_fs_path(path)?;
        let json = self
            .client
            .file_info_rpc(&self.full_path(path), String::new())
            .await?;
        if json.is_empty() {
            return Ok(None);
        }
        let mut infos: Vec<FileInfo> = serde_json::from_str(&json)
            .map_err(|e| SdkError::json_unmarshal("FileInfo", e))?;
        if infos.is_empty() {
            return Ok(None);
        }
        Ok(Some(infos.remove(0)))
    }

    /// Directory listing.
    pub async fn dir_info(&self, path: &str, dir_opts: DirOpts) -> Result<Vec<FileInfo>> {
        validate_fs_path(path)?;
        let opts_json = serde_json::to_string(&dir_opts)
            .map_err(|e| SdkError::json_marshal("DirOpts", e))?;
        let json = self
            .client
            .file_info_rpc(&self.full_path(path), opts_json)
            .await?;
        if json.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&json).map_err(|e| SdkError::json_unmarshal("DirInfo", e))
    }

    /// Remove a path (and drop any local runtime binding for it).
    pub async fn remove_path(&self, path: &str) -> Result<()> {
        validate_fs_path(path)?;
        self.client.remove_path_rpc(&self.full_path(path)).await
    }

    /// URL for a path, with a link token unless suppressed.
    pub fn make_path_url(&self, path: &str, jwt_opts: Option<JwtOpts>) -> Result<String> {
        self.client
            .make_path_url_inner(&self.root_path, path, jwt_opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fs_path() {
        assert!(validate_fs_path("/a/b").is_ok());
        assert!(validate_fs_path("/").is_ok());
        assert!(validate_fs_path("relative").is_err());
        assert!(validate_fs_path("").is_err());
        assert!(validate_fs_path("/bad path").is_err());
    }

    #[test]
    fn test_update_file_opts_digest() {
        // sha256 reported for a JSON path equals the digest of the
        // canonical encoding
        let value = serde_json::json!({"b": 2, "a": "x < y"});
        let bytes = encode_json(&value).unwrap();
        // serde_json does not HTML-escape
        assert!(String::from_utf8_lossy(&bytes).contains("x < y"));

        let mut opts = FileOpts::default();
        update_file_opts_from_bytes(&mut opts, &bytes);
        assert_eq!(opts.file_type, FILE_TYPE_STATIC);
        assert_eq!(opts.size, bytes.len() as i64);
        assert_eq!(opts.sha256, sha256_base64(&bytes));
    }

    #[test]
    fn test_file_opts_metadata_limit() {
        let mut opts = FileOpts::default();
        opts.set_metadata(serde_json::json!({"k": "v"})).unwrap();
        assert_eq!(opts.metadata_json, r#"{"k":"v"}"#);

        let big = "x".repeat(METADATA_JSON_MAX + 1);
        assert!(opts.set_metadata(serde_json::json!(big)).is_err());
    }

    #[test]
    fn test_file_opts_link_type() {
        let mut opts = FileOpts::default();
        assert!(!opts.is_link_type());
        opts.file_type = FILE_TYPE_RUNTIME_LINK.to_string();
        assert!(opts.is_link_type());
        opts.file_type = FILE_TYPE_APP_RUNTIME_LINK.to_string();
        assert!(opts.is_link_type());
    }

    #[test]
    fn test_file_info_json_shape() {
        let json = r#"[{"path":"/a","filetype":"static","sha256":"abc","size":3,
            "mimetype":"application/json","metadata":"{\"k\":1}"}]"#;
        let infos: Vec<FileInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, "/a");
        assert_eq!(infos[0].file_type, FILE_TYPE_STATIC);
        #[derive(Deserialize)]
        struct Meta {
            k: i64,
        }
        let meta: Meta = infos[0].bind_metadata().unwrap();
        assert_eq!(meta.k, 1);
    }
}
