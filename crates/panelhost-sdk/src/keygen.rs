// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! Account keypair materialization and validation.
//!
//! The account identity is bound to the TLS client certificate: the
//! certificate CN is the account id. With `auto_keygen` set (anonymous
//! accounts only), a missing keypair is minted on first run as a self-signed
//! P-384 certificate.

use std::path::Path;

use tracing::info;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::Config;
use crate::error::{Result, SdkError};

/// Generate a self-signed P-384 keypair with CN = `acc_id` and write it to
/// the given PEM files.
pub fn create_keypair(key_file: &str, cert_file: &str, acc_id: &str) -> Result<()> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| SdkError::Config(format!("cannot generate keypair: {}", e)))?;
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| SdkError::Config(format!("cannot build certificate params: {}", e)))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, acc_id);
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SdkError::Config(format!("cannot self-sign certificate: {}", e)))?;

    std::fs::write(key_file, key_pair.serialize_pem())
        .map_err(|e| SdkError::Config(format!("cannot write {}: {}", key_file, e)))?;
    std::fs::write(cert_file, cert.pem())
        .map_err(|e| SdkError::Config(format!("cannot write {}: {}", cert_file, e)))?;
    info!(acc_id = %acc_id, key_file = %key_file, cert_file = %cert_file, "created self-signed keypair");
    Ok(())
}

/// Extract the CN (the account id) from a PEM certificate file.
pub fn read_cert_acc_id(cert_file: &str) -> Result<String> {
    let pem_bytes = std::fs::read(cert_file)
        .map_err(|e| SdkError::Config(format!("cannot read {}: {}", cert_file, e)))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes)
        .map_err(|e| SdkError::Config(format!("cannot parse {}: {:?}", cert_file, e)))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents).map_err(|e| {
        SdkError::Config(format!("cannot parse certificate {}: {:?}", cert_file, e))
    })?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| {
            SdkError::Config(format!("certificate {} has no CN subject", cert_file))
        })?;
    Ok(cn.to_string())
}

/// Ensure the configured keypair exists and matches the configured account
/// id, minting one when allowed. Resolves `config.acc_id` from the
/// certificate when unset.
pub fn ensure_keypair(config: &mut Config) -> Result<()> {
    let key_exists = Path::new(&config.key_file_name).exists();
    let cert_exists = Path::new(&config.cert_file_name).exists();

    if !key_exists || !cert_exists {
        if !config.auto_keygen {
            return Err(SdkError::Config(format!(
                "keypair files not found (key={}, cert={}) and auto keygen is disabled",
                config.key_file_name, config.cert_file_name
            )));
        }
        if !config.anon_acc {
            return Err(SdkError::Config(
                "auto keygen is only permitted for anonymous accounts".to_string(),
            ));
        }
        let acc_id = if config.acc_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.acc_id.clone()
        };
        create_keypair(&config.key_file_name, &config.cert_file_name, &acc_id)?;
        config.acc_id = acc_id;
        return Ok(());
    }

    let cert_acc_id = read_cert_acc_id(&config.cert_file_name)?;
    if config.acc_id.is_empty() {
        config.acc_id = cert_acc_id;
    } else if config.acc_id != cert_acc_id {
        return Err(SdkError::Config(format!(
            "account id mismatch: config has '{}' but certificate CN is '{}'",
            config.acc_id, cert_acc_id
        )));
    }
    Ok(())
}
