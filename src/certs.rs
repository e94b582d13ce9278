//! Certificate issuance for the etcd cluster.
//!
//! [`CertIssuer`] is the seam the etcd split step consumes; [`RcgenIssuer`] is
//! the in-process implementation. All outputs are PEM encoded.

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::core::{DeployError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertUsage {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertConfig {
    pub common_name: String,
    pub organization: Option<String>,
    /// DNS names or IP addresses
    pub alt_names: Vec<String>,
    pub usages: Vec<CertUsage>,
    pub validity_days: i64,
}

impl CertConfig {
    pub fn ca(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            alt_names: Vec::new(),
            usages: Vec::new(),
            validity_days: 3650,
        }
    }

    pub fn leaf(common_name: impl Into<String>, alt_names: Vec<String>, usages: Vec<CertUsage>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            alt_names,
            usages,
            validity_days: 3650,
        }
    }
}

/// A PEM certificate and its PEM private key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertPair")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .finish_non_exhaustive()
    }
}

pub trait CertIssuer: Send + Sync {
    fn create_ca(&self, config: &CertConfig) -> Result<CertPair>;

    fn create_from_ca(&self, config: &CertConfig, ca_cert: &str, ca_key: &str) -> Result<CertPair>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenIssuer;

impl RcgenIssuer {
    fn params(config: &CertConfig) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, config.common_name.as_str());
        if let Some(org) = &config.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        params.distinguished_name = dn;
        params.subject_alt_names = config
            .alt_names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(name.clone()),
            })
            .collect();

        let now = Utc::now();
        let until = now + ChronoDuration::days(config.validity_days.max(1));
        params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
        params
    }
}

impl CertIssuer for RcgenIssuer {
    fn create_ca(&self, config: &CertConfig) -> Result<CertPair> {
        let mut params = Self::params(config);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca = Certificate::from_params(params)
            .map_err(|e| DeployError::certificate(format!("generate CA: {e}")))?;
        let cert_pem = ca
            .serialize_pem()
            .map_err(|e| DeployError::certificate(format!("serialize CA: {e}")))?;
        Ok(CertPair {
            cert_pem,
            key_pem: ca.serialize_private_key_pem(),
        })
    }

    fn create_from_ca(&self, config: &CertConfig, ca_cert: &str, ca_key: &str) -> Result<CertPair> {
        let key_pair = KeyPair::from_pem(ca_key)
            .map_err(|e| DeployError::certificate(format!("parse CA key: {e}")))?;
        let ca_params = CertificateParams::from_ca_cert_pem(ca_cert, key_pair)
            .map_err(|e| DeployError::certificate(format!("parse CA cert: {e}")))?;
        let ca = Certificate::from_params(ca_params)
            .map_err(|e| DeployError::certificate(format!("load CA: {e}")))?;

        let mut params = Self::params(config);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = config
            .usages
            .iter()
            .map(|usage| match usage {
                CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
                CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
            })
            .collect();

        let leaf = Certificate::from_params(params)
            .map_err(|e| DeployError::certificate(format!("generate {}: {e}", config.common_name)))?;
        let cert_pem = leaf
            .serialize_pem_with_signer(&ca)
            .map_err(|e| DeployError::certificate(format!("sign {}: {e}", config.common_name)))?;
        Ok(CertPair {
            cert_pem,
            key_pem: leaf.serialize_private_key_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_and_leaf_are_pem() {
        let issuer = RcgenIssuer;
        let ca = issuer.create_ca(&CertConfig::ca("etcd-ca")).unwrap();
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));

        let leaf = issuer
            .create_from_ca(
                &CertConfig::leaf(
                    "etcd-1",
                    vec!["etcd-1".into(), "10.0.0.1".into()],
                    vec![CertUsage::Server, CertUsage::Client],
                ),
                &ca.cert_pem,
                &ca.key_pem,
            )
            .unwrap();
        assert!(leaf.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_ne!(leaf.cert_pem, ca.cert_pem);
    }

    #[test]
    fn test_bad_ca_key_is_certificate_error() {
        let err = RcgenIssuer
            .create_from_ca(&CertConfig::ca("x"), "not a cert", "not a key")
            .unwrap_err();
        assert_eq!(err.category(), "certificate");
    }
}
