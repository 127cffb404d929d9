//! Site connection settings consumed from the (external) site store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FerryError;
use crate::sandbox::SandboxBoundary;

/// How the connection manager authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "key")]
    Key,
}

/// Non-secret description of a remote site.
///
/// Credentials are supplied to the connection manager at runtime and never
/// stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub remote_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ssh_options: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    22
}

impl SiteConfig {
    /// Checks required fields and the remote root.
    pub fn validate(&self) -> Result<(), FerryError> {
        if self.name.trim().is_empty() {
            return Err(FerryError::validation("site name is required"));
        }
        if self.host.trim().is_empty() {
            return Err(FerryError::validation("host is required"));
        }
        if self.port == 0 {
            return Err(FerryError::validation("port must be between 1 and 65535"));
        }
        if self.username.trim().is_empty() {
            return Err(FerryError::validation("username is required"));
        }
        if self.auth_method == AuthMethod::Key
            && self.key_path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            return Err(FerryError::validation("key authentication needs a key path"));
        }
        self.boundary().map(|_| ())
    }

    /// Builds the sandbox boundary for sessions against this site.
    pub fn boundary(&self) -> Result<SandboxBoundary, FerryError> {
        SandboxBoundary::new(&self.remote_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteConfig {
        SiteConfig {
            name: "gpu-box".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "root".into(),
            auth_method: AuthMethod::Password,
            remote_root: "/root/autodl-tmp".into(),
            key_path: None,
            proxy_jump: None,
            ssh_options: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_site_passes() {
        assert!(site().validate().is_ok());
        assert_eq!(site().boundary().unwrap().root().as_str(), "/root/autodl-tmp");
    }

    #[test]
    fn rejects_missing_fields() {
        let mut s = site();
        s.host = "  ".into();
        assert!(s.validate().is_err());

        let mut s = site();
        s.port = 0;
        assert!(s.validate().is_err());

        let mut s = site();
        s.username.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_relative_root() {
        let mut s = site();
        s.remote_root = "autodl-tmp".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn key_auth_needs_key_path() {
        let mut s = site();
        s.auth_method = AuthMethod::Key;
        assert!(s.validate().is_err());
        s.key_path = Some("~/.ssh/id_ed25519".into());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn json_defaults_port() {
        let json = r#"{"name":"a","host":"h","username":"u","authMethod":"password","remoteRoot":"/data"}"#;
        let s: SiteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(s.port, 22);
        assert!(s.ssh_options.is_empty());
    }
}
