//! Partner credentials: API client id/secret and the TLS client identity.
//!
//! Both are resolved on every call so that rotated secrets are picked up
//! without a restart.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

pub const CLIENT_ID_SECRET: &str = "amex-clientId";
pub const CLIENT_SECRET_SECRET: &str = "amex-clientSecret";
pub const CLIENT_CERT_SECRET: &str = "amex-cert";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential {0} is not available")]
    Missing(String),
    #[error("credential {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("credential store unreachable while reading {name}: {source}")]
    Unavailable {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl CredentialError {
    /// Errors worth retrying: the store was there but could not be read.
    pub fn is_transient(&self) -> bool {
        matches!(self, CredentialError::Unavailable { .. })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// PEM-encoded private key and certificate for mutual TLS.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub key_pem: String,
    pub cert_pem: String,
}

impl ClientIdentity {
    /// Key and certificate concatenated, as `reqwest::Identity::from_pem` expects.
    pub fn to_pem_bundle(&self) -> Vec<u8> {
        let mut bundle = self.key_pem.trim_end().to_string();
        bundle.push('\n');
        bundle.push_str(self.cert_pem.trim_end());
        bundle.push('\n');
        bundle.into_bytes()
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn client_credentials(&self) -> Result<ClientCredentials, CredentialError>;

    async fn client_identity(&self) -> Result<ClientIdentity, CredentialError>;
}

/// Credentials taken from configuration, with optional PEM files on disk.
#[derive(Clone)]
pub struct StaticCredentials {
    credentials: ClientCredentials,
    key_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
}

impl StaticCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            credentials: ClientCredentials {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
            },
            key_path: None,
            cert_path: None,
        }
    }

    pub fn with_identity_files(mut self, key_path: PathBuf, cert_path: PathBuf) -> Self {
        self.key_path = Some(key_path);
        self.cert_path = Some(cert_path);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn client_credentials(&self) -> Result<ClientCredentials, CredentialError> {
        if self.credentials.client_id.is_empty() {
            return Err(CredentialError::Missing("client id".into()));
        }
        if self.credentials.client_secret.is_empty() {
            return Err(CredentialError::Missing("client secret".into()));
        }
        Ok(self.credentials.clone())
    }

    async fn client_identity(&self) -> Result<ClientIdentity, CredentialError> {
        let (Some(key_path), Some(cert_path)) = (&self.key_path, &self.cert_path) else {
            return Err(CredentialError::Missing("client certificate".into()));
        };
        Ok(ClientIdentity {
            key_pem: read_secret_file(key_path).await?,
            cert_pem: read_secret_file(cert_path).await?,
        })
    }
}

/// Credentials read from a directory of mounted secrets, one file per secret.
///
/// `amex-clientId` and `amex-clientSecret` hold `{"value": "..."}`;
/// `amex-cert` holds `{"key": "...", "cert": "..."}`.
#[derive(Debug, Clone)]
pub struct SecretDirCredentials {
    dir: PathBuf,
}

#[derive(Deserialize)]
struct ValueSecret {
    value: String,
}

#[derive(Deserialize)]
struct CertSecret {
    key: String,
    cert: String,
}

impl SecretDirCredentials {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, CredentialError> {
        let raw = read_secret_file(&self.dir.join(name)).await?;
        serde_json::from_str(&raw).map_err(|err| CredentialError::Malformed {
            name: name.to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl CredentialProvider for SecretDirCredentials {
    async fn client_credentials(&self) -> Result<ClientCredentials, CredentialError> {
        let id: ValueSecret = self.read_json(CLIENT_ID_SECRET).await?;
        let secret: ValueSecret = self.read_json(CLIENT_SECRET_SECRET).await?;
        Ok(ClientCredentials {
            client_id: id.value,
            client_secret: secret.value,
        })
    }

    async fn client_identity(&self) -> Result<ClientIdentity, CredentialError> {
        let cert: CertSecret = self.read_json(CLIENT_CERT_SECRET).await?;
        Ok(ClientIdentity {
            key_pem: cert.key,
            cert_pem: cert.cert,
        })
    }
}

async fn read_secret_file(path: &Path) -> Result<String, CredentialError> {
    let name = path.display().to_string();
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(CredentialError::Missing(name)),
        Err(err) if err.kind() == ErrorKind::InvalidData => Err(CredentialError::Malformed {
            name,
            reason: err.to_string(),
        }),
        Err(source) => Err(CredentialError::Unavailable { name, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn static_credentials_without_identity() {
        let creds = StaticCredentials::new("client-id", "shhhh");
        let resolved = creds.client_credentials().await.unwrap();
        assert_eq!(resolved.client_id, "client-id");
        let err = creds.client_identity().await.unwrap_err();
        assert!(matches!(err, CredentialError::Missing(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn static_credentials_reject_empty_secret() {
        let creds = StaticCredentials::new("client-id", "");
        assert!(matches!(
            creds.client_credentials().await,
            Err(CredentialError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn static_credentials_read_identity_files() {
        let td = tempdir().unwrap();
        let key = td.path().join("key.pem");
        let cert = td.path().join("cert.pem");
        stdfs::write(&key, "KEY").unwrap();
        stdfs::write(&cert, "CERT").unwrap();
        let creds = StaticCredentials::new("id", "secret").with_identity_files(key, cert);
        let identity = creds.client_identity().await.unwrap();
        assert_eq!(identity.to_pem_bundle(), b"KEY\nCERT\n".to_vec());
    }

    #[tokio::test]
    async fn secret_dir_reads_json_secrets() {
        let td = tempdir().unwrap();
        stdfs::write(td.path().join(CLIENT_ID_SECRET), r#"{"value": "vault-id"}"#).unwrap();
        stdfs::write(td.path().join(CLIENT_SECRET_SECRET), r#"{"value": "vault-secret"}"#).unwrap();
        stdfs::write(
            td.path().join(CLIENT_CERT_SECRET),
            r#"{"key": "-----KEY-----", "cert": "-----CERT-----"}"#,
        )
        .unwrap();

        let creds = SecretDirCredentials::new(td.path());
        let resolved = creds.client_credentials().await.unwrap();
        assert_eq!(resolved.client_id, "vault-id");
        assert_eq!(resolved.client_secret, "vault-secret");
        let identity = creds.client_identity().await.unwrap();
        assert_eq!(identity.key_pem, "-----KEY-----");
        assert_eq!(identity.cert_pem, "-----CERT-----");
    }

    #[tokio::test]
    async fn secret_dir_reports_missing_and_malformed() {
        let td = tempdir().unwrap();
        let creds = SecretDirCredentials::new(td.path());
        assert!(matches!(
            creds.client_identity().await,
            Err(CredentialError::Missing(_))
        ));

        stdfs::write(td.path().join(CLIENT_CERT_SECRET), r#"{"key": "only"}"#).unwrap();
        assert!(matches!(
            creds.client_identity().await,
            Err(CredentialError::Malformed { .. })
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = ClientCredentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
