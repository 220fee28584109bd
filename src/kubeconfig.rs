// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kubeconfig is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("kubeconfig has no clusters")]
    NoClusters,
    #[error("kubeconfig has no contexts")]
    NoContexts,
    #[error("credential file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Kubeconfig is the subset of the kubectl config file format we read and write.
/// Fields we do not know about are dropped.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub current_context: String,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    /// Base64 encoded PEM bundle, kept exactly as found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub cluster: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

impl Kubeconfig {
    pub fn parse(data: &[u8]) -> Result<Kubeconfig, Error> {
        Ok(serde_yaml::from_slice(data)?)
    }

    /// reference returns the cluster and context that issued credentials are built from.
    pub fn reference(&self) -> Result<(&NamedCluster, &NamedContext), Error> {
        let cluster = self.clusters.first().ok_or(Error::NoClusters)?;
        let context = self.contexts.first().ok_or(Error::NoContexts)?;
        Ok((cluster, context))
    }
}

/// IssuedCredential is a kubeconfig that authenticates a single user with a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential(Kubeconfig);

impl IssuedCredential {
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.0
    }

    /// encode renders the credential as YAML, then base64.
    pub fn encode(&self) -> Result<String, Error> {
        let yaml = serde_yaml::to_string(&self.0)?;
        Ok(STANDARD.encode(yaml))
    }
}

/// assemble builds a credential for `user` that points at the first cluster of `admin`.
pub fn assemble(
    admin: &Kubeconfig,
    certificate: &[u8],
    key_pem: &[u8],
    user: &str,
) -> Result<IssuedCredential, Error> {
    let (cluster, _) = admin.reference()?;
    Ok(IssuedCredential(Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: cluster.name.clone(),
            cluster: Cluster {
                server: cluster.cluster.server.clone(),
                certificate_authority_data: cluster.cluster.certificate_authority_data.clone(),
                tls_server_name: cluster.cluster.tls_server_name.clone(),
            },
        }],
        contexts: vec![NamedContext {
            name: user.to_string(),
            context: Context {
                cluster: cluster.name.clone(),
                user: user.to_string(),
                namespace: None,
            },
        }],
        users: vec![NamedUser {
            name: user.to_string(),
            user: User {
                client_certificate_data: Some(STANDARD.encode(certificate)),
                client_key_data: Some(STANDARD.encode(key_pem)),
            },
        }],
        current_context: user.to_string(),
    }))
}

/// decode reverses IssuedCredential::encode.
pub fn decode(encoded: &str) -> Result<Kubeconfig, Error> {
    let yaml = STANDARD.decode(encoded)?;
    Kubeconfig::parse(&yaml)
}

/// CredentialDir is the scratch directory admin kubeconfigs are written to while a request is
/// being served.
#[derive(Clone, Debug)]
pub struct CredentialDir {
    path: PathBuf,
}

impl CredentialDir {
    /// create makes sure the directory exists.
    pub async fn create(path: impl Into<PathBuf>) -> Result<CredentialDir, Error> {
        let path = path.into();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::Io(path.clone(), e))?;
        Ok(CredentialDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// store writes `contents` to a fresh file, removed again once the returned guard is dropped.
    pub async fn store(&self, contents: &[u8]) -> Result<StoredCredential, Error> {
        let name: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let path = self.path.join(format!("{name}.kubeconfig"));
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::Io(path.clone(), e))?;
        debug!(path=%path.display(), "stored admin kubeconfig");
        Ok(StoredCredential { path })
    }
}

#[derive(Debug)]
pub struct StoredCredential {
    path: PathBuf,
}

impl StoredCredential {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Kubeconfig, Error> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::Io(self.path.clone(), e))?;
        Kubeconfig::parse(&data)
    }
}

impl Drop for StoredCredential {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path=%self.path.display(), "failed to remove admin kubeconfig: {e}");
        }
    }
}
