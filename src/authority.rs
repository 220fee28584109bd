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

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::csr::SigningRequest;

mod k8s;
pub use k8s::*;

pub mod mock;

/// Signer used for certificates that authenticate to the kube-apiserver.
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

pub const APPROVAL_REASON: &str = "KubecsrApprove";
pub const APPROVAL_MESSAGE: &str = "Automatically approved by kubecsr";

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("failed to connect to certificate authority: {0}")]
    Connect(String),
    #[error("{0} rejected: {1}")]
    Rejected(Operation, String),
    #[error("a signing request named {0} already exists")]
    AlreadyExists(String),
    #[error("signing request {0} not found")]
    NotFound(String),
    #[error("signing request {0} was denied: {1}")]
    Denied(String, String),
    #[error("{0} did not complete within {1:?}")]
    Timeout(Operation, Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Submit,
    Approve,
    Get,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Connect => "connect",
            Operation::Submit => "submit",
            Operation::Approve => "approve",
            Operation::Get => "get",
        };
        f.write_str(s)
    }
}

/// Key usages, spelled the way the Kubernetes certificates API expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Usage {
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "digital signature")]
    DigitalSignature,
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Usage::ClientAuth => "client auth",
            Usage::DigitalSignature => "digital signature",
            Usage::KeyEncipherment => "key encipherment",
        }
    }

    pub fn parse(s: &str) -> Option<Usage> {
        [
            Usage::ClientAuth,
            Usage::DigitalSignature,
            Usage::KeyEncipherment,
        ]
        .into_iter()
        .find(|u| u.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConditionType {
    Approved,
    Denied,
    Failed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Approved => "Approved",
            ConditionType::Denied => "Denied",
            ConditionType::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<ConditionType> {
        match s {
            "Approved" => Some(ConditionType::Approved),
            "Denied" => Some(ConditionType::Denied),
            "Failed" => Some(ConditionType::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub type_: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn approved() -> Condition {
        Condition {
            type_: ConditionType::Approved,
            status: true,
            reason: APPROVAL_REASON.to_string(),
            message: APPROVAL_MESSAGE.to_string(),
        }
    }
}

/// AuthorityRecord is the authority's view of a submitted signing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityRecord {
    pub name: String,
    pub signer_name: String,
    pub usages: Vec<Usage>,
    pub expiration_seconds: Option<i32>,
    pub conditions: Vec<Condition>,
    /// PEM encoded certificate, set once the authority has signed the request.
    pub certificate: Option<Vec<u8>>,
}

impl AuthorityRecord {
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref().filter(|c| !c.is_empty())
    }

    /// rejection returns the reason the request will never be signed, if any.
    pub fn rejection(&self) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| c.status && matches!(c.type_, ConditionType::Denied | ConditionType::Failed))
            .map(|c| format!("{}: {} {}", c.type_.as_str(), c.reason, c.message))
    }
}

/// AuthorityClient is the certificate authority that signs our requests.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// submit registers a new signing request under `identity`.
    async fn submit(
        &self,
        request: &SigningRequest,
        identity: &str,
        usages: &[Usage],
        expiration_seconds: Option<i32>,
    ) -> Result<AuthorityRecord, Error>;

    /// approve marks the request as approved by us.
    async fn approve(&self, record: &AuthorityRecord) -> Result<(), Error>;

    /// get reads the current state of a request. A request that is not signed yet is not an error.
    async fn get(&self, identity: &str) -> Result<AuthorityRecord, Error>;
}

/// AuthorityFactory builds an authority from the administrative kubeconfig of a request.
#[async_trait]
pub trait AuthorityFactory: Send + Sync {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn AuthorityClient>, Error>;
}

/// with_timeout bounds a single call to the authority.
pub async fn with_timeout<T, F>(op: Operation, timeout: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(Error::Timeout(op, timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection() {
        let mut record = AuthorityRecord::default();
        assert_eq!(record.rejection(), None);
        record.conditions.push(Condition::approved());
        assert_eq!(record.rejection(), None);
        record.conditions.push(Condition {
            type_: ConditionType::Denied,
            status: true,
            reason: "Policy".to_string(),
            message: "no".to_string(),
        });
        assert_eq!(record.rejection().unwrap(), "Denied: Policy no");
    }

    #[test]
    fn empty_certificate_is_not_ready() {
        let record = AuthorityRecord {
            certificate: Some(vec![]),
            ..Default::default()
        };
        assert!(record.certificate().is_none());
    }

    #[test]
    fn usages() {
        assert_eq!(Usage::parse("client auth"), Some(Usage::ClientAuth));
        assert_eq!(Usage::parse("server auth"), None);
        assert_eq!(
            serde_json::to_string(&Usage::KeyEncipherment).unwrap(),
            "\"key encipherment\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout() {
        let res: Result<(), Error> = with_timeout(
            Operation::Approve,
            Duration::from_secs(10),
            std::future::pending(),
        )
        .await;
        assert!(matches!(
            res,
            Err(Error::Timeout(Operation::Approve, d)) if d == Duration::from_secs(10)
        ));
    }
}
