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
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Span, field, info, instrument, warn};

use crate::audit::AuditLog;
use crate::authority::{AuthorityFactory, Operation, Usage, with_timeout};
use crate::csr::{CertificateRequestSpec, KeyPair};
use crate::kubeconfig::{self, CredentialDir};
use crate::metrics::{Issuance, Metrics, Outcome, Recorder};
use crate::waiter::{self, PollPolicy};
use crate::{authority, csr};

/// Usages requested for every issued certificate.
pub const CLIENT_USAGES: &[Usage] = &[Usage::ClientAuth];

/// The Kubernetes API rejects shorter certificate lifetimes.
pub const MIN_EXPIRATION_SECONDS: u32 = 600;

const IDENTITY_SUFFIX_LEN: usize = 8;
// DNS-1123 subdomain, minus room for the suffix.
const MAX_IDENTITY_PREFIX_LEN: usize = 253 - IDENTITY_SUFFIX_LEN - 1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("failed to generate key: {0}")]
    KeyGeneration(#[source] csr::Error),
    #[error("failed to build certificate request: {0}")]
    RequestEncoding(#[source] csr::Error),
    #[error("failed to handle admin kubeconfig: {0}")]
    CredentialIo(#[source] kubeconfig::Error),
    #[error("certificate authority: {0}")]
    Authority(#[from] authority::Error),
    #[error("certificate for {identity} was not issued after {attempts} attempts")]
    Timeout { identity: String, attempts: u32 },
    #[error("failed to assemble kubeconfig: {0}")]
    CredentialAssembly(#[source] kubeconfig::Error),
}

impl From<waiter::Error> for Error {
    fn from(e: waiter::Error) -> Self {
        match e {
            waiter::Error::Timeout { identity, attempts } => Error::Timeout { identity, attempts },
            waiter::Error::Rejected { identity, reason } => {
                Error::Authority(authority::Error::Denied(identity, reason))
            }
        }
    }
}

/// Stage is the progress of a single issuance. Failures are reported with the last stage reached.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Stage {
    Received,
    KeyGenerated,
    RequestBuilt,
    Submitted,
    ApprovalRequested,
    Polling,
    CertificateObtained,
    CredentialAssembled,
    Recorded,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::KeyGenerated => "key_generated",
            Stage::RequestBuilt => "request_built",
            Stage::Submitted => "submitted",
            Stage::ApprovalRequested => "approval_requested",
            Stage::Polling => "polling",
            Stage::CertificateObtained => "certificate_obtained",
            Stage::CredentialAssembled => "credential_assembled",
            Stage::Recorded => "recorded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EncodeLabelValue for Stage {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

/// IssueRequest is the body of an issuance request.
#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    #[serde(default)]
    pub certificate_request: CertificateRequestSpec,
    #[serde(default)]
    pub expiration_seconds: Option<u32>,
    /// Base64 encoded admin kubeconfig for the target cluster.
    #[serde(default)]
    pub kubeconfig: String,
}

impl fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueRequest")
            .field("certificate_request", &self.certificate_request)
            .field("expiration_seconds", &self.expiration_seconds)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RequestMeta {
    pub requester: SocketAddr,
}

/// RequestRecord is what we return to the caller and keep in the audit log.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub certificate_request: CertificateRequestSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_seconds: Option<u32>,
    /// Base64 encoded kubeconfig of the issued credential.
    pub kubeconfig: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "requesterIP")]
    pub requester_ip: String,
    /// Name of the signing request at the authority.
    pub authority_name: String,
}

/// authority_identity derives a unique signing request name for `user`. The name is a valid
/// Kubernetes object name even when `user` is not.
pub fn authority_identity(user: &str) -> String {
    let sanitized: String = user
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_IDENTITY_PREFIX_LEN)
        .collect();
    let mut prefix = sanitized.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        prefix = "kubecsr";
    }
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(IDENTITY_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}

/// Issuer runs the issuance workflow: key, signing request, submission, approval, polling and
/// finally the new kubeconfig.
pub struct Issuer {
    authorities: Arc<dyn AuthorityFactory>,
    credentials: CredentialDir,
    policy: PollPolicy,
    key_bits: usize,
    default_expiration: Option<u32>,
    audit: AuditLog,
    metrics: Arc<Metrics>,
}

impl Issuer {
    pub fn new(
        authorities: Arc<dyn AuthorityFactory>,
        credentials: CredentialDir,
        policy: PollPolicy,
        key_bits: usize,
        default_expiration: Option<u32>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Issuer {
            authorities,
            credentials,
            policy,
            key_bits,
            default_expiration,
            audit: AuditLog::new(),
            metrics,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// issue serves one request. Only a fully issued credential is recorded.
    #[instrument(
        skip_all,
        fields(user=%request.certificate_request.user, requester=%meta.requester, identity=field::Empty)
    )]
    pub async fn issue(
        &self,
        request: IssueRequest,
        meta: RequestMeta,
    ) -> Result<RequestRecord, Error> {
        let start = Instant::now();
        let mut stage = Stage::Received;
        let res = self.run(request, meta, &mut stage).await;
        let outcome = match &res {
            Ok(record) => {
                info!(identity = %record.authority_name, "issued credential");
                Outcome::Success
            }
            Err(e) => {
                warn!(%stage, "issuance failed: {e}");
                Outcome::Failure
            }
        };
        self.metrics
            .record(&Issuance { outcome, stage }, start.elapsed());
        res
    }

    async fn run(
        &self,
        request: IssueRequest,
        meta: RequestMeta,
        stage: &mut Stage,
    ) -> Result<RequestRecord, Error> {
        let IssueRequest {
            certificate_request: spec,
            expiration_seconds,
            kubeconfig: admin_kubeconfig,
        } = request;

        // Everything that can be checked up front is, before we generate keys or reach out to
        // the authority.
        if spec.user.trim().is_empty() {
            return Err(Error::Validation(
                "certificateRequest.user is required".to_string(),
            ));
        }
        if admin_kubeconfig.trim().is_empty() {
            return Err(Error::Validation("kubeconfig is required".to_string()));
        }
        let expiration_seconds = expiration_seconds.or(self.default_expiration);
        let expiration = match expiration_seconds {
            Some(s) if s < MIN_EXPIRATION_SECONDS => {
                return Err(Error::Validation(format!(
                    "expirationSeconds must be at least {MIN_EXPIRATION_SECONDS}"
                )));
            }
            Some(s) => Some(i32::try_from(s).map_err(|_| {
                Error::Validation(format!("expirationSeconds {s} is too large"))
            })?),
            None => None,
        };
        // `base64` wraps its output at 76 columns; line breaks carry no data.
        let admin_compact: String = admin_kubeconfig
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let admin_raw = STANDARD
            .decode(admin_compact)
            .map_err(|e| Error::Validation(format!("kubeconfig is not valid base64: {e}")))?;

        let stored = self
            .credentials
            .store(&admin_raw)
            .await
            .map_err(Error::CredentialIo)?;
        let admin = stored.read().await.map_err(|e| match e {
            kubeconfig::Error::Io(..) => Error::CredentialIo(e),
            e => Error::CredentialAssembly(e),
        })?;
        admin.reference().map_err(Error::CredentialAssembly)?;

        let bits = self.key_bits;
        let key = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|e| Error::KeyGeneration(csr::Error::KeyGeneration(e.to_string())))?
            .map_err(Error::KeyGeneration)?;
        *stage = Stage::KeyGenerated;

        let signing_request = spec
            .signing_request(&key)
            .map_err(Error::RequestEncoding)?;
        let key_pem = key.to_pem().map_err(Error::RequestEncoding)?;
        *stage = Stage::RequestBuilt;

        let identity = authority_identity(&spec.user);
        Span::current().record("identity", identity.as_str());
        let client = self.authorities.connect(stored.path()).await?;
        let record = with_timeout(
            Operation::Submit,
            self.policy.call_timeout,
            client.submit(&signing_request, &identity, CLIENT_USAGES, expiration),
        )
        .await?;
        *stage = Stage::Submitted;

        with_timeout(
            Operation::Approve,
            self.policy.call_timeout,
            client.approve(&record),
        )
        .await?;
        *stage = Stage::ApprovalRequested;

        *stage = Stage::Polling;
        let certificate =
            waiter::wait_for_certificate(&identity, client.as_ref(), &self.policy).await?;
        *stage = Stage::CertificateObtained;

        let credential = kubeconfig::assemble(&admin, &certificate, &key_pem, &spec.user)
            .map_err(Error::CredentialAssembly)?;
        let encoded = credential.encode().map_err(Error::CredentialAssembly)?;
        *stage = Stage::CredentialAssembled;
        drop(stored);

        let record = RequestRecord {
            certificate_request: spec,
            expiration_seconds,
            kubeconfig: encoded,
            timestamp: Utc::now(),
            requester_ip: meta.requester.to_string(),
            authority_name: identity,
        };
        self.audit.append(record.clone());
        *stage = Stage::Recorded;
        Ok(record)
    }
}
