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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, instrument};

use super::{
    AuthorityClient, AuthorityFactory, AuthorityRecord, Condition, ConditionType, Error,
    KUBE_APISERVER_CLIENT_SIGNER, Operation, Usage, with_timeout,
};
use crate::csr::SigningRequest;

/// KubeAuthority signs requests through the certificates.k8s.io/v1 API of a cluster.
#[derive(Clone)]
pub struct KubeAuthority {
    api: Api<CertificateSigningRequest>,
}

impl KubeAuthority {
    pub fn new(client: Client) -> KubeAuthority {
        KubeAuthority {
            api: Api::all(client),
        }
    }

    /// from_kubeconfig connects with the current context of the kubeconfig at `path`.
    pub async fn from_kubeconfig(path: &Path) -> Result<KubeAuthority, Error> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| Error::Connect(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        debug!(server=%config.cluster_url, "connecting to cluster");
        let client = Client::try_from(config).map_err(|e| Error::Connect(e.to_string()))?;
        Ok(KubeAuthority::new(client))
    }
}

fn map_err(op: Operation, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists(name.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(name.to_string()),
        kube::Error::Api(ae) => Error::Rejected(op, format!("{} ({})", ae.message, ae.reason)),
        err => Error::Rejected(op, err.to_string()),
    }
}

impl From<CertificateSigningRequest> for AuthorityRecord {
    fn from(csr: CertificateSigningRequest) -> Self {
        let status = csr.status.unwrap_or_default();
        let conditions = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| {
                Some(Condition {
                    type_: ConditionType::parse(&c.type_)?,
                    status: c.status == "True",
                    reason: c.reason.unwrap_or_default(),
                    message: c.message.unwrap_or_default(),
                })
            })
            .collect();
        AuthorityRecord {
            name: csr.metadata.name.unwrap_or_default(),
            signer_name: csr.spec.signer_name,
            usages: csr
                .spec
                .usages
                .unwrap_or_default()
                .iter()
                .filter_map(|u| Usage::parse(u))
                .collect(),
            expiration_seconds: csr.spec.expiration_seconds,
            conditions,
            certificate: status.certificate.map(|c| c.0),
        }
    }
}

#[async_trait]
impl AuthorityClient for KubeAuthority {
    #[instrument(skip_all, fields(%identity))]
    async fn submit(
        &self,
        request: &SigningRequest,
        identity: &str,
        usages: &[Usage],
        expiration_seconds: Option<i32>,
    ) -> Result<AuthorityRecord, Error> {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(identity.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.as_pem().as_bytes().to_vec()),
                signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
                usages: Some(usages.iter().map(|u| u.as_str().to_string()).collect()),
                expiration_seconds,
                ..Default::default()
            },
            status: None,
        };
        let created = self
            .api
            .create(&PostParams::default(), &csr)
            .await
            .map_err(|e| map_err(Operation::Submit, identity, e))?;
        Ok(created.into())
    }

    #[instrument(skip_all, fields(identity=%record.name))]
    async fn approve(&self, record: &AuthorityRecord) -> Result<(), Error> {
        let name = record.name.as_str();
        let mut csr = self
            .api
            .get(name)
            .await
            .map_err(|e| map_err(Operation::Approve, name, e))?;
        let approved = Condition::approved();
        csr.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: approved.type_.as_str().to_string(),
                status: "True".to_string(),
                reason: Some(approved.reason),
                message: Some(approved.message),
                ..Default::default()
            });
        let body = serde_json::to_vec(&csr)
            .map_err(|e| Error::Rejected(Operation::Approve, e.to_string()))?;
        self.api
            .replace_subresource("approval", name, &PostParams::default(), body)
            .await
            .map_err(|e| map_err(Operation::Approve, name, e))?;
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<AuthorityRecord, Error> {
        self.api
            .get(identity)
            .await
            .map(AuthorityRecord::from)
            .map_err(|e| map_err(Operation::Get, identity, e))
    }
}

/// KubeAuthorityFactory connects to the cluster named by each request's admin kubeconfig.
pub struct KubeAuthorityFactory {
    pub call_timeout: Duration,
}

#[async_trait]
impl AuthorityFactory for KubeAuthorityFactory {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn AuthorityClient>, Error> {
        let authority = with_timeout(
            Operation::Connect,
            self.call_timeout,
            KubeAuthority::from_kubeconfig(kubeconfig),
        )
        .await?;
        Ok(Arc::new(authority))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus;
    use serde_json::{Value, json};

    use super::*;
    use crate::authority::APPROVAL_REASON;
    use crate::csr::CertificateRequestSpec;
    use crate::test_helpers::test_key;

    const CSR_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";

    type BoxError = Box<dyn std::error::Error + Send + Sync>;

    #[derive(Debug)]
    struct Seen {
        method: Method,
        path: String,
        body: Value,
    }

    /// fake_cluster answers each request with the next canned response and records what was sent.
    fn fake_cluster(responses: Vec<(StatusCode, Value)>) -> (KubeAuthority, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let responses = Arc::new(Mutex::new(VecDeque::from(responses)));
        let recorder = seen.clone();
        let svc = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let seen = recorder.clone();
            let responses = responses.clone();
            async move {
                let (parts, body) = req.into_parts();
                let body = body.collect().await?.to_bytes();
                let body = if body.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&body)?
                };
                seen.lock().expect("mutex").push(Seen {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    body,
                });
                let (status, reply) = responses
                    .lock()
                    .expect("mutex")
                    .pop_front()
                    .expect("unexpected request");
                let resp = http::Response::builder()
                    .status(status)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(kube::client::Body::from(serde_json::to_vec(&reply)?))?;
                Ok::<_, BoxError>(resp)
            }
        });
        (KubeAuthority::new(Client::new(svc, "default")), seen)
    }

    fn csr_json(name: &str, conditions: Option<Vec<CertificateSigningRequestCondition>>) -> Value {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(b"csr".to_vec()),
                signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
                usages: Some(vec!["client auth".to_string()]),
                ..Default::default()
            },
            status: conditions.map(|c| CertificateSigningRequestStatus {
                conditions: Some(c),
                certificate: None,
            }),
        };
        serde_json::to_value(csr).unwrap()
    }

    fn status_json(code: u16, reason: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": format!("{reason} for test"),
            "reason": reason,
            "code": code,
        })
    }

    fn signing_request() -> SigningRequest {
        CertificateRequestSpec {
            user: "alice".to_string(),
            ..Default::default()
        }
        .signing_request(test_key())
        .unwrap()
    }

    #[tokio::test]
    async fn submit_posts_client_auth_request() {
        let (authority, seen) =
            fake_cluster(vec![(StatusCode::CREATED, csr_json("alice-x7k2", None))]);
        let request = signing_request();
        let record = authority
            .submit(&request, "alice-x7k2", &[Usage::ClientAuth], Some(3600))
            .await
            .unwrap();
        assert_eq!(record.name, "alice-x7k2");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].path, CSR_PATH);
        let body = &seen[0].body;
        assert_eq!(body["kind"], "CertificateSigningRequest");
        assert_eq!(body["metadata"]["name"], "alice-x7k2");
        assert_eq!(body["spec"]["signerName"], KUBE_APISERVER_CLIENT_SIGNER);
        assert_eq!(body["spec"]["usages"], json!(["client auth"]));
        assert_eq!(body["spec"]["expirationSeconds"], 3600);
        let sent = STANDARD
            .decode(body["spec"]["request"].as_str().unwrap())
            .unwrap();
        assert_eq!(sent, request.as_pem().as_bytes());
    }

    #[tokio::test]
    async fn submit_without_expiration() {
        let (authority, seen) =
            fake_cluster(vec![(StatusCode::CREATED, csr_json("alice-x7k2", None))]);
        authority
            .submit(&signing_request(), "alice-x7k2", &[Usage::ClientAuth], None)
            .await
            .unwrap();
        assert!(seen.lock().unwrap()[0].body["spec"].get("expirationSeconds").is_none());
    }

    #[tokio::test]
    async fn approve_updates_approval_subresource() {
        let (authority, seen) = fake_cluster(vec![
            (StatusCode::OK, csr_json("alice-x7k2", None)),
            (StatusCode::OK, csr_json("alice-x7k2", None)),
        ]);
        let record = AuthorityRecord::from(
            serde_json::from_value::<CertificateSigningRequest>(csr_json("alice-x7k2", None))
                .unwrap(),
        );
        authority.approve(&record).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, Method::GET);
        assert_eq!(seen[0].path, format!("{CSR_PATH}/alice-x7k2"));
        assert_eq!(seen[1].method, Method::PUT);
        assert_eq!(seen[1].path, format!("{CSR_PATH}/alice-x7k2/approval"));
        let conditions = seen[1].body["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0]["type"], "Approved");
        assert_eq!(conditions[0]["status"], "True");
        assert_eq!(conditions[0]["reason"], APPROVAL_REASON);
    }

    #[tokio::test]
    async fn get_reads_conditions() {
        let denied = CertificateSigningRequestCondition {
            type_: "Denied".to_string(),
            status: "True".to_string(),
            reason: Some("PolicyDenied".to_string()),
            ..Default::default()
        };
        let (authority, seen) = fake_cluster(vec![(
            StatusCode::OK,
            csr_json("alice-x7k2", Some(vec![denied])),
        )]);
        let record = authority.get("alice-x7k2").await.unwrap();
        assert_eq!(record.conditions[0].type_, ConditionType::Denied);
        assert!(record.rejection().is_some());
        assert_eq!(seen.lock().unwrap()[0].path, format!("{CSR_PATH}/alice-x7k2"));
    }

    #[tokio::test]
    async fn submit_conflict() {
        let (authority, _) =
            fake_cluster(vec![(StatusCode::CONFLICT, status_json(409, "AlreadyExists"))]);
        let err = authority
            .submit(&signing_request(), "alice-x7k2", &[Usage::ClientAuth], None)
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::AlreadyExists(n) if n == "alice-x7k2"), "{err}");
    }

    #[tokio::test]
    async fn get_missing() {
        let (authority, _) = fake_cluster(vec![(StatusCode::NOT_FOUND, status_json(404, "NotFound"))]);
        let err = authority.get("alice-x7k2").await.unwrap_err();
        assert!(matches!(&err, Error::NotFound(n) if n == "alice-x7k2"), "{err}");
    }

    #[tokio::test]
    async fn approve_forbidden() {
        let (authority, _) = fake_cluster(vec![
            (StatusCode::OK, csr_json("alice-x7k2", None)),
            (StatusCode::FORBIDDEN, status_json(403, "Forbidden")),
        ]);
        let record = AuthorityRecord {
            name: "alice-x7k2".to_string(),
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            usages: vec![Usage::ClientAuth],
            expiration_seconds: None,
            conditions: vec![],
            certificate: None,
        };
        let err = authority.approve(&record).await.unwrap_err();
        assert!(
            matches!(&err, Error::Rejected(Operation::Approve, m) if m.contains("Forbidden")),
            "{err}"
        );
    }

    #[test]
    fn record_from_csr() {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("alice-x7k2".to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
                usages: Some(vec!["client auth".to_string(), "bogus".to_string()]),
                expiration_seconds: Some(3600),
                ..Default::default()
            },
            status: Some(CertificateSigningRequestStatus {
                certificate: Some(ByteString(b"cert".to_vec())),
                conditions: Some(vec![
                    CertificateSigningRequestCondition {
                        type_: "Approved".to_string(),
                        status: "True".to_string(),
                        reason: Some("KubecsrApprove".to_string()),
                        ..Default::default()
                    },
                    CertificateSigningRequestCondition {
                        type_: "SomethingNew".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    },
                ]),
            }),
        };
        let record = AuthorityRecord::from(csr);
        assert_eq!(record.name, "alice-x7k2");
        assert_eq!(record.usages, vec![Usage::ClientAuth]);
        assert_eq!(record.expiration_seconds, Some(3600));
        assert_eq!(record.conditions.len(), 1);
        assert_eq!(record.conditions[0].type_, ConditionType::Approved);
        assert_eq!(record.certificate(), Some(b"cert".as_slice()));
        assert_eq!(record.rejection(), None);
    }

    #[test]
    fn record_without_status() {
        let record = AuthorityRecord::from(CertificateSigningRequest::default());
        assert!(record.certificate().is_none());
        assert!(record.conditions.is_empty());
    }
}
