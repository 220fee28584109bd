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

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use tracing::{debug, info};

use super::{
    AuthorityClient, AuthorityFactory, AuthorityRecord, Condition, ConditionType, Error,
    KUBE_APISERVER_CLIENT_SIGNER, Operation, Usage,
};
use crate::csr::SigningRequest;

/// MockConfig controls how a MockAuthority reacts to requests.
#[derive(Clone, Debug)]
pub struct MockConfig {
    /// Number of gets after approval before the certificate shows up.
    pub ready_after: usize,
    pub never_ready: bool,
    pub reject_submit: bool,
    pub reject_approve: bool,
    /// Deny requests instead of signing them.
    pub deny: bool,
    /// Added to every get, to simulate a slow authority.
    pub get_delay: Duration,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            ready_after: 1,
            never_ready: false,
            reject_submit: false,
            reject_approve: false,
            deny: false,
            get_delay: Duration::ZERO,
        }
    }
}

struct Entry {
    record: AuthorityRecord,
    request: String,
    approved: bool,
    gets: usize,
}

/// MockAuthority is an in-memory certificate authority. It signs with a self signed CA, so issued
/// certificates are real.
pub struct MockAuthority {
    cfg: MockConfig,
    ca_cert: Certificate,
    ca_key: KeyPair,
    entries: Mutex<HashMap<String, Entry>>,
    submits: AtomicUsize,
    approves: AtomicUsize,
    gets: AtomicUsize,
}

impl MockAuthority {
    pub fn new(cfg: MockConfig) -> Result<MockAuthority, rcgen::Error> {
        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "kubecsr-mock-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(MockAuthority {
            cfg,
            ca_cert,
            ca_key,
            entries: Mutex::new(HashMap::new()),
            submits: AtomicUsize::new(0),
            approves: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        })
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn approves(&self) -> usize {
        self.approves.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn record(&self, identity: &str) -> Option<AuthorityRecord> {
        let entries = self.entries.lock().expect("mutex");
        entries.get(identity).map(|e| e.record.clone())
    }

    /// request returns the PEM signing request submitted under `identity`.
    pub fn request(&self, identity: &str) -> Option<String> {
        let entries = self.entries.lock().expect("mutex");
        entries.get(identity).map(|e| e.request.clone())
    }

    fn sign(&self, request: &str) -> Result<Vec<u8>, Error> {
        let params = CertificateSigningRequestParams::from_pem(request)
            .map_err(|e| Error::Rejected(Operation::Get, e.to_string()))?;
        let cert = params
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Rejected(Operation::Get, e.to_string()))?;
        Ok(cert.pem().into_bytes())
    }
}

#[async_trait]
impl AuthorityClient for MockAuthority {
    async fn submit(
        &self,
        request: &SigningRequest,
        identity: &str,
        usages: &[Usage],
        expiration_seconds: Option<i32>,
    ) -> Result<AuthorityRecord, Error> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.cfg.reject_submit {
            return Err(Error::Rejected(
                Operation::Submit,
                "forbidden by mock".to_string(),
            ));
        }
        let mut entries = self.entries.lock().expect("mutex");
        if entries.contains_key(identity) {
            return Err(Error::AlreadyExists(identity.to_string()));
        }
        let record = AuthorityRecord {
            name: identity.to_string(),
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            usages: usages.to_vec(),
            expiration_seconds,
            conditions: vec![],
            certificate: None,
        };
        entries.insert(
            identity.to_string(),
            Entry {
                record: record.clone(),
                request: request.as_pem().to_string(),
                approved: false,
                gets: 0,
            },
        );
        debug!(identity, "mock authority accepted request");
        Ok(record)
    }

    async fn approve(&self, record: &AuthorityRecord) -> Result<(), Error> {
        self.approves.fetch_add(1, Ordering::SeqCst);
        if self.cfg.reject_approve {
            return Err(Error::Rejected(
                Operation::Approve,
                "forbidden by mock".to_string(),
            ));
        }
        let mut entries = self.entries.lock().expect("mutex");
        let entry = entries
            .get_mut(&record.name)
            .ok_or_else(|| Error::NotFound(record.name.clone()))?;
        entry.approved = true;
        entry.record.conditions.push(Condition::approved());
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<AuthorityRecord, Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.cfg.get_delay.is_zero() {
            tokio::time::sleep(self.cfg.get_delay).await;
        }
        let request = {
            let mut entries = self.entries.lock().expect("mutex");
            let entry = entries
                .get_mut(identity)
                .ok_or_else(|| Error::NotFound(identity.to_string()))?;
            if !entry.approved {
                return Ok(entry.record.clone());
            }
            entry.gets += 1;
            if self.cfg.deny && entry.record.rejection().is_none() {
                entry.record.conditions.push(Condition {
                    type_: ConditionType::Denied,
                    status: true,
                    reason: "MockDenied".to_string(),
                    message: "denied by mock".to_string(),
                });
            }
            let due = !self.cfg.deny
                && !self.cfg.never_ready
                && entry.record.certificate.is_none()
                && entry.gets >= self.cfg.ready_after;
            if !due {
                return Ok(entry.record.clone());
            }
            entry.request.clone()
        };
        // Sign outside the lock; a concurrent get for the same name just signs again.
        let certificate = self.sign(&request)?;
        let mut entries = self.entries.lock().expect("mutex");
        let entry = entries
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        if entry.record.certificate.is_none() {
            entry.record.certificate = Some(certificate);
        }
        Ok(entry.record.clone())
    }
}

/// MockAuthorityFactory hands out the same MockAuthority for every kubeconfig.
pub struct MockAuthorityFactory {
    authority: Arc<MockAuthority>,
    connects: AtomicUsize,
}

impl MockAuthorityFactory {
    pub fn new(authority: Arc<MockAuthority>) -> MockAuthorityFactory {
        MockAuthorityFactory {
            authority,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn authority(&self) -> &Arc<MockAuthority> {
        &self.authority
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorityFactory for MockAuthorityFactory {
    async fn connect(&self, kubeconfig: &Path) -> Result<Arc<dyn AuthorityClient>, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // The real client reads the file too; make sure it was actually written.
        tokio::fs::metadata(kubeconfig)
            .await
            .map_err(|e| Error::Connect(format!("{}: {e}", kubeconfig.display())))?;
        info!(kubeconfig=%kubeconfig.display(), "using fake certificate authority");
        Ok(self.authority.clone())
    }
}
