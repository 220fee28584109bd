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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::authority::mock::{MockAuthority, MockAuthorityFactory, MockConfig};
use crate::config::Config;
use crate::csr::KeyPair;
use crate::issuance::Issuer;
use crate::kubeconfig::CredentialDir;
use crate::metrics::Metrics;
use crate::telemetry;
use crate::waiter::PollPolicy;

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

// Generating RSA keys is slow; share one across tests.
static TEST_KEY: Lazy<KeyPair> =
    Lazy::new(|| KeyPair::generate(2048).expect("test key generation"));

pub fn test_key() -> &'static KeyPair {
    &TEST_KEY
}

pub const TEST_API_TOKEN: &str = "test-token";

/// admin_kubeconfig is a minimal kubeconfig for a cluster named `c1`.
pub fn admin_kubeconfig() -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: c1
  cluster:
    server: https://cluster:6443
    certificate-authority-data: {}
contexts:
- name: admin@c1
  context:
    cluster: c1
    user: admin
current-context: admin@c1
users:
- name: admin
  user:
    token: admin-token
"#,
        STANDARD.encode("-----BEGIN CERTIFICATE-----\nZmFrZQ==\n-----END CERTIFICATE-----\n")
    )
}

pub fn encoded_admin_kubeconfig() -> String {
    STANDARD.encode(admin_kubeconfig())
}

pub fn encoded_kubeconfig_without_clusters() -> String {
    STANDARD.encode(
        r#"apiVersion: v1
kind: Config
contexts:
- name: admin@c1
  context:
    cluster: c1
    user: admin
current-context: admin@c1
"#,
    )
}

/// temp_dir creates a fresh directory under the system temp dir.
pub fn temp_dir() -> PathBuf {
    let name: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let dir = std::env::temp_dir().join(format!("kubecsr-test-{name}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn test_poll_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(10),
        attempts: 20,
        call_timeout: Duration::from_secs(5),
    }
}

/// test_issuer builds an Issuer backed by a fresh mock authority.
pub async fn test_issuer(cfg: MockConfig) -> (Issuer, Arc<MockAuthorityFactory>) {
    let authority = Arc::new(MockAuthority::new(cfg).expect("mock authority"));
    let factory = Arc::new(MockAuthorityFactory::new(authority));
    let credentials = CredentialDir::create(temp_dir())
        .await
        .expect("credential dir");
    let issuer = Issuer::new(
        factory.clone(),
        credentials,
        PollPolicy::default(),
        2048,
        None,
        Arc::new(Metrics::default()),
    );
    (issuer, factory)
}

/// test_config serves both servers on ephemeral loopback ports with the fake authority.
pub fn test_config() -> Config {
    let loopback: SocketAddr = "127.0.0.1:0".parse().expect("loopback address");
    Config {
        listen_addr: loopback,
        admin_addr: loopback,
        tls: None,
        api_token: Some(TEST_API_TOKEN.to_string()),
        credential_dir: temp_dir(),
        key_bits: 2048,
        poll: test_poll_policy(),
        default_expiration_seconds: None,
        max_body_bytes: 1024 * 1024,
        fake_authority: true,
        termination_grace_period: Duration::from_secs(1),
        num_worker_threads: 1,
    }
}
