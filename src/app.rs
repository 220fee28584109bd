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
use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::time;
use tracing::{info, warn};

use crate::auth::TokenAuth;
use crate::authority::mock::{MockAuthority, MockAuthorityFactory, MockConfig};
use crate::authority::{AuthorityFactory, KubeAuthorityFactory};
use crate::issuance::Issuer;
use crate::kubeconfig::CredentialDir;
use crate::metrics::Metrics;
use crate::{admin, api, config, drain, signal, tls};

pub async fn build(config: config::Config) -> anyhow::Result<Bound> {
    tls::install_crypto_provider();

    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));
    let registry = Arc::new(registry);

    let shutdown = signal::Shutdown::new();
    // Setup a drain channel. drain_tx is used to trigger a drain, which will complete
    // once all drain_rx handlers are dropped.
    // Any component which wants time to gracefully exit should take in a drain_rx clone,
    // await drain_rx.wait_for_drain(), then cleanup.
    // Note: there is still a hard timeout if the draining takes too long
    let (drain_tx, drain_rx) = drain::new();

    let credentials = CredentialDir::create(&config.credential_dir)
        .await
        .context("credential directory")?;

    let authorities: Arc<dyn AuthorityFactory> = if config.fake_authority {
        warn!("using the fake certificate authority, issued credentials will not work");
        let authority = MockAuthority::new(MockConfig::default()).context("fake authority")?;
        Arc::new(MockAuthorityFactory::new(Arc::new(authority)))
    } else {
        Arc::new(KubeAuthorityFactory {
            call_timeout: config.poll.call_timeout,
        })
    };

    let issuer = Issuer::new(
        authorities,
        credentials,
        config.poll,
        config.key_bits,
        config.default_expiration_seconds,
        metrics,
    );

    let admin_server = admin::Service::new(
        config.clone(),
        registry,
        shutdown.trigger(),
        drain_rx.clone(),
    )
    .await
    .context("admin server starts")?;
    let admin_address = admin_server.address();

    let state = api::State {
        issuer: Arc::new(issuer),
        auth: TokenAuth::from_secret(config.api_token.as_deref()),
        max_body_bytes: config.max_body_bytes,
    };
    let mut api_server = api::Service::new(config.listen_addr, state, drain_rx.clone())
        .await
        .context("api server starts")?;
    if let Some(files) = &config.tls {
        api_server = api_server.with_tls(tls::acceptor(files).context("api tls")?);
    }
    let api_address = api_server.address();

    // The servers hold their own watchers; ours would otherwise block the drain.
    drop(drain_rx);
    admin_server.spawn();
    api_server.spawn();

    info!(%api_address, %admin_address, "kubecsr running");
    Ok(Bound {
        api_address,
        admin_address,
        shutdown,
        config,
        drain_tx,
    })
}

pub struct Bound {
    pub api_address: SocketAddr,
    pub admin_address: SocketAddr,

    pub shutdown: signal::Shutdown,
    config: config::Config,
    drain_tx: drain::DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from explicit admin shutdown or signal
        self.shutdown.wait().await;

        // Start a drain; this will wait for all drain_rx handles to be dropped before completing,
        // allowing components to terminate.
        // If they take too long, terminate anyways.
        match time::timeout(
            self.config.termination_grace_period,
            self.drain_tx.start_drain_and_wait(),
        )
        .await
        {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                self.config.termination_grace_period
            ),
        }
        Ok(())
    }
}
