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

// Forked from https://github.com/olix0r/kubert/blob/main/kubert/src/admin.rs

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use prometheus_client::registry::Registry;

use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, empty_response, json_response, plaintext_response};
use crate::version::BuildInfo;
use crate::{signal, telemetry};

struct State {
    config: Config,
    registry: Arc<Registry>,
    shutdown_trigger: signal::ShutdownTrigger,
}

pub struct Service {
    s: hyper_util::Server<State>,
}

#[derive(serde::Serialize, Debug, Clone)]
pub struct ConfigDump {
    version: BuildInfo,
    config: Config,
}

impl Service {
    pub async fn new(
        config: Config,
        registry: Arc<Registry>,
        shutdown_trigger: signal::ShutdownTrigger,
        drain_rx: DrainWatcher,
    ) -> anyhow::Result<Self> {
        let state = State {
            config: config.clone(),
            registry,
            shutdown_trigger,
        };
        hyper_util::Server::bind("admin", config.admin_addr, drain_rx, state)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|state, req: Request<Incoming>, _peer| async move {
            handle(&state, req).await
        })
    }
}

async fn handle<B>(state: &State, req: Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz/ready" => plaintext_response(hyper::StatusCode::OK, "ready\n".into()),
        "/metrics" => crate::metrics::handle_metrics(&state.registry, &req),
        "/quitquitquit" => handle_server_shutdown(&state.shutdown_trigger, req).await,
        "/config_dump" => handle_config_dump(&state.config, req),
        "/logging" => handle_logging(req),
        _ => empty_response(hyper::StatusCode::NOT_FOUND),
    }
}

async fn handle_server_shutdown<B>(
    shutdown_trigger: &signal::ShutdownTrigger,
    req: Request<B>,
) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(hyper::StatusCode::OK, "shutdown now\n".into())
        }
        _ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn handle_config_dump<B>(config: &Config, _req: Request<B>) -> Response<Full<Bytes>> {
    let dump = ConfigDump {
        version: BuildInfo::new(),
        config: config.clone(),
    };
    json_response(hyper::StatusCode::OK, &dump)
}

//mirror envoy's behavior: https://www.envoyproxy.io/docs/envoy/latest/operations/admin#post--logging
//NOTE: multiple query parameters is not supported, for example
//curl -X POST http://127.0.0.1:15000/logging?"issuance=debug&waiter=debug"
static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. kubecsr::issuance
";

fn handle_logging<B>(req: Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::POST => {
            let qp: HashMap<String, String> = req
                .uri()
                .query()
                .map(|v| {
                    url::form_urlencoded::parse(v.as_bytes())
                        .into_owned()
                        .collect()
                })
                .unwrap_or_default();
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").cloned();
            if level.is_some() || reset.is_some() {
                change_log_level(reset.is_some(), &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            hyper::StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Full<Bytes>> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => plaintext_response(
            hyper::StatusCode::OK,
            format!("current log level is {loglevel}\n"),
        ),
        Err(err) => plaintext_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Full<Bytes>> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            hyper::StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;

    use super::*;
    use crate::metrics::Metrics;
    use crate::test_helpers::{initialize_telemetry, test_config};

    fn state(trigger: signal::ShutdownTrigger) -> State {
        let mut registry = Registry::default();
        let _metrics = Metrics::from(&mut registry);
        State {
            config: test_config(),
            registry: Arc::new(registry),
            shutdown_trigger: trigger,
        }
    }

    fn request(method: hyper::Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn config_dump() {
        let shutdown = signal::Shutdown::new();
        let state = state(shutdown.trigger());
        let resp = handle(&state, request(hyper::Method::GET, "/config_dump")).await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        let dump: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(dump["version"]["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(dump["config"]["fake_authority"], true);
        assert!(dump["config"].get("api_token").is_none());
    }

    #[tokio::test]
    async fn quitquitquit() {
        let shutdown = signal::Shutdown::new();
        let state = state(shutdown.trigger());
        let resp = handle(&state, request(hyper::Method::GET, "/quitquitquit")).await;
        assert_eq!(resp.status(), hyper::StatusCode::METHOD_NOT_ALLOWED);

        let resp = handle(&state, request(hyper::Method::POST, "/quitquitquit")).await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn metrics_and_ready() {
        let state = state(signal::Shutdown::new().trigger());
        let resp = handle(&state, request(hyper::Method::GET, "/metrics")).await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        assert!(body_string(resp).await.contains("kubecsr_issuance_duration_seconds"));

        let resp = handle(&state, request(hyper::Method::GET, "/healthz/ready")).await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);

        let resp = handle(&state, request(hyper::Method::GET, "/nope")).await;
        assert_eq!(resp.status(), hyper::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logging() {
        initialize_telemetry();
        let state = state(signal::Shutdown::new().trigger());
        let resp = handle(&state, request(hyper::Method::GET, "/logging")).await;
        assert_eq!(resp.status(), hyper::StatusCode::METHOD_NOT_ALLOWED);

        let resp = handle(
            &state,
            request(hyper::Method::POST, "/logging?level=kubecsr::waiter=trace"),
        )
        .await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        assert!(body_string(resp).await.contains("kubecsr::waiter=trace"));

        let resp = handle(
            &state,
            request(hyper::Method::POST, "/logging?level=kubecsr=bogus"),
        )
        .await;
        assert_eq!(resp.status(), hyper::StatusCode::BAD_REQUEST);
    }
}
