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

use std::fmt::Write;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};

use crate::issuance::Stage;

/// Issuance metrics, registered under the "kubecsr" prefix.
pub struct Metrics {
    requests: Family<IssuanceLabels, Counter>,
    duration: Family<OutcomeLabels, Histogram>,
}

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub enum Outcome {
    Success,
    Failure,
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        })
    }
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
pub struct IssuanceLabels {
    pub outcome: Outcome,
    /// The last stage reached; `recorded` for successful requests.
    pub stage: Stage,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

/// Issuance describes a finished request.
#[derive(Clone, Debug)]
pub struct Issuance {
    pub outcome: Outcome,
    pub stage: Stage,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let requests = Family::<IssuanceLabels, Counter>::default();
        registry.register(
            "issuance_requests",
            "Total number of certificate issuance requests",
            requests.clone(),
        );
        let duration = Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.05, 2.0, 10))
        });
        registry.register_with_unit(
            "issuance_duration",
            "Time taken to serve a certificate issuance request",
            Unit::Seconds,
            duration.clone(),
        );
        Self { requests, duration }
    }

    pub fn requests(&self, outcome: Outcome, stage: Stage) -> u64 {
        self.requests
            .get_or_create(&IssuanceLabels { outcome, stage })
            .get()
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix("kubecsr"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

impl Recorder<Issuance, Duration> for Metrics {
    fn record(&self, event: &Issuance, elapsed: Duration) {
        self.requests
            .get_or_create(&IssuanceLabels {
                outcome: event.outcome,
                stage: event.stage,
            })
            .inc();
        self.duration
            .get_or_create(&OutcomeLabels {
                outcome: event.outcome,
            })
            .observe(elapsed.as_secs_f64());
    }
}

/// handle_metrics renders the registry in the text format the client asked for.
pub fn handle_metrics<T>(reg: &Registry, req: &Request<T>) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    if let Err(err) = encode(&mut buf, reg) {
        return Response::builder()
            .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
            .body(err.to_string().into())
            .expect("builder with known status code should not fail");
    }

    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type(req))
        .body(buf.into())
        .expect("builder with known status code should not fail")
}

#[derive(Default)]
enum ContentType {
    #[default]
    PlainText,
    OpenMetrics,
}

impl From<ContentType> for &str {
    fn from(c: ContentType) -> Self {
        match c {
            ContentType::PlainText => "text/plain; charset=utf-8",
            ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
        }
    }
}

fn content_type<T>(req: &Request<T>) -> &'static str {
    req.headers()
        .get_all(http::header::ACCEPT)
        .iter()
        .find_map(|v| {
            let v = v.to_str().unwrap_or_default().to_lowercase();
            match v.split(';').next() {
                Some("application/openmetrics-text") => Some(ContentType::OpenMetrics),
                _ => None,
            }
        })
        .unwrap_or_default()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcome_and_stage() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        metrics.record(
            &Issuance {
                outcome: Outcome::Failure,
                stage: Stage::Polling,
            },
            Duration::from_millis(520),
        );
        assert_eq!(metrics.requests(Outcome::Failure, Stage::Polling), 1);
        assert_eq!(metrics.requests(Outcome::Success, Stage::Recorded), 0);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(
            buf.contains(r#"kubecsr_issuance_requests_total{outcome="failure",stage="polling"} 1"#),
            "{buf}"
        );
        assert!(buf.contains("kubecsr_issuance_duration_seconds_count"));
    }

    #[test]
    fn test_content_type() {
        let plain_text_req = http::Request::new("I want some plain text");
        assert_eq!(content_type(&plain_text_req), "text/plain; charset=utf-8");

        let openmetrics_req = http::Request::builder()
            .header("Accept", "application/json")
            .header("Accept", "application/openmetrics-text; other stuff")
            .body("I would like openmetrics")
            .unwrap();
        assert_eq!(
            content_type(&openmetrics_req),
            "application/openmetrics-text;charset=utf-8;version=1.0.0"
        );
    }
}
