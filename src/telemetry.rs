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

use std::env;
use std::fmt::Debug;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{Event, Subscriber, field, info, warn};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter, filter::EnvFilter, prelude::*, reload};

static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

// Directives applied before RUST_LOG. The kube client and hyper are chatty at debug.
const DEFAULT_DIRECTIVES: &str = "info,kube_client=warn,hyper_util=warn";

pub fn setup_logging() {
    tracing_subscriber::registry().with(fmt_layer()).init();
}

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    let format = tracing_subscriber::fmt::layer()
        .event_format(format)
        .fmt_fields(format::JsonFields::default());
    Box::new(format)
}

fn plain_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::layer()
        .event_format(PlainFormat)
        .fmt_fields(PlainFormat);
    Box::new(format)
}

fn fmt_layer() -> BoxLayer {
    let format = if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        json_fmt()
    } else {
        plain_fmt()
    };
    let (layer, reload) = reload::Layer::new(format.with_filter(default_env_filter()));
    LOG_HANDLE
        .set(reload)
        .map_or_else(|_| warn!("setup log handler failed"), |_| {});
    Box::new(layer)
}

fn default_env_filter() -> EnvFilter {
    let directives = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(v) if !v.is_empty() => format!("{DEFAULT_DIRECTIVES},{v}"),
        _ => DEFAULT_DIRECTIVES.to_string(),
    };
    EnvFilter::builder()
        .with_regex(false)
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("ignoring invalid {}: {e}", EnvFilter::DEFAULT_ENV);
            EnvFilter::new(DEFAULT_DIRECTIVES)
        })
}

// a handle to get and set the log level
type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// set_level dynamically updates the logging level to *include* level. If `reset` is true, it will
/// reset the entire logging configuration first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let Some(handle) = LOG_HANDLE.get() else {
        warn!("failed to get log handle");
        return Err(Error::Uninitialized);
    };
    let new_directive = match handle.with_current(|f| f.filter().to_string()) {
        Ok(_) if reset => format!("{},{}", default_env_filter(), level),
        Ok(current) => format!("{current},{level}"),
        Err(_) => level.to_string(),
    };

    // duplicates are fine, EnvFilter keeps the last one
    let new_filter = EnvFilter::builder().parse(new_directive)?;
    info!("new log filter is {new_filter}");

    Ok(handle.modify(|layer| {
        *layer.filter_mut() = new_filter;
    })?)
}

pub fn get_current_loglevel() -> Result<String, Error> {
    let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
    Ok(handle.with_current(|f| f.filter().to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
}

/// PlainFormat writes one tab separated line per event: time, level, target with its spans, then
/// the message followed by `key=value` fields.
struct PlainFormat;

struct FieldWriter<'w> {
    writer: Writer<'w>,
    res: std::fmt::Result,
    first: bool,
}

impl field::Visit for FieldWriter<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        let sep = if std::mem::take(&mut self.first) { "" } else { " " };
        self.res = match field.name() {
            "message" => write!(self.writer, "{sep}{value:?}"),
            name => write!(self.writer, "{sep}{name}={value:?}"),
        };
    }
}

impl<'w> FormatFields<'w> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'w>,
        fields: R,
    ) -> std::fmt::Result {
        let mut fw = FieldWriter {
            writer,
            res: Ok(()),
            first: true,
        };
        fields.record(&mut fw);
        fw.res
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Records forwarded from the `log` crate carry their real metadata separately.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        let target = meta.target();
        write!(
            writer,
            "\t{}\t{}",
            meta.level().as_str().to_ascii_lowercase(),
            target.strip_prefix("kubecsr::").unwrap_or(target),
        )?;
        for span in ctx.event_scope().into_iter().flat_map(|s| s.from_root()) {
            write!(writer, ":{}", span.metadata().name())?;
            if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(writer, "{{{fields}}}")?;
                }
            }
        }
        write!(writer, "\t")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test_helpers::initialize_telemetry;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("mutex").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn plain_line() {
        let sink = Sink::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(PlainFormat)
                .fmt_fields(PlainFormat)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("issue", user = "alice");
            let _entered = span.enter();
            info!(stage = "submitted", "moved on");
        });

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let cols: Vec<&str> = out.trim_end().split('\t').collect();
        assert_eq!(cols.len(), 4, "{out}");
        assert_eq!(cols[1], "info");
        assert_eq!(cols[2], "telemetry::tests:issue{user=\"alice\"}");
        assert_eq!(cols[3], "moved on stage=\"submitted\"");
    }

    #[test]
    fn change_level() {
        initialize_telemetry();
        set_level(false, "kubecsr::issuance=debug").unwrap();
        let current = get_current_loglevel().unwrap();
        assert!(current.contains("kubecsr::issuance=debug"), "{current}");
        assert!(set_level(false, "kubecsr=notalevel").is_err());
    }
}
