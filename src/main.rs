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

use kubecsr::*;
use tracing::info;

fn main() -> anyhow::Result<()> {
    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => (),
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    telemetry::setup_logging();
    let config = config::parse_config()?;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_worker_threads)
        .thread_name("kubecsr-worker")
        .enable_all()
        .build()?
        .block_on(async move { serve(config).await })
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
kubecsr ({version})

Commands:
serve (default) - Start the certificate issuance server
version         - Print the version of kubecsr
help            - Print commands and version of kubecsr"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build(cfg).await?.wait_termination().await
}
