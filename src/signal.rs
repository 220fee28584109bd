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

use tokio::sync::mpsc;
use tracing::info;

/// Shutdown completes once the process receives SIGINT/SIGTERM or any ShutdownTrigger fires.
pub struct Shutdown {
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Shutdown {
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a handle to trigger shutdown programmatically.
    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Wait for a signal or an explicit trigger.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = imp::shutdown() => {}
            _ = self.shutdown_rx.recv() => {
                info!("received explicit shutdown request");
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
    pub async fn shutdown_now(&self) {
        // A full channel means a shutdown is already pending.
        let _ = self.shutdown_tx.try_send(());
    }
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            () = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
            () = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn watch_signal(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut s) => {
                s.recv().await;
                info!("received signal {name}, starting shutdown");
            }
            Err(e) => {
                error!("failed to register {name} handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::error;

    pub(super) async fn shutdown() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to register ctrl-c handler: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_completes_wait() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.trigger();
        trigger.shutdown_now().await;
        // Triggering twice must not block.
        trigger.shutdown_now().await;
        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .unwrap();
    }
}
