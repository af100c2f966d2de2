// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::api::session::SessionContext;
use crate::broadcast::IdGenerator;
use crate::common::config::Config;
use crate::device::DeviceRegistry;
use crate::procscan::ProcScanManager;
use crate::sampler::SamplerManager;

/// State shared by every HTTP handler and WebSocket session.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: DeviceRegistry,
    pub sampler: Arc<SamplerManager>,
    pub procs: Arc<ProcScanManager>,
    /// One permit per admitted WebSocket session.
    pub sessions: Arc<Semaphore>,
    pub session_ids: IdGenerator,
    /// Cancelled on server shutdown; every session listens on a child token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Ok,
    Initializing,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub status: ReadyStatus,
    pub gpus: usize,
    pub metrics_readers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: DeviceRegistry,
        sampler: Arc<SamplerManager>,
        procs: Arc<ProcScanManager>,
        shutdown: CancellationToken,
    ) -> Self {
        let max_clients = config.ws.max_clients;
        Self {
            config: Arc::new(config),
            registry,
            sampler,
            procs,
            sessions: Arc::new(Semaphore::new(max_clients)),
            session_ids: IdGenerator::default(),
            shutdown,
        }
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            sampler: self.sampler.clone(),
            procs: self.procs.clone(),
            preferred_gpu: self.config.preferred_gpu().map(str::to_string),
            write_timeout: self.config.ws.write_timeout,
        }
    }

    /// A host without GPUs is ready; GPUs without a working reader are
    /// degraded; otherwise ready once every reader produced a sample.
    pub fn readiness(&self) -> Readiness {
        let gpus = self.registry.len();
        let metrics_readers = self.sampler.device_ids().len();
        let (status, reason) = if gpus == 0 {
            (ReadyStatus::Ok, None)
        } else if metrics_readers == 0 {
            (ReadyStatus::Degraded, Some("no_metrics_readers"))
        } else if self.sampler.ready() {
            (ReadyStatus::Ok, None)
        } else {
            (ReadyStatus::Initializing, Some("waiting_for_samples"))
        };
        Readiness {
            status,
            gpus,
            metrics_readers,
            reason,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.config
            .ws
            .max_clients
            .saturating_sub(self.sessions.available_permits())
    }
}
