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

//! One viewer connection: a reader task, a writer task and the orchestrator
//! that multiplexes the two manager subscriptions onto the outbound queue.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::messages::{parse_client_message, ClientMessage, ProtocolError, ServerMessage};
use crate::api::transport::{FrameSink, FrameSource};
use crate::broadcast::{coalescing_queue, CoalescingQueue, QueueReceiver, Subscription};
use crate::common::config::AppConfig;
use crate::device::DeviceRegistry;
use crate::error::{Error, Result};
use crate::procscan::{ProcScanManager, ProcessSubscription};
use crate::sampler::{MetricsSubscription, SamplerManager};

/// Everything a session needs from the server, cloned once per connection.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: DeviceRegistry,
    pub sampler: Arc<SamplerManager>,
    pub procs: Arc<ProcScanManager>,
    pub preferred_gpu: Option<String>,
    pub write_timeout: Duration,
}

impl SessionContext {
    fn hello(&self) -> ServerMessage {
        let interval_ms = u64::try_from(self.sampler.interval().as_millis()).unwrap_or(u64::MAX);
        ServerMessage::Hello {
            interval_ms,
            gpus: self.registry.descriptors().to_vec(),
            features: BTreeMap::from([("procs".to_string(), self.procs.enabled())]),
        }
    }

    fn default_device(&self) -> Option<String> {
        self.registry
            .default_device(self.preferred_gpu.as_deref())
            .map(|device| device.id.clone())
    }
}

/// Drive one session until the peer goes away, a write fails or `cancel`
/// fires. Both subscriptions are released before this returns.
pub async fn run_session<S, K>(
    ctx: SessionContext,
    session_id: u64,
    source: S,
    sink: K,
    cancel: CancellationToken,
) where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let cancel = cancel.child_token();
    let (outbound, outbound_rx) = coalescing_queue(AppConfig::OUTBOUND_QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(AppConfig::INBOUND_CHANNEL_CAPACITY);

    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        ctx.write_timeout,
        cancel.clone(),
        session_id,
    ));
    let reader = tokio::spawn(read_loop(source, inbound_tx, cancel.clone(), session_id));

    tracing::info!(session_id, "session opened");
    let mut session = Session {
        ctx,
        id: session_id,
        outbound,
        stats: None,
        procs: None,
        current: None,
    };
    if session.start() {
        session.run(inbound_rx, &cancel).await;
    }
    session.teardown();

    if let Err(e) = writer.await {
        tracing::error!(session_id, error = %e, "session writer terminated abnormally");
    }
    cancel.cancel();
    if let Err(e) = reader.await {
        tracing::error!(session_id, error = %e, "session reader terminated abnormally");
    }
    tracing::info!(session_id, "session closed");
}

struct Session {
    ctx: SessionContext,
    id: u64,
    outbound: CoalescingQueue<String>,
    stats: Option<MetricsSubscription>,
    procs: Option<ProcessSubscription>,
    current: Option<String>,
}

impl Session {
    /// Send `hello` and bind to the default device. Returns false when the
    /// outbound queue is already gone.
    fn start(&mut self) -> bool {
        if !self.send(self.ctx.hello()) {
            return false;
        }

        if let Some(preferred) = self.ctx.preferred_gpu.as_deref() {
            if !self.ctx.registry.contains(preferred) {
                tracing::warn!(session_id = self.id, gpu_id = %preferred, "configured default gpu not found");
            }
        }

        match self.ctx.default_device() {
            Some(device_id) => {
                if let Err(e) = self.switch_device(&device_id) {
                    tracing::warn!(session_id = self.id, gpu_id = %device_id, error = %e, "failed to subscribe default gpu");
                    return self.send(ServerMessage::error(format!(
                        "failed to subscribe default gpu: {e}"
                    )));
                }
                true
            }
            None => self.send(ServerMessage::error("no GPUs detected")),
        }
    }

    async fn run(&mut self, mut inbound: mpsc::Receiver<String>, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                update = next_update(&mut self.stats) => match update {
                    Some(snapshot) => {
                        if !self.send(ServerMessage::Stats(snapshot)) {
                            return;
                        }
                    }
                    None => {
                        self.stats = None;
                        if self.procs.is_none() {
                            self.current = None;
                        }
                    }
                },
                update = next_update(&mut self.procs) => match update {
                    Some(snapshot) => {
                        if !self.send(ServerMessage::Procs(snapshot)) {
                            return;
                        }
                    }
                    None => {
                        self.procs = None;
                        if self.stats.is_none() {
                            self.current = None;
                        }
                    }
                },
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        if !self.handle_frame(&text) {
                            return;
                        }
                    }
                    // Reader finished: peer closed or the read failed.
                    None => return,
                },
            }
        }
    }

    /// Apply one inbound frame. Returns false when the session must end.
    fn handle_frame(&mut self, text: &str) -> bool {
        match parse_client_message(text) {
            Ok(ClientMessage::Subscribe { gpu_id }) => {
                let Some(target) = gpu_id.or_else(|| self.ctx.default_device()) else {
                    return self.send(ServerMessage::error(
                        "no gpu_id provided and no default available",
                    ));
                };
                match self.switch_device(&target) {
                    Ok(()) => true,
                    Err(e) => self.send(ServerMessage::error(e.to_string())),
                }
            }
            Ok(ClientMessage::Ping) => self.send(ServerMessage::Pong),
            Ok(ClientMessage::Unknown(kind)) => {
                tracing::debug!(session_id = self.id, kind = %kind, "unknown message type");
                true
            }
            Err(ProtocolError::Malformed) => {
                tracing::debug!(session_id = self.id, "invalid client message");
                true
            }
            Err(e @ ProtocolError::InvalidSubscribe) => self.send(ServerMessage::error(e.to_string())),
        }
    }

    /// Rebind both streams to `device_id`. The old subscriptions are released
    /// before the new ones are taken, so no frame of the previous device is
    /// queued after this returns.
    fn switch_device(&mut self, device_id: &str) -> Result<()> {
        if !self.ctx.registry.contains(device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        if self.current.as_deref() == Some(device_id) {
            return Ok(());
        }

        self.release();

        let stats = match self.ctx.sampler.subscribe(device_id) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(session_id = self.id, gpu_id = %device_id, error = %e, "failed to subscribe sampler");
                None
            }
        };
        let procs = if self.ctx.procs.enabled() {
            match self.ctx.procs.subscribe(device_id) {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    tracing::warn!(session_id = self.id, gpu_id = %device_id, error = %e, "failed to subscribe process scanner");
                    None
                }
            }
        } else {
            None
        };

        if stats.is_none() && procs.is_none() {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }

        self.stats = stats;
        self.procs = procs;
        self.current = Some(device_id.to_string());
        tracing::info!(session_id = self.id, gpu_id = %device_id, "session subscribed");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(subscription) = self.stats.take() {
            subscription.unsubscribe();
        }
        if let Some(subscription) = self.procs.take() {
            subscription.unsubscribe();
        }
        self.current = None;
    }

    fn teardown(&mut self) {
        self.release();
        self.outbound.close();
        let dropped = self.outbound.dropped();
        if dropped > 0 {
            tracing::debug!(session_id = self.id, dropped, "outbound frames dropped");
        }
    }

    fn send(&self, message: ServerMessage) -> bool {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(session_id = self.id, error = %e, "failed to encode frame");
                return false;
            }
        };
        if !self.outbound.push(frame) {
            tracing::warn!(session_id = self.id, "outbound queue closed");
            return false;
        }
        true
    }
}

/// Wait on an optional subscription; a missing one never resolves.
async fn next_update<K, V>(subscription: &mut Option<Subscription<K, V>>) -> Option<V>
where
    K: Eq + Hash,
{
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_loop<S: FrameSource>(
    mut source: S,
    inbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    session_id: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = source.next_frame() => frame,
        };
        match frame {
            Ok(Some(text)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = inbound.send(text) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(session_id, "peer closed connection");
                return;
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "websocket read error");
                return;
            }
        }
    }
}

async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut outbound: QueueReceiver<String>,
    write_timeout: Duration,
    cancel: CancellationToken,
    session_id: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match tokio::time::timeout(write_timeout, sink.send_frame(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(session_id, error = %e, "websocket write failed");
                cancel.cancel();
                return;
            }
            Err(_) => {
                tracing::warn!(session_id, timeout = ?write_timeout, "websocket write timed out");
                cancel.cancel();
                return;
            }
        }
    }
    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, sink.close()).await {
        tracing::debug!(session_id, error = %e, "websocket close failed");
    }
}
