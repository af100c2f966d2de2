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

use crate::sampler::types::MetricsSnapshot;

/// Per-device telemetry source polled by the sampler.
///
/// `sample` never fails: a field that cannot be read this tick is `None`.
/// Implementations do blocking file I/O and are called from
/// `spawn_blocking`, hence `Send + Sync`.
pub trait MetricsReader: Send + Sync {
    fn device_id(&self) -> &str;
    fn sample(&self) -> MetricsSnapshot;
    /// Release any resources held by the reader. Called once on shutdown.
    fn close(&self) {}
}
