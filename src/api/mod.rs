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

pub mod handlers;
pub mod messages;
pub mod server;
pub mod session;
pub mod transport;

pub use handlers::SharedState;
pub use messages::{ClientMessage, ServerMessage};
pub use server::{router, serve, serve_on};
pub use session::{run_session, SessionContext};
pub use transport::{FrameSink, FrameSource};
