// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cycle-accurate model of an input-queued virtual-channel router and of
//! the credit-based flow control between routers.

pub mod allocator;
pub mod arbiter;
pub mod buffer_state;
pub mod channel;
pub mod config;
mod error;
pub mod flit;
pub mod network;
pub mod router;
pub mod routing;
pub mod sim;
pub mod stats;
pub mod terminal;
pub mod topologies;
pub mod vc;

// Public types
// type to use for cycles
pub type Cycle = usize;

pub use crate::buffer_state::{BufferPolicy, BufferState};
pub use crate::config::{NetworkConfiguration, RouterConfiguration};
pub use crate::error::Error;
pub use crate::flit::{Credit, Flit, FlitArena, FlitHandle};
pub use crate::network::{Network, NetworkBuilder};
pub use crate::router::Router;
pub use crate::routing::{OutputSet, RouterView, RoutingFunction, RoutingRegistry};
pub use crate::sim::{Clocked, Simulation, SimulationContext};
pub use crate::stats::{NetworkStats, RouterStats, TerminalStats};
pub use crate::terminal::{PacketRequest, Terminal};
pub use crate::vc::{Vc, VcState};
