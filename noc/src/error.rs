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

use std::fmt;

use crate::flit::FlitHandle;

/// Errors raised by the simulator.
///
/// There are two families. Flow-control protocol violations are raised while
/// stepping and mean that an earlier cycle left the credit accounting in an
/// inconsistent state: every measurement taken after that point is garbage,
/// so the simulation stops. Configuration errors are raised while building
/// routers and networks, before the first cycle runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    // Protocol violations.
    BufferAlreadyTaken { vc: usize },
    BufferOverflow { vc: usize, occupancy: usize, capacity: usize },
    BufferUnderflow { vc: usize },
    CreditForIdleBuffer { vc: usize },
    InputBufferOverflow { port: usize, vc: usize },
    UnexpectedFlit { port: usize, vc: usize },
    FlitWithoutVc { flit: u64 },
    InvariantViolation(String),
    ChannelOverrun,
    UnknownFlit(FlitHandle),
    EmptyRoute { router: usize, flit: u64 },

    // Configuration errors.
    InvalidConfiguration(String),
    UnknownAllocator(String),
    UnknownArbiter(String),
    UnknownBufferPolicy(String),
    UnknownRoutingFunction(String),
    InvalidPort { router: usize, port: usize },
}

impl Error {
    /// True for the errors that can only be produced while the simulation
    /// is running, i.e., that reveal a flow-control bug.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::BufferAlreadyTaken { .. }
                | Self::BufferOverflow { .. }
                | Self::BufferUnderflow { .. }
                | Self::CreditForIdleBuffer { .. }
                | Self::InputBufferOverflow { .. }
                | Self::UnexpectedFlit { .. }
                | Self::FlitWithoutVc { .. }
                | Self::InvariantViolation(_)
                | Self::ChannelOverrun
                | Self::UnknownFlit(_)
                | Self::EmptyRoute { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BufferAlreadyTaken { vc } => {
                write!(f, "ERROR: Buffer for VC {} is already in use", vc)
            }
            Self::BufferOverflow {
                vc,
                occupancy,
                capacity,
            } => write!(
                f,
                "ERROR: Flit sent to full buffer for VC {} (occupancy {}, capacity {})",
                vc, occupancy, capacity
            ),
            Self::BufferUnderflow { vc } => {
                write!(f, "ERROR: Buffer occupancy fell below zero for VC {}", vc)
            }
            Self::CreditForIdleBuffer { vc } => {
                write!(f, "ERROR: Received credit for idle buffer VC {}", vc)
            }
            Self::InputBufferOverflow { port, vc } => {
                write!(f, "ERROR: Input buffer overflow on port {} VC {}", port, vc)
            }
            Self::UnexpectedFlit { port, vc } => {
                write!(f, "ERROR: Unexpected flit on port {} VC {}", port, vc)
            }
            Self::FlitWithoutVc { flit } => write!(f, "ERROR: Flit {} sent without a VC", flit),
            Self::InvariantViolation(msg) => write!(f, "ERROR: Invariant violated: {}", msg),
            Self::UnknownFlit(handle) => write!(f, "ERROR: Unknown flit handle {}", handle),
            Self::EmptyRoute { router, flit } => write!(
                f,
                "ERROR: Routing function returned no candidates at router {} for flit {}",
                router, flit
            ),
            Self::InvalidConfiguration(msg) => write!(f, "ERROR: Invalid configuration: {}", msg),
            Self::UnknownAllocator(name) => write!(f, "ERROR: Unknown allocator type {}", name),
            Self::UnknownArbiter(name) => write!(f, "ERROR: Unknown arbiter type {}", name),
            Self::UnknownBufferPolicy(name) => {
                write!(f, "ERROR: Unknown buffer policy {}", name)
            }
            Self::UnknownRoutingFunction(name) => {
                write!(f, "ERROR: Invalid routing function {}", name)
            }
            Self::InvalidPort { router, port } => {
                write!(f, "ERROR: Invalid port {} for router {}", port, router)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}
