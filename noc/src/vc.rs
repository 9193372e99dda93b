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

//! Input virtual channels.
//!
//! A VC is a FIFO of flit handles plus the pipeline state of the packet at
//! its front. The router drives the state machine:
//!
//! ```text
//!   Idle -> Routing -> VcAlloc ------------------> Active -> Idle
//!                         \                        ^
//!                          -> VcSpec -> VcSpecGrant
//! ```
//!
//! `Active` may be left with an empty queue while the rest of the packet is
//! still upstream; every other non-idle state has the packet's head at the
//! front of the queue.

use std::collections::VecDeque;
use std::fmt;

use crate::config::VcPriority;
use crate::flit::{Flit, FlitHandle};
use crate::routing::OutputSet;
use crate::Cycle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VcState {
    Idle,
    Routing,
    VcAlloc,
    VcSpec,
    Active,
    VcSpecGrant,
}

impl fmt::Display for VcState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Routing => "routing",
            Self::VcAlloc => "vc_alloc",
            Self::VcSpec => "vc_spec",
            Self::Active => "active",
            Self::VcSpecGrant => "vc_spec_grant",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug)]
pub struct Vc {
    /// Buffered flits with their arrival cycle.
    queue: VecDeque<(FlitHandle, Cycle)>,
    state: VcState,
    /// Cycle of the last state change.
    state_since: Cycle,
    /// Earliest cycle the stage owning the current state may act.
    ready_at: Cycle,
    route: Option<OutputSet>,
    /// Downstream (port, vc) granted by VC allocation.
    output: Option<(usize, usize)>,
    priority: i64,
}

impl Default for Vc {
    fn default() -> Self {
        Self::new()
    }
}

impl Vc {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: VcState::Idle,
            state_since: 0,
            ready_at: 0,
            route: None,
            output: None,
            priority: 0,
        }
    }

    pub fn state(&self) -> VcState {
        self.state
    }

    pub fn state_since(&self) -> Cycle {
        self.state_since
    }

    pub fn set_state(&mut self, state: VcState, now: Cycle) {
        if state != self.state {
            self.state = state;
            self.state_since = now;
        }
    }

    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn set_ready_at(&mut self, cycle: Cycle) {
        self.ready_at = cycle;
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        self.ready_at <= now
    }

    pub fn push(&mut self, handle: FlitHandle, now: Cycle) {
        self.queue.push_back((handle, now));
    }

    pub fn pop(&mut self) -> Option<FlitHandle> {
        self.queue.pop_front().map(|(handle, _)| handle)
    }

    pub fn front(&self) -> Option<FlitHandle> {
        self.queue.front().map(|(handle, _)| *handle)
    }

    /// Arrival cycle of the flit at the front of the queue.
    pub fn front_arrival(&self) -> Option<Cycle> {
        self.queue.front().map(|(_, arrival)| *arrival)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn occupancy(&self) -> usize {
        self.queue.len()
    }

    pub fn route(&self) -> Option<&OutputSet> {
        self.route.as_ref()
    }

    pub fn set_route(&mut self, route: OutputSet) {
        self.route = Some(route);
    }

    pub fn output(&self) -> Option<(usize, usize)> {
        self.output
    }

    pub fn set_output(&mut self, port: usize, vc: usize) {
        self.output = Some((port, vc));
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Recompute the priority of the packet at the front, `front` being the
    /// flit at the front of the queue.
    pub fn update_priority(&mut self, policy: VcPriority, front: &Flit, now: Cycle) {
        self.priority = match policy {
            VcPriority::None => 0,
            VcPriority::LocalAge => {
                let arrival = self.front_arrival().unwrap_or(now);
                (now - arrival) as i64
            }
            VcPriority::QueueLength => self.queue.len() as i64,
            VcPriority::HopCount => front.hops as i64,
            VcPriority::Flit => front.priority,
        };
    }

    /// Forget the current packet. The VC goes back to idle; the caller moves
    /// it to routing if another head is already queued.
    pub fn release(&mut self, now: Cycle) {
        self.route = None;
        self.output = None;
        self.priority = 0;
        self.set_state(VcState::Idle, now);
    }

    /// Structural checks on the state machine, for debugging.
    pub fn check(&self) -> Result<(), String> {
        match self.state {
            VcState::Idle => {
                if self.output.is_some() || self.route.is_some() {
                    return Err("idle VC holds a route or an output".into());
                }
            }
            VcState::Routing | VcState::VcAlloc | VcState::VcSpec => {
                if self.queue.is_empty() {
                    return Err(format!("empty VC in state {}", self.state));
                }
            }
            VcState::VcSpecGrant => {
                if self.queue.is_empty() || self.output.is_none() {
                    return Err("granted speculative VC without flits or output".into());
                }
            }
            VcState::Active => {
                if self.output.is_none() {
                    return Err("active VC without output".into());
                }
            }
        }
        if matches!(self.state, VcState::VcAlloc | VcState::VcSpec) && self.route.is_none() {
            return Err(format!("VC in state {} without a route", self.state));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::FlitArena;

    #[test]
    fn fifo_order() {
        let mut arena = FlitArena::new();
        let handles: Vec<_> = (0..3)
            .map(|i| arena.insert(Flit::new(0, 0, 1, i == 0, i == 2)))
            .collect();
        let mut vc = Vc::new();
        for (t, &h) in handles.iter().enumerate() {
            vc.push(h, t);
        }
        assert_eq!(vc.occupancy(), 3);
        assert_eq!(vc.front_arrival(), Some(0));
        let popped: Vec<_> = std::iter::from_fn(|| vc.pop()).collect();
        assert_eq!(popped, handles);
        assert!(vc.is_empty());
    }

    #[test]
    fn state_changes_are_stamped() {
        let mut vc = Vc::new();
        vc.set_state(VcState::Routing, 4);
        vc.set_state(VcState::Routing, 7);
        assert_eq!(vc.state_since(), 4);
        vc.set_state(VcState::VcAlloc, 9);
        assert_eq!(vc.state_since(), 9);
    }

    #[test]
    fn priorities() {
        let mut arena = FlitArena::new();
        let mut flit = Flit::new(0, 0, 1, true, false);
        flit.hops = 3;
        flit.priority = -2;
        let h = arena.insert(flit.clone());
        let mut vc = Vc::new();
        vc.push(h, 10);
        vc.push(h, 11);

        vc.update_priority(VcPriority::LocalAge, &flit, 15);
        assert_eq!(vc.priority(), 5);
        vc.update_priority(VcPriority::QueueLength, &flit, 15);
        assert_eq!(vc.priority(), 2);
        vc.update_priority(VcPriority::HopCount, &flit, 15);
        assert_eq!(vc.priority(), 3);
        vc.update_priority(VcPriority::Flit, &flit, 15);
        assert_eq!(vc.priority(), -2);
        vc.update_priority(VcPriority::None, &flit, 15);
        assert_eq!(vc.priority(), 0);
    }

    #[test]
    fn check_catches_inconsistent_states() {
        let mut vc = Vc::new();
        assert!(vc.check().is_ok());
        vc.set_state(VcState::Routing, 0);
        assert!(vc.check().is_err());
        vc.set_state(VcState::Active, 0);
        assert!(vc.check().is_err());
        vc.set_output(1, 0);
        assert!(vc.check().is_ok());
        vc.release(1);
        assert_eq!(vc.state(), VcState::Idle);
        assert!(vc.check().is_ok());
    }
}
