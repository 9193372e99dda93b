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

//! Network endpoints.
//!
//! A terminal injects packets into one router port and retires the flits
//! that router ejects to it. Injection obeys the same credit protocol as a
//! router output: the terminal keeps a [`BufferState`] mirroring the router's
//! input buffer and holds a VC for the whole packet. Ejected flits are
//! consumed on arrival, so their credits go back in the same cycle.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::buffer_state::BufferState;
use crate::channel::{ChannelBank, LinkEnd};
use crate::config::RouterConfiguration;
use crate::flit::{Credit, Flit, FlitHandle};
use crate::routing::{RouterView, RoutingFunction};
use crate::sim::{Clocked, SimulationContext};
use crate::stats::TerminalStats;
use crate::Error;

/// A packet to be created at a terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketRequest {
    pub dest: usize,
    /// Number of flits.
    pub size: usize,
    pub priority: i64,
    /// Log every step of this packet at info level.
    pub watch: bool,
}

impl PacketRequest {
    pub fn new(dest: usize, size: usize) -> Self {
        Self {
            dest,
            size,
            priority: 0,
            watch: false,
        }
    }
}

#[derive(Debug)]
pub struct Terminal {
    id: usize,
    name: String,
    /// The router this terminal hangs off, and the port on both sides.
    router: RouterView,
    port: usize,
    routing: Rc<dyn RoutingFunction>,
    inject: LinkEnd,
    eject: LinkEnd,

    source_queue: VecDeque<FlitHandle>,
    buffer_state: BufferState,
    /// Router VC held by the packet being injected.
    current_vc: Option<usize>,
    /// Where the search for a free injection VC starts.
    next_vc: usize,

    arrivals: Vec<FlitHandle>,
    /// Id of the next flit expected, per partially received packet.
    expected: HashMap<u64, u64>,
    pending_credit: Option<Credit>,
    stats: TerminalStats,
}

impl Terminal {
    pub fn new(
        id: usize,
        router: RouterView,
        port: usize,
        config: &RouterConfiguration,
        routing: Rc<dyn RoutingFunction>,
        inject: LinkEnd,
        eject: LinkEnd,
    ) -> Self {
        Self {
            id,
            name: format!("terminal_{}", id),
            router,
            port,
            routing,
            inject,
            eject,
            source_queue: VecDeque::new(),
            buffer_state: BufferState::from_config(config),
            current_vc: None,
            next_vc: 0,
            arrivals: Vec::new(),
            expected: HashMap::new(),
            pending_credit: None,
            stats: TerminalStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> usize {
        self.router.id
    }

    pub fn stats(&self) -> &TerminalStats {
        &self.stats
    }

    pub fn buffer_state(&self) -> &BufferState {
        &self.buffer_state
    }

    /// Flits created here and not injected yet.
    pub fn queued_flits(&self) -> usize {
        self.source_queue.len()
    }

    /// Create the flits of a packet and queue them for injection. Returns the
    /// packet id.
    pub fn enqueue_packet(
        &mut self,
        ctx: &mut SimulationContext,
        request: &PacketRequest,
    ) -> Result<u64, Error> {
        if request.size == 0 {
            return Err(Error::InvalidConfiguration(
                "packets need at least one flit".to_string(),
            ));
        }
        let pid = ctx.next_pid();
        for i in 0..request.size {
            let mut flit = Flit::new(pid, self.id, request.dest, i == 0, i + 1 == request.size);
            flit.priority = request.priority;
            flit.watch = request.watch;
            flit.ctime = ctx.cycle;
            let handle = ctx.flits.insert(flit);
            self.source_queue.push_back(handle);
        }
        self.stats.packets_created += 1;
        if request.watch {
            info!(
                "{} | {} | created packet {} for {} ({} flits)",
                ctx.cycle, self.name, pid, request.dest, request.size
            );
        }
        Ok(pid)
    }

    fn retire_arrivals(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        let now = ctx.cycle;
        for handle in std::mem::take(&mut self.arrivals) {
            let flit = ctx.flits.remove(handle)?;
            let vc = flit
                .vc
                .ok_or(Error::UnexpectedFlit { port: self.port, vc: 0 })?;
            self.pending_credit
                .get_or_insert_with(Credit::new)
                .add_vc(vc);
            self.stats.flits_ejected += 1;
            if flit.dest != self.id {
                warn!(
                    "{} | {} | received flit {} for terminal {}",
                    now, self.name, flit.id, flit.dest
                );
                self.stats.misrouted += 1;
            }
            let in_order = flit.head || self.expected.remove(&flit.pid) == Some(flit.id);
            if !in_order {
                warn!(
                    "{} | {} | flit {} of packet {} arrived out of order",
                    now, self.name, flit.id, flit.pid
                );
                self.stats.out_of_order += 1;
            }
            if flit.tail {
                self.stats.record_packet(now - flit.ctime, flit.hops);
            } else {
                self.expected.insert(flit.pid, flit.id + 1);
            }
            if flit.watch {
                info!("{} | {} | ejected flit {}", now, self.name, flit);
            }
        }
        Ok(())
    }

    /// Pick a router VC for the packet at the front of the source queue.
    fn select_vc(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        if self.current_vc.is_some() {
            return Ok(());
        }
        let handle = match self.source_queue.front() {
            Some(&handle) => handle,
            None => return Ok(()),
        };
        let flit = ctx.flits.get_mut(handle)?;
        let allowed = self
            .routing
            .route(&self.router, flit, self.port, true, &mut ctx.rng);
        let num_vcs = self.buffer_state.num_vcs();
        let choice = (0..num_vcs)
            .map(|i| (self.next_vc + i) % num_vcs)
            .find(|&vc| {
                allowed.iter_vcs().any(|(_, v, _)| v == vc)
                    && self.buffer_state.is_available_for(vc)
            });
        if let Some(vc) = choice {
            self.buffer_state.take_buffer(vc, self.id)?;
            self.current_vc = Some(vc);
            self.next_vc = (vc + 1) % num_vcs;
            debug!(
                "{} | {} | packet {} injects on VC {}",
                ctx.cycle, self.name, flit.pid, vc
            );
        }
        Ok(())
    }

    fn inject(&mut self, ctx: &mut SimulationContext, channels: &mut ChannelBank) -> Result<(), Error> {
        let vc = match self.current_vc {
            Some(vc) => vc,
            None => return Ok(()),
        };
        let channel = &mut channels.flits[self.inject.flits];
        if !channel.is_idle() || self.buffer_state.is_full_for(vc) {
            return Ok(());
        }
        let handle = match self.source_queue.pop_front() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let flit = ctx.flits.get_mut(handle)?;
        flit.vc = Some(vc);
        flit.itime = Some(ctx.cycle);
        self.buffer_state.sending_flit(flit)?;
        channel.send(handle)?;
        self.stats.flits_injected += 1;
        if flit.watch {
            info!("{} | {} | injected flit {}", ctx.cycle, self.name, flit);
        }
        if flit.tail {
            self.current_vc = None;
        }
        Ok(())
    }
}

impl Clocked for Terminal {
    fn read_inputs(
        &mut self,
        _ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error> {
        if let Some(handle) = channels.flits[self.eject.flits].receive() {
            self.arrivals.push(handle);
        }
        if let Some(credit) = channels.credits[self.inject.credits].receive() {
            self.buffer_state.process_credit(&credit)?;
        }
        Ok(())
    }

    fn evaluate(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        self.retire_arrivals(ctx)?;
        self.select_vc(ctx)
    }

    fn write_outputs(
        &mut self,
        ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error> {
        self.inject(ctx, channels)?;
        if let Some(credit) = self.pending_credit.take() {
            channels.credits[self.eject.credits].send(credit)?;
        }
        Ok(())
    }
}
