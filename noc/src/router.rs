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

//! Input-queued virtual-channel router.
//!
//! Every cycle `evaluate` runs the stages back to front of a packet's life:
//! arrivals are queued in their input VC, heads are routed, routed heads
//! compete for downstream VCs, and VCs holding a downstream VC compete for
//! the crossbar. Switch winners are forwarded into a crossbar pipe and reach
//! their output queue `sw_alloc_delay + crossbar_delay - 1` cycles later;
//! output queues drain one flit per cycle into the output channels.
//!
//! With speculation enabled, a head that wins VC allocation bids for the
//! switch in the same cycle, in a second allocator. A speculative grant is
//! used only if it does not collide with a non-speculative one.
//!
//! `output_buffer_size` bounds the flits per output port in the crossbar pipe
//! and the output queue together, including grants made within one cycle.

use log::{debug, error, info, trace};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::allocator::{new_allocator, Allocator};
use crate::buffer_state::BufferState;
use crate::channel::{ChannelBank, LinkEnd as Link};
use crate::config::{RouterConfiguration, SpecFilter, VcPriority};
use crate::flit::{Credit, FlitHandle};
use crate::routing::{RouterView, RoutingFunction};
use crate::sim::{Clocked, SimulationContext};
use crate::stats::RouterStats;
use crate::vc::{Vc, VcState};
use crate::{Cycle, Error};

fn attach(links: &mut [Option<Link>], router: usize, port: usize, link: Link) -> Result<(), Error> {
    match links.get_mut(port) {
        Some(slot) if slot.is_none() => {
            *slot = Some(link);
            Ok(())
        }
        _ => Err(Error::InvalidPort { router, port }),
    }
}

#[derive(Debug)]
pub struct Router {
    id: usize,
    name: String,
    config: RouterConfiguration,
    routing: Rc<dyn RoutingFunction>,

    /// Input VCs, indexed by `[port][vc]`.
    vcs: Vec<Vec<Vc>>,
    /// Downstream buffer state, per output port.
    next_buf: Vec<BufferState>,

    in_links: Vec<Option<Link>>,
    out_links: Vec<Option<Link>>,

    vc_allocator: Box<dyn Allocator>,
    sw_allocator: Box<dyn Allocator>,
    spec_sw_allocator: Option<Box<dyn Allocator>>,

    /// Flits received this cycle, with their input port.
    arrivals: Vec<(usize, FlitHandle)>,
    /// Switch winners on their way to the output queues: (ready, port, flit).
    crossbar: VecDeque<(Cycle, usize, FlitHandle)>,
    output_queues: Vec<VecDeque<FlitHandle>>,
    /// Flits in the crossbar or output queue, per output port.
    output_reserved: Vec<usize>,
    /// Credits to return upstream at the end of the cycle, per input port.
    credit_queues: Vec<Option<Credit>>,

    stats: RouterStats,
}

impl Router {
    pub fn new(
        id: usize,
        name: &str,
        inputs: usize,
        outputs: usize,
        config: &RouterConfiguration,
        routing: Rc<dyn RoutingFunction>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let num_vcs = config.num_vcs;
        let vc_allocator = new_allocator(
            config.vc_allocator,
            inputs * num_vcs,
            outputs * num_vcs,
            config.alloc_iters,
            config.arbiter,
        );
        let sw_inputs = inputs * config.input_speedup;
        let sw_outputs = outputs * config.output_speedup;
        let sw_allocator = new_allocator(
            config.sw_allocator,
            sw_inputs,
            sw_outputs,
            config.alloc_iters,
            config.arbiter,
        );
        let spec_sw_allocator = if config.speculative {
            Some(new_allocator(
                config.sw_allocator,
                sw_inputs,
                sw_outputs,
                config.alloc_iters,
                config.arbiter,
            ))
        } else {
            None
        };

        Ok(Self {
            id,
            name: name.to_string(),
            config: config.clone(),
            routing,
            vcs: (0..inputs).map(|_| vec![Vc::new(); num_vcs]).collect(),
            next_buf: (0..outputs)
                .map(|_| BufferState::from_config(config))
                .collect(),
            in_links: vec![None; inputs],
            out_links: vec![None; outputs],
            vc_allocator,
            sw_allocator,
            spec_sw_allocator,
            arrivals: Vec::new(),
            crossbar: VecDeque::new(),
            output_queues: vec![VecDeque::new(); outputs],
            output_reserved: vec![0; outputs],
            credit_queues: vec![None; inputs],
            stats: RouterStats::new(inputs, outputs),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> usize {
        self.vcs.len()
    }

    pub fn outputs(&self) -> usize {
        self.next_buf.len()
    }

    pub fn config(&self) -> &RouterConfiguration {
        &self.config
    }

    pub fn view(&self) -> RouterView {
        RouterView {
            id: self.id,
            inputs: self.inputs(),
            outputs: self.outputs(),
            num_vcs: self.config.num_vcs,
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn vc(&self, port: usize, vc: usize) -> &Vc {
        &self.vcs[port][vc]
    }

    pub fn vc_state(&self, port: usize, vc: usize) -> VcState {
        self.vcs[port][vc].state()
    }

    /// Upstream view of the buffer behind output `port`.
    pub fn buffer_state(&self, port: usize) -> &BufferState {
        &self.next_buf[port]
    }

    /// Attach the channels feeding input `port` and returning its credits.
    pub fn connect_input(
        &mut self,
        port: usize,
        flit_channel: usize,
        credit_channel: usize,
    ) -> Result<(), Error> {
        let link = Link {
            flits: flit_channel,
            credits: credit_channel,
        };
        attach(&mut self.in_links, self.id, port, link)
    }

    /// Attach the channels leaving output `port` and bringing its credits.
    pub fn connect_output(
        &mut self,
        port: usize,
        flit_channel: usize,
        credit_channel: usize,
    ) -> Result<(), Error> {
        let link = Link {
            flits: flit_channel,
            credits: credit_channel,
        };
        attach(&mut self.out_links, self.id, port, link)
    }

    pub fn input_occupancy(&self, port: usize) -> usize {
        self.vcs[port].iter().map(|vc| vc.occupancy()).sum()
    }

    /// Flits held anywhere inside the router.
    pub fn in_flight(&self) -> usize {
        let buffered: usize = (0..self.inputs()).map(|p| self.input_occupancy(p)).sum();
        buffered + self.crossbar.len() + self.output_queues.iter().map(|q| q.len()).sum::<usize>()
    }

    /// Consistency of the VC state machines and of the downstream credit
    /// accounting.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (port, vcs) in self.vcs.iter().enumerate() {
            for (vc, state) in vcs.iter().enumerate() {
                state
                    .check()
                    .map_err(|e| format!("{} input {} VC {}: {}", self.name, port, vc, e))?;
            }
        }
        for (port, buf) in self.next_buf.iter().enumerate() {
            if !buf.is_conserved() {
                return Err(format!(
                    "{} output {}: credits exceed flits sent",
                    self.name, port
                ));
            }
        }
        Ok(())
    }

    fn accept_arrivals(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        let now = ctx.cycle;
        let num_vcs = self.config.num_vcs;
        let capacity = self.config.total_buf_size();
        for (port, handle) in std::mem::take(&mut self.arrivals) {
            let flit = ctx.flits.get(handle)?;
            let vc = match flit.vc {
                Some(vc) if vc < num_vcs => vc,
                other => {
                    error!("{} | {} | flit {} arrived on VC {:?}", now, self.name, flit.id, other);
                    return Err(Error::UnexpectedFlit {
                        port,
                        vc: other.unwrap_or_default(),
                    });
                }
            };
            if self.input_occupancy(port) >= capacity {
                error!(
                    "{} | {} | input buffer of port {} full, flit {} dropped",
                    now, self.name, port, flit.id
                );
                return Err(Error::InputBufferOverflow { port, vc });
            }
            let ivc = &mut self.vcs[port][vc];
            if ivc.state() == VcState::Idle {
                if !flit.head {
                    error!(
                        "{} | {} | body flit {} arrived at idle VC {} of port {}",
                        now, self.name, flit.id, vc, port
                    );
                    return Err(Error::UnexpectedFlit { port, vc });
                }
                ivc.set_state(VcState::Routing, now);
                ivc.set_ready_at(now + self.config.routing_delay);
            }
            ivc.push(handle, now);
            if flit.watch {
                info!(
                    "{} | {} | received flit {} on port {} VC {}",
                    now, self.name, flit, port, vc
                );
            }
        }
        Ok(())
    }

    fn update_priorities(&mut self, ctx: &SimulationContext) -> Result<(), Error> {
        let policy = self.config.vc_priority;
        if policy == VcPriority::None {
            return Ok(());
        }
        for ivc in self.vcs.iter_mut().flatten() {
            if let Some(handle) = ivc.front() {
                let front = ctx.flits.get(handle)?;
                ivc.update_priority(policy, front, ctx.cycle);
            }
        }
        Ok(())
    }

    fn route_stage(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        let now = ctx.cycle;
        let view = self.view();
        for port in 0..self.vcs.len() {
            for vc in 0..self.config.num_vcs {
                let ivc = &mut self.vcs[port][vc];
                if ivc.state() != VcState::Routing || !ivc.is_ready(now) {
                    continue;
                }
                let handle = match ivc.front() {
                    Some(handle) => handle,
                    None => continue,
                };
                let flit = ctx.flits.get_mut(handle)?;
                let route = self
                    .routing
                    .route(&view, flit, port, false, &mut ctx.rng);
                if route.is_empty() {
                    error!("{} | {} | no route for flit {}", now, self.name, flit);
                    return Err(Error::EmptyRoute {
                        router: self.id,
                        flit: flit.id,
                    });
                }
                for candidate in route.candidates() {
                    let connected = matches!(self.out_links.get(candidate.port), Some(Some(_)));
                    if !connected || candidate.vc_end >= self.config.num_vcs {
                        error!(
                            "{} | {} | flit {} routed to {:?}",
                            now, self.name, flit.id, candidate
                        );
                        return Err(Error::InvalidPort {
                            router: self.id,
                            port: candidate.port,
                        });
                    }
                }
                if flit.watch {
                    info!(
                        "{} | {} | flit {} routed to ports {:?}",
                        now,
                        self.name,
                        flit.id,
                        route.ports()
                    );
                }
                ivc.set_route(route);
                ivc.set_state(VcState::VcAlloc, now);
            }
        }
        Ok(())
    }

    fn vc_alloc_stage(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        let now = ctx.cycle;
        let num_vcs = self.config.num_vcs;
        self.vc_allocator.clear();
        for port in 0..self.vcs.len() {
            for vc in 0..num_vcs {
                let ivc = &mut self.vcs[port][vc];
                match ivc.state() {
                    VcState::VcAlloc | VcState::VcSpec if ivc.is_ready(now) => {}
                    _ => continue,
                }
                if self.config.speculative {
                    ivc.set_state(VcState::VcSpec, now);
                }
                let input = port * num_vcs + vc;
                let priority = ivc.priority();
                let route = match ivc.route() {
                    Some(route) => route,
                    None => continue,
                };
                // the input side picks among route candidates, the output
                // side among competing VCs
                for (out_port, out_vc, route_priority) in route.iter_vcs() {
                    if self.next_buf[out_port].is_available_for(out_vc) {
                        self.vc_allocator.add_request(
                            input,
                            out_port * num_vcs + out_vc,
                            input,
                            route_priority,
                            priority,
                        );
                    }
                }
            }
        }
        if self.vc_allocator.num_requests() == 0 {
            return Ok(());
        }

        self.vc_allocator.allocate();
        let grants = self.vc_allocator.grants();
        debug!(
            "{} | {} | VC allocation: {} requests, {} grants",
            now,
            self.name,
            self.vc_allocator.num_requests(),
            grants.len()
        );
        for (input, output) in grants {
            let (port, vc) = (input / num_vcs, input % num_vcs);
            let (out_port, out_vc) = (output / num_vcs, output % num_vcs);
            self.next_buf[out_port].take_buffer(out_vc, input)?;
            let ivc = &mut self.vcs[port][vc];
            ivc.set_output(out_port, out_vc);
            if ivc.state() == VcState::VcSpec {
                ivc.set_state(VcState::VcSpecGrant, now);
            } else {
                ivc.set_state(VcState::Active, now);
                ivc.set_ready_at(now + self.config.vc_alloc_delay);
            }
            self.stats.vc_grants += 1;
            if let Some(handle) = ivc.front() {
                let flit = ctx.flits.get(handle)?;
                if flit.watch {
                    info!(
                        "{} | {} | flit {} granted output {} VC {}",
                        now, self.name, flit.id, out_port, out_vc
                    );
                }
            }
        }
        Ok(())
    }

    fn sw_alloc_stage(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        let now = ctx.cycle;
        let input_speedup = self.config.input_speedup;
        let output_speedup = self.config.output_speedup;
        let output_buffer_size = self.config.output_buffer_size;

        self.sw_allocator.clear();
        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.clear();
        }
        let output_reserved = &self.output_reserved;
        for port in 0..self.vcs.len() {
            for vc in 0..self.config.num_vcs {
                let ivc = &self.vcs[port][vc];
                if ivc.is_empty() {
                    continue;
                }
                let input = port * input_speedup + vc % input_speedup;
                let priority = ivc.priority();
                let has_room = |out_port: usize| output_reserved[out_port] < output_buffer_size;
                match ivc.state() {
                    VcState::Active if ivc.is_ready(now) => {
                        let (out_port, out_vc) = match ivc.output() {
                            Some(output) => output,
                            None => continue,
                        };
                        if self.next_buf[out_port].is_full_for(out_vc) || !has_room(out_port) {
                            continue;
                        }
                        self.sw_allocator.add_request(
                            input,
                            out_port * output_speedup + port % output_speedup,
                            vc,
                            priority,
                            priority,
                        );
                    }
                    // VC allocation already ran this cycle: a VcSpec VC lost it
                    VcState::VcSpecGrant => {
                        let spec = match self.spec_sw_allocator.as_mut() {
                            Some(spec) => spec,
                            None => continue,
                        };
                        let (out_port, out_vc) = match ivc.output() {
                            Some(output) => output,
                            None => continue,
                        };
                        if self.next_buf[out_port].is_full_for(out_vc) || !has_room(out_port) {
                            continue;
                        }
                        spec.add_request(
                            input,
                            out_port * output_speedup + port % output_speedup,
                            vc,
                            priority,
                            priority,
                        );
                    }
                    _ => {}
                }
            }
        }

        self.sw_allocator.allocate();
        let mut winners = Vec::new();
        for (input, output) in self.sw_allocator.grants() {
            if let Some(request) = self.sw_allocator.read_request(input, output) {
                winners.push((input / input_speedup, request.tag));
                self.stats.sw_grants += 1;
            }
        }

        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.allocate();
            for (input, output) in spec.grants() {
                let vc = match spec.read_request(input, output) {
                    Some(request) => request.tag,
                    None => continue,
                };
                let (port, out_port) = (input / input_speedup, output / output_speedup);
                let sw = &self.sw_allocator;
                let collides =
                    sw.output_assigned(input).is_some() || sw.input_assigned(output).is_some();
                let masked = self.config.spec_filter == SpecFilter::MaskByRequests
                    && (sw.has_input_requests(input) || sw.has_output_requests(output));
                let ivc = &self.vcs[port][vc];
                let allocated = ivc.state() == VcState::VcSpecGrant
                    && ivc.output().map(|(p, _)| p) == Some(out_port);
                if collides || masked || !allocated {
                    trace!(
                        "{} | {} | speculative grant {}:{} -> {} discarded",
                        now,
                        self.name,
                        port,
                        vc,
                        out_port
                    );
                    self.stats.spec_discarded += 1;
                    continue;
                }
                self.stats.spec_grants += 1;
                winners.push((port, vc));
            }
        }

        if !winners.is_empty() {
            debug!(
                "{} | {} | switch allocation: {} flits forwarded",
                now,
                self.name,
                winners.len()
            );
        }
        for (port, vc) in winners {
            // with output speedup several winners may share one output port
            // and one downstream pool
            if let Some((out_port, out_vc)) = self.vcs[port][vc].output() {
                if self.next_buf[out_port].is_full_for(out_vc)
                    || self.output_reserved[out_port] >= output_buffer_size
                {
                    trace!(
                        "{} | {} | switch grant {}:{} -> {} dropped, output full",
                        now,
                        self.name,
                        port,
                        vc,
                        out_port
                    );
                    continue;
                }
            }
            self.forward(ctx, port, vc)?;
        }

        // granted VCs that did not get through speculatively bid normally
        // from the next cycle on
        for ivc in self.vcs.iter_mut().flatten() {
            if ivc.state() == VcState::VcSpecGrant {
                ivc.set_state(VcState::Active, now);
                ivc.set_ready_at(now + 1);
            }
        }
        Ok(())
    }

    /// Move the front flit of a VC into the crossbar pipe.
    fn forward(&mut self, ctx: &mut SimulationContext, port: usize, vc: usize) -> Result<(), Error> {
        let now = ctx.cycle;
        let ivc = &mut self.vcs[port][vc];
        let (out_port, out_vc) = ivc.output().ok_or(Error::UnexpectedFlit { port, vc })?;
        let handle = ivc.pop().ok_or(Error::UnexpectedFlit { port, vc })?;
        let flit = ctx.flits.get_mut(handle)?;
        flit.vc = Some(out_vc);
        flit.hops += 1;
        self.next_buf[out_port].sending_flit(flit)?;
        self.credit_queues[port]
            .get_or_insert_with(Credit::new)
            .add_vc(vc);
        let ready = now + self.config.sw_alloc_delay + self.config.crossbar_delay - 1;
        self.crossbar.push_back((ready, out_port, handle));
        self.output_reserved[out_port] += 1;
        if flit.watch {
            info!(
                "{} | {} | forwarding flit {} from {}:{} to {}:{}",
                now, self.name, flit.id, port, vc, out_port, out_vc
            );
        }

        if flit.tail {
            ivc.release(now);
            if let Some(next) = ivc.front() {
                if !ctx.flits.get(next)?.head {
                    return Err(Error::UnexpectedFlit { port, vc });
                }
                ivc.set_state(VcState::Routing, now);
                ivc.set_ready_at(now + self.config.routing_delay);
            }
        } else if ivc.state() == VcState::VcSpecGrant {
            ivc.set_state(VcState::Active, now);
            ivc.set_ready_at(now + 1);
        }
        Ok(())
    }

    fn crossbar_stage(&mut self, now: Cycle) {
        while let Some(&(ready, out_port, handle)) = self.crossbar.front() {
            if ready > now {
                break;
            }
            self.crossbar.pop_front();
            self.output_queues[out_port].push_back(handle);
        }
    }
}

impl Clocked for Router {
    fn read_inputs(
        &mut self,
        ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error> {
        for (port, link) in self.in_links.iter().enumerate() {
            if let Some(link) = link {
                if let Some(handle) = channels.flits[link.flits].receive() {
                    self.arrivals.push((port, handle));
                    self.stats.flits_received[port] += 1;
                }
            }
        }
        for (port, link) in self.out_links.iter().enumerate() {
            if let Some(link) = link {
                if let Some(credit) = channels.credits[link.credits].receive() {
                    self.next_buf[port].process_credit(&credit).map_err(|e| {
                        error!(
                            "{} | {} | bad credit on output {}: {}",
                            ctx.cycle, self.name, port, e
                        );
                        e
                    })?;
                }
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        self.accept_arrivals(ctx)?;
        self.update_priorities(ctx)?;
        self.route_stage(ctx)?;
        self.vc_alloc_stage(ctx)?;
        self.sw_alloc_stage(ctx)?;
        self.crossbar_stage(ctx.cycle);
        Ok(())
    }

    fn write_outputs(
        &mut self,
        ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error> {
        for (port, link) in self.out_links.iter().enumerate() {
            if let Some(link) = link {
                let channel = &mut channels.flits[link.flits];
                if !channel.is_idle() {
                    continue;
                }
                if let Some(handle) = self.output_queues[port].pop_front() {
                    channel.send(handle)?;
                    self.output_reserved[port] -= 1;
                    self.stats.flits_sent[port] += 1;
                }
            }
        }
        for (port, credit) in self.credit_queues.iter_mut().enumerate() {
            if let Some(credit) = credit.take() {
                match self.in_links[port] {
                    Some(link) => channels.credits[link.credits].send(credit)?,
                    None => error!(
                        "{} | {} | credit for unconnected input {}",
                        ctx.cycle, self.name, port
                    ),
                }
            }
        }
        if cfg!(feature = "check-credit-conservation") {
            self.check_invariants().map_err(Error::InvariantViolation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorType;
    use crate::flit::Flit;
    use crate::routing::OutputSet;
    use rand_core::RngCore;

    /// Sends every flit to the output port named by its destination, on the
    /// VCs in `vcs`.
    #[derive(Debug)]
    struct ToPort {
        vcs: (usize, usize),
    }

    impl RoutingFunction for ToPort {
        fn route(
            &self,
            _router: &RouterView,
            flit: &mut Flit,
            in_port: usize,
            inject: bool,
            _rng: &mut dyn RngCore,
        ) -> OutputSet {
            let mut outputs = OutputSet::new();
            let port = if inject { in_port } else { flit.dest };
            outputs.add_range(port, self.vcs.0, self.vcs.1, 0);
            outputs
        }
    }

    /// A router with every port connected to the test: inputs are fed
    /// directly, outputs are drained by sinks that return credits at once.
    struct TestBench {
        router: Router,
        channels: ChannelBank,
        ctx: SimulationContext,
        inputs: Vec<(usize, usize)>,
        outputs: Vec<(usize, usize)>,
        upstream_credits: Vec<Vec<usize>>,
        return_credits: bool,
    }

    impl TestBench {
        fn new(ports: usize, config: &RouterConfiguration, vcs: (usize, usize)) -> Self {
            let _logger = env_logger::builder().is_test(true).try_init();
            let mut router =
                Router::new(0, "router_0", ports, ports, config, Rc::new(ToPort { vcs })).unwrap();
            let mut channels = ChannelBank::new();
            let mut inputs = vec![];
            let mut outputs = vec![];
            for port in 0..ports {
                let (f, c) = (channels.add_flit_channel(1), channels.add_credit_channel(1));
                router.connect_input(port, f, c).unwrap();
                inputs.push((f, c));
                let (f, c) = (channels.add_flit_channel(1), channels.add_credit_channel(1));
                router.connect_output(port, f, c).unwrap();
                outputs.push((f, c));
            }
            Self {
                router,
                channels,
                ctx: SimulationContext::new(1),
                inputs,
                outputs,
                upstream_credits: vec![vec![]; ports],
                return_credits: true,
            }
        }

        fn packet(&mut self, dest: usize, vc: usize, len: usize) -> Vec<FlitHandle> {
            let pid = self.ctx.next_pid();
            (0..len)
                .map(|i| {
                    let mut flit = Flit::new(pid, 0, dest, i == 0, i + 1 == len);
                    flit.vc = Some(vc);
                    self.ctx.flits.insert(flit)
                })
                .collect()
        }

        /// One cycle; returns the flits delivered per output port.
        fn step(&mut self, send: &[(usize, FlitHandle)]) -> Vec<(usize, FlitHandle)> {
            self.channels.read_inputs().unwrap();
            let mut delivered = vec![];
            for (port, &(f, c)) in self.outputs.iter().enumerate() {
                if let Some(handle) = self.channels.flits[f].receive() {
                    let vc = self.ctx.flits.get(handle).unwrap().vc.unwrap();
                    if self.return_credits {
                        self.channels.credits[c].send(Credit::for_vc(vc)).unwrap();
                    }
                    delivered.push((port, handle));
                }
            }
            for (port, &(_, c)) in self.inputs.iter().enumerate() {
                if let Some(credit) = self.channels.credits[c].receive() {
                    self.upstream_credits[port].extend(credit.vcs());
                }
            }
            self.router
                .read_inputs(&mut self.ctx, &mut self.channels)
                .unwrap();
            self.router.evaluate(&mut self.ctx).unwrap();
            self.router
                .write_outputs(&mut self.ctx, &mut self.channels)
                .unwrap();
            for &(port, handle) in send {
                self.channels.flits[self.inputs[port].0].send(handle).unwrap();
            }
            self.channels.write_outputs();
            self.router.check_invariants().unwrap();
            self.ctx.cycle += 1;
            delivered
        }

        fn run(&mut self, cycles: usize) -> Vec<(usize, FlitHandle)> {
            (0..cycles).flat_map(|_| self.step(&[])).collect()
        }

        /// Free a downstream VC held by a packet outside the test: its tail
        /// leaves and the slot is credited back.
        fn release_output_vc(&mut self, port: usize, vc: usize) {
            let mut tail = Flit::new(0, 0, port, true, true);
            tail.vc = Some(vc);
            let buf = &mut self.router.next_buf[port];
            buf.sending_flit(&tail).unwrap();
            buf.process_credit(&Credit::for_vc(vc)).unwrap();
            assert!(buf.is_available_for(vc));
        }
    }

    #[test]
    fn packet_crosses_in_order() {
        let config = RouterConfiguration::default();
        let mut bench = TestBench::new(3, &config, (0, 1));
        let packet = bench.packet(2, 1, 3);
        let mut delivered = vec![];
        for &handle in &packet {
            delivered.extend(bench.step(&[(0, handle)]));
        }
        delivered.extend(bench.run(10));

        assert_eq!(delivered.iter().map(|d| d.1).collect::<Vec<_>>(), packet);
        assert!(delivered.iter().all(|d| d.0 == 2));
        assert_eq!(bench.upstream_credits[0], vec![1, 1, 1]);
        assert_eq!(bench.router.in_flight(), 0);
        assert_eq!(bench.router.vc_state(0, 1), VcState::Idle);
        assert_eq!(bench.router.buffer_state(2).total_occupancy(), 0);
        assert_eq!(bench.router.stats().flits_sent[2], 3);
    }

    #[test]
    fn pipeline_latency() {
        // arrival at t, route and VC allocation at t, switch allocation at
        // t + 1, output queue and channel at t + 2, sink at t + 3
        let config = RouterConfiguration::default();
        let mut bench = TestBench::new(2, &config, (0, 1));
        let packet = bench.packet(1, 0, 1);
        bench.step(&[(0, packet[0])]);
        let mut arrival = None;
        for cycle in 1..10 {
            if !bench.step(&[]).is_empty() {
                arrival = Some(cycle);
                break;
            }
        }
        // the flit reaches the router at cycle 1
        assert_eq!(arrival, Some(4));
    }

    #[test]
    fn same_input_vcs_share_one_output_vc() {
        let config = RouterConfiguration::default();
        let mut bench = TestBench::new(2, &config, (0, 0));
        // hold the only allowed output VC until both heads wait for it
        bench.router.next_buf[1].take_buffer(0, 99).unwrap();
        let a = bench.packet(1, 0, 1);
        let b = bench.packet(1, 1, 1);
        bench.step(&[(0, a[0])]);
        bench.step(&[(0, b[0])]);
        bench.step(&[]);
        assert_eq!(bench.router.vc_state(0, 0), VcState::VcAlloc);
        assert_eq!(bench.router.vc_state(0, 1), VcState::VcAlloc);
        bench.release_output_vc(1, 0);

        bench.step(&[]);
        let states = [bench.router.vc_state(0, 0), bench.router.vc_state(0, 1)];
        assert_eq!(
            states.iter().filter(|&&s| s == VcState::Active).count(),
            1
        );
        assert_eq!(
            states.iter().filter(|&&s| s == VcState::VcAlloc).count(),
            1
        );
        let delivered: Vec<_> = bench.run(10).into_iter().map(|d| d.1).collect();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.contains(&a[0]) && delivered.contains(&b[0]));
        assert_eq!(bench.router.stats().vc_grants, 2);
    }

    #[test]
    fn simultaneous_requests_for_one_output_vc() {
        let config = RouterConfiguration::default();
        let mut bench = TestBench::new(3, &config, (0, 0));
        let a = bench.packet(2, 0, 2);
        let b = bench.packet(2, 0, 2);
        bench.step(&[(0, a[0]), (1, b[0])]);
        bench.step(&[(0, a[1]), (1, b[1])]);
        // both heads asked for output 2 VC 0 in the same cycle
        let owners = (0..2)
            .filter(|&p| bench.router.vc_state(p, 0) == VcState::Active)
            .count();
        assert_eq!(owners, 1);
        let delivered: Vec<_> = bench.run(20).into_iter().map(|d| d.1).collect();
        assert_eq!(delivered.len(), 4);
        // packets are not interleaved on the single output VC
        let first: Vec<_> = delivered[..2].to_vec();
        assert!(first == a || first == b);
        assert!(delivered[2..] == a[..] || delivered[2..] == b[..]);
    }

    #[test]
    fn speculation_needs_a_vc() {
        let config = RouterConfiguration {
            num_vcs: 1,
            speculative: true,
            ..Default::default()
        };
        let mut bench = TestBench::new(2, &config, (0, 0));
        // the only downstream VC belongs to someone else
        bench.router.next_buf[1].take_buffer(0, 99).unwrap();
        let packet = bench.packet(1, 0, 1);
        bench.step(&[(0, packet[0])]);
        let delivered = bench.run(5);
        assert!(delivered.is_empty());
        assert_eq!(bench.router.vc_state(0, 0), VcState::VcSpec);
        assert_eq!(bench.router.vc(0, 0).occupancy(), 1);
        assert!(bench.router.crossbar.is_empty());
        // a head that lost VC allocation does not bid for the switch
        let spec = bench.router.spec_sw_allocator.as_ref().unwrap();
        assert_eq!(spec.num_requests(), 0);
        assert_eq!(bench.router.stats().spec_discarded, 0);
        assert_eq!(bench.router.stats().spec_grants, 0);
    }

    #[test]
    fn speculation_saves_a_cycle() {
        let config = RouterConfiguration {
            speculative: true,
            ..Default::default()
        };
        let mut bench = TestBench::new(2, &config, (0, 1));
        let packet = bench.packet(1, 0, 1);
        bench.step(&[(0, packet[0])]);
        let mut arrival = None;
        for cycle in 1..10 {
            if !bench.step(&[]).is_empty() {
                arrival = Some(cycle);
                break;
            }
        }
        assert_eq!(arrival, Some(3));
        assert_eq!(bench.router.stats().spec_grants, 1);
    }

    #[test]
    fn backpressure_follows_credits() {
        let config = RouterConfiguration {
            num_vcs: 1,
            vc_buf_size: 2,
            ..Default::default()
        };
        let mut bench = TestBench::new(2, &config, (0, 0));
        bench.return_credits = false;
        let packet = bench.packet(1, 0, 4);
        let mut delivered = vec![];
        for &handle in &packet {
            delivered.extend(bench.step(&[(0, handle)]));
        }
        delivered.extend(bench.run(10));
        assert_eq!(delivered.len(), 2);
        assert!(bench.router.buffer_state(1).is_full_for(0));
        assert_eq!(bench.router.vc(0, 0).occupancy(), 2);

        // the downstream buffer drains
        for _ in 0..2 {
            bench.router.next_buf[1]
                .process_credit(&Credit::for_vc(0))
                .unwrap();
        }
        bench.return_credits = true;
        delivered.extend(bench.run(10));
        assert_eq!(delivered.iter().map(|d| d.1).collect::<Vec<_>>(), packet);
    }

    #[test]
    fn body_flit_on_idle_vc_is_rejected() {
        let config = RouterConfiguration::default();
        let mut bench = TestBench::new(2, &config, (0, 1));
        let packet = bench.packet(1, 0, 2);
        bench.channels.read_inputs().unwrap();
        bench.channels.flits[bench.inputs[0].0]
            .send(packet[1])
            .unwrap();
        bench.channels.write_outputs();
        bench.ctx.cycle += 1;
        bench.channels.read_inputs().unwrap();
        bench
            .router
            .read_inputs(&mut bench.ctx, &mut bench.channels)
            .unwrap();
        assert_eq!(
            bench.router.evaluate(&mut bench.ctx),
            Err(Error::UnexpectedFlit { port: 0, vc: 0 })
        );
    }

    /// Two single-flit heads wait for output 2 VC 0 while another packet
    /// holds it: the first arrives on port 1 at cycle 1, the second on port 0
    /// at cycle 5, with flit priorities `priorities`. Returns the input port
    /// granted the VC once it frees up.
    fn contend_for_output_vc(config: &RouterConfiguration, priorities: (i64, i64)) -> usize {
        let mut bench = TestBench::new(3, config, (0, 0));
        bench.router.next_buf[2].take_buffer(0, 99).unwrap();
        let old = bench.packet(2, 0, 1);
        let young = bench.packet(2, 0, 1);
        bench.ctx.flits.get_mut(old[0]).unwrap().priority = priorities.0;
        bench.ctx.flits.get_mut(young[0]).unwrap().priority = priorities.1;
        bench.step(&[(1, old[0])]);
        bench.run(3);
        bench.step(&[(0, young[0])]);
        bench.run(2);
        assert_eq!(bench.router.vc_state(1, 0), VcState::VcAlloc);
        assert_eq!(bench.router.vc_state(0, 0), VcState::VcAlloc);

        bench.release_output_vc(2, 0);
        bench.step(&[]);
        let winners: Vec<usize> = (0..2)
            .filter(|&p| bench.router.vc_state(p, 0) == VcState::Active)
            .collect();
        assert_eq!(winners.len(), 1);
        winners[0]
    }

    #[test]
    fn vc_priority_decides_vc_allocation() {
        let allocators = [
            AllocatorType::SeparableInputFirst,
            AllocatorType::SeparableOutputFirst,
            AllocatorType::Islip,
            AllocatorType::Wavefront,
        ];
        for &allocator in allocators.iter() {
            let mut config = RouterConfiguration {
                vc_allocator: allocator,
                sw_allocator: allocator,
                ..Default::default()
            };
            config.vc_priority = VcPriority::LocalAge;
            assert_eq!(contend_for_output_vc(&config, (0, 0)), 1, "{:?} local_age", allocator);
            config.vc_priority = VcPriority::Flit;
            assert_eq!(contend_for_output_vc(&config, (0, 5)), 0, "{:?} flit", allocator);
            assert_eq!(contend_for_output_vc(&config, (5, 0)), 1, "{:?} flit", allocator);
        }
    }

    #[test]
    fn output_buffer_bounds_speedup() {
        let config = RouterConfiguration {
            output_speedup: 2,
            output_buffer_size: 1,
            alloc_iters: 2,
            ..Default::default()
        };
        let mut bench = TestBench::new(3, &config, (0, 1));
        let a = bench.packet(2, 0, 1);
        let b = bench.packet(2, 0, 1);
        // the two inputs use distinct crossbar outputs into port 2
        bench.step(&[(0, a[0]), (1, b[0])]);
        let mut delivered = vec![];
        for _ in 0..15 {
            delivered.extend(bench.step(&[]));
            assert!(bench.router.output_reserved[2] <= 1);
        }
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|&(port, _)| port == 2));
    }
}
