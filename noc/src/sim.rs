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

//! Cycle stepping.
//!
//! Each cycle runs in three phases over every component: `read_inputs`
//! takes what the channels deliver this cycle, `evaluate` updates internal
//! state, and `write_outputs` hands new flits and credits to the channels.
//! Components only talk through channels of latency one or more, so the
//! order in which components run within a phase does not matter.

use log::{debug, warn};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use std::rc::Rc;

use crate::channel::ChannelBank;
use crate::config::{NetworkConfiguration, TopologyType};
use crate::flit::FlitArena;
use crate::network::Network;
use crate::routing::{RoutingFunction, RoutingParameters, RoutingRegistry};
use crate::stats::NetworkStats;
use crate::terminal::PacketRequest;
use crate::topologies::{mesh, torus};
use crate::{Cycle, Error};

/// State shared by every component during one simulation run.
#[derive(Debug)]
pub struct SimulationContext {
    pub cycle: Cycle,
    pub rng: Xoshiro256StarStar,
    pub flits: FlitArena,
    next_pid: u64,
}

impl SimulationContext {
    pub fn new(seed: u64) -> Self {
        Self {
            cycle: 0,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            flits: FlitArena::new(),
            next_pid: 0,
        }
    }

    pub fn next_pid(&mut self) -> u64 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

/// A component advanced once per cycle, in three phases.
pub trait Clocked {
    fn read_inputs(
        &mut self,
        ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error>;
    fn evaluate(&mut self, ctx: &mut SimulationContext) -> Result<(), Error>;
    fn write_outputs(
        &mut self,
        ctx: &mut SimulationContext,
        channels: &mut ChannelBank,
    ) -> Result<(), Error>;
}

/// Warns when flits are alive but nothing has moved for `timeout` cycles.
#[derive(Clone, Debug)]
pub struct DeadlockWatchdog {
    timeout: Cycle,
    last_activity: u64,
    quiet_cycles: Cycle,
    reported: bool,
}

impl DeadlockWatchdog {
    pub fn new(timeout: Cycle) -> Self {
        Self {
            timeout,
            last_activity: 0,
            quiet_cycles: 0,
            reported: false,
        }
    }

    /// Record the end of a cycle. Returns true when a possible deadlock is
    /// reported; each stall is reported once.
    pub fn observe(&mut self, now: Cycle, activity: u64, live_flits: usize) -> bool {
        if activity != self.last_activity || live_flits == 0 {
            self.last_activity = activity;
            self.quiet_cycles = 0;
            self.reported = false;
            return false;
        }
        self.quiet_cycles += 1;
        if self.timeout > 0 && self.quiet_cycles >= self.timeout && !self.reported {
            warn!(
                "{} | possible deadlock: {} flits alive, no progress for {} cycles",
                now, live_flits, self.quiet_cycles
            );
            self.reported = true;
            return true;
        }
        false
    }

    pub fn is_stalled(&self) -> bool {
        self.reported
    }
}

#[derive(Debug)]
pub struct Simulation {
    network: Network,
    ctx: SimulationContext,
    watchdog: DeadlockWatchdog,
}

impl Simulation {
    pub fn new(network: Network, seed: u64, deadlock_warn_timeout: Cycle) -> Self {
        Self {
            network,
            ctx: SimulationContext::new(seed),
            watchdog: DeadlockWatchdog::new(deadlock_warn_timeout),
        }
    }

    pub fn from_config(config: &NetworkConfiguration) -> Result<Self, Error> {
        Self::from_config_with_registry(config, &RoutingRegistry::new())
    }

    /// Build the configured topology, looking the routing function up in
    /// `registry`.
    pub fn from_config_with_registry(
        config: &NetworkConfiguration,
        registry: &RoutingRegistry,
    ) -> Result<Self, Error> {
        config.validate()?;
        let params = RoutingParameters {
            dims: config.dims.clone(),
            num_vcs: config.router.num_vcs,
        };
        let routing: Rc<dyn RoutingFunction> =
            registry.build(&config.routing_function, &params)?.into();
        let network = match config.topology {
            TopologyType::Mesh => mesh(config, routing)?,
            TopologyType::Torus => torus(config, routing)?,
        };
        debug!(
            "built {} {:?} with {} routers",
            config.topology,
            config.dims,
            network.routers().len()
        );
        Ok(Self::new(network, config.seed, config.deadlock_warn_timeout))
    }

    pub fn cycle(&self) -> Cycle {
        self.ctx.cycle
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SimulationContext {
        &mut self.ctx
    }

    /// Flits created and not yet ejected, including source queues.
    pub fn live_flits(&self) -> usize {
        self.ctx.flits.live()
    }

    pub fn possible_deadlock(&self) -> bool {
        self.watchdog.is_stalled()
    }

    pub fn enqueue_packet(&mut self, src: usize, dest: usize, size: usize) -> Result<u64, Error> {
        self.enqueue(src, &PacketRequest::new(dest, size))
    }

    pub fn enqueue(&mut self, src: usize, request: &PacketRequest) -> Result<u64, Error> {
        let terminals = self.network.terminals().len();
        if src >= terminals || request.dest >= terminals {
            return Err(Error::InvalidConfiguration(format!(
                "packet {} -> {} outside of {} terminals",
                src, request.dest, terminals
            )));
        }
        self.network
            .terminal_mut(src)
            .enqueue_packet(&mut self.ctx, request)
    }

    /// Advance one cycle.
    pub fn step(&mut self) -> Result<(), Error> {
        self.network.read_inputs(&mut self.ctx)?;
        self.network.evaluate(&mut self.ctx)?;
        self.network.write_outputs(&mut self.ctx)?;
        self.watchdog.observe(
            self.ctx.cycle,
            self.network.activity(),
            self.ctx.flits.live(),
        );
        self.ctx.cycle += 1;
        Ok(())
    }

    pub fn run(&mut self, cycles: Cycle) -> Result<(), Error> {
        for _ in 0..cycles {
            self.step()?;
        }
        Ok(())
    }

    /// Step until every flit has been ejected or `max_cycles` have run.
    /// Returns true if the network drained.
    pub fn drain(&mut self, max_cycles: Cycle) -> Result<bool, Error> {
        for _ in 0..max_cycles {
            if self.ctx.flits.live() == 0 {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(self.ctx.flits.live() == 0)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats::collect(
            self.ctx.cycle,
            self.ctx.flits.live(),
            self.network
                .routers()
                .iter()
                .map(|r| r.stats().clone())
                .collect(),
            self.network
                .terminals()
                .iter()
                .map(|t| t.stats().clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_reports_once_per_stall() {
        let mut watchdog = DeadlockWatchdog::new(3);
        assert!(!watchdog.observe(0, 1, 4));
        assert!(!watchdog.observe(1, 1, 4));
        assert!(!watchdog.observe(2, 1, 4));
        assert!(watchdog.observe(3, 1, 4));
        assert!(watchdog.is_stalled());
        assert!(!watchdog.observe(4, 1, 4));
        // progress clears the stall
        assert!(!watchdog.observe(5, 2, 4));
        assert!(!watchdog.is_stalled());
    }

    #[test]
    fn idle_network_is_not_stalled() {
        let mut watchdog = DeadlockWatchdog::new(1);
        for t in 0..10 {
            assert!(!watchdog.observe(t, 0, 0));
        }
    }

    #[test]
    fn single_packet_on_a_line() {
        let config = NetworkConfiguration {
            dims: vec![3],
            ..Default::default()
        };
        let mut sim = Simulation::from_config(&config).unwrap();
        sim.enqueue_packet(0, 2, 4).unwrap();
        assert!(sim.drain(100).unwrap());
        let stats = sim.stats();
        assert_eq!(stats.ejected_packets, 1);
        assert_eq!(stats.ejected_flits, 4);
        // two router-to-router hops plus the ejection hop
        assert_eq!(stats.average_hops, 3.0);
        assert!(!sim.possible_deadlock());
    }

    #[test]
    fn rejects_unknown_terminals() {
        let mut sim = Simulation::from_config(&NetworkConfiguration::default()).unwrap();
        assert!(sim.enqueue_packet(0, 16, 1).is_err());
        assert!(sim.enqueue_packet(16, 0, 1).is_err());
    }

    #[test]
    fn unknown_routing_function() {
        let config = NetworkConfiguration {
            routing_function: "min_adapt".to_string(),
            ..Default::default()
        };
        assert_eq!(
            Simulation::from_config(&config).unwrap_err(),
            Error::UnknownRoutingFunction("min_adapt".to_string())
        );
    }
}
