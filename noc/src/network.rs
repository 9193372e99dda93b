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

use log::debug;
use petgraph::algo::dijkstra;
use petgraph::graph::{node_index, DiGraph};
use std::rc::Rc;

use crate::channel::{ChannelBank, LinkEnd};
use crate::config::RouterConfiguration;
use crate::router::Router;
use crate::routing::RoutingFunction;
use crate::sim::{Clocked, SimulationContext};
use crate::terminal::Terminal;
use crate::{Cycle, Error};

/// A router-to-router connection, stored on the edges of the network graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkInfo {
    pub src_port: usize,
    pub dst_port: usize,
    pub latency: Cycle,
}

/// Routers, terminals and the channels between them.
///
/// The graph has one node per router, with the router id as both weight and
/// node index, and one edge per unidirectional router-to-router link.
#[derive(Debug)]
pub struct Network {
    routers: Vec<Router>,
    terminals: Vec<Terminal>,
    channels: ChannelBank,
    graph: DiGraph<usize, LinkInfo>,
}

impl Network {
    pub fn routers(&self) -> &[Router] {
        &self.routers
    }

    pub fn router(&self, id: usize) -> &Router {
        &self.routers[id]
    }

    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }

    pub fn terminal(&self, id: usize) -> &Terminal {
        &self.terminals[id]
    }

    pub fn terminal_mut(&mut self, id: usize) -> &mut Terminal {
        &mut self.terminals[id]
    }

    pub fn graph(&self) -> &DiGraph<usize, LinkInfo> {
        &self.graph
    }

    pub fn channels(&self) -> &ChannelBank {
        &self.channels
    }

    /// Minimum number of router-to-router links between two routers.
    pub fn min_hops(&self, src: usize, dst: usize) -> Option<usize> {
        let target = node_index(dst);
        dijkstra(&self.graph, node_index(src), Some(target), |_| 1usize)
            .get(&target)
            .copied()
    }

    /// Flits in routers or on channels, excluding source queues.
    pub fn in_flight(&self) -> usize {
        self.routers.iter().map(|r| r.in_flight()).sum::<usize>() + self.channels.flits_in_flight()
    }

    /// Monotonic count of flit movements, used to detect progress.
    pub fn activity(&self) -> u64 {
        let routed: u64 = self.routers.iter().map(|r| r.stats().total_sent()).sum();
        let terminals: u64 = self
            .terminals
            .iter()
            .map(|t| t.stats().flits_injected + t.stats().flits_ejected)
            .sum();
        routed + terminals
    }

    pub fn read_inputs(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        self.channels.read_inputs()?;
        for router in self.routers.iter_mut() {
            router.read_inputs(ctx, &mut self.channels)?;
        }
        for terminal in self.terminals.iter_mut() {
            terminal.read_inputs(ctx, &mut self.channels)?;
        }
        Ok(())
    }

    pub fn evaluate(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        for router in self.routers.iter_mut() {
            router.evaluate(ctx)?;
        }
        for terminal in self.terminals.iter_mut() {
            terminal.evaluate(ctx)?;
        }
        Ok(())
    }

    pub fn write_outputs(&mut self, ctx: &mut SimulationContext) -> Result<(), Error> {
        for router in self.routers.iter_mut() {
            router.write_outputs(ctx, &mut self.channels)?;
        }
        for terminal in self.terminals.iter_mut() {
            terminal.write_outputs(ctx, &mut self.channels)?;
        }
        self.channels.write_outputs();
        Ok(())
    }
}

/// Incremental construction of a [`Network`]: add routers, wire their
/// ports, hang terminals off them.
#[derive(Debug)]
pub struct NetworkBuilder {
    config: RouterConfiguration,
    routing: Rc<dyn RoutingFunction>,
    routers: Vec<Router>,
    terminals: Vec<Terminal>,
    channels: ChannelBank,
    graph: DiGraph<usize, LinkInfo>,
}

impl NetworkBuilder {
    pub fn new(config: &RouterConfiguration, routing: Rc<dyn RoutingFunction>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            routing,
            routers: Vec::new(),
            terminals: Vec::new(),
            channels: ChannelBank::new(),
            graph: DiGraph::new(),
        })
    }

    /// Add a router with `radix` input and output ports; returns its id.
    pub fn add_router(&mut self, radix: usize) -> Result<usize, Error> {
        let id = self.routers.len();
        let router = Router::new(
            id,
            &format!("router_{}", id),
            radix,
            radix,
            &self.config,
            self.routing.clone(),
        )?;
        self.routers.push(router);
        let node = self.graph.add_node(id);
        debug_assert_eq!(node.index(), id);
        Ok(id)
    }

    fn check_router(&self, id: usize) -> Result<(), Error> {
        if id < self.routers.len() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration(format!("no router {}", id)))
        }
    }

    fn check_latency(latency: Cycle, credit_latency: Cycle) -> Result<(), Error> {
        if latency == 0 || credit_latency == 0 {
            return Err(Error::InvalidConfiguration(
                "channel latencies must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn add_link(&mut self, latency: Cycle, credit_latency: Cycle) -> LinkEnd {
        LinkEnd {
            flits: self.channels.add_flit_channel(latency),
            credits: self.channels.add_credit_channel(credit_latency),
        }
    }

    /// Connect output `src_port` of router `src` to input `dst_port` of
    /// router `dst`, with the credit channel running the other way.
    pub fn connect(
        &mut self,
        src: usize,
        src_port: usize,
        dst: usize,
        dst_port: usize,
        latency: Cycle,
        credit_latency: Cycle,
    ) -> Result<(), Error> {
        self.check_router(src)?;
        self.check_router(dst)?;
        Self::check_latency(latency, credit_latency)?;
        let link = self.add_link(latency, credit_latency);
        self.routers[src].connect_output(src_port, link.flits, link.credits)?;
        self.routers[dst].connect_input(dst_port, link.flits, link.credits)?;
        self.graph.add_edge(
            node_index(src),
            node_index(dst),
            LinkInfo {
                src_port,
                dst_port,
                latency,
            },
        );
        debug!("router_{}:{} -> router_{}:{}", src, src_port, dst, dst_port);
        Ok(())
    }

    /// Attach a new terminal to input and output `port` of `router`; returns
    /// the terminal id.
    pub fn attach_terminal(
        &mut self,
        router: usize,
        port: usize,
        latency: Cycle,
        credit_latency: Cycle,
    ) -> Result<usize, Error> {
        self.check_router(router)?;
        Self::check_latency(latency, credit_latency)?;
        let inject = self.add_link(latency, credit_latency);
        let eject = self.add_link(latency, credit_latency);
        self.routers[router].connect_input(port, inject.flits, inject.credits)?;
        self.routers[router].connect_output(port, eject.flits, eject.credits)?;
        let id = self.terminals.len();
        self.terminals.push(Terminal::new(
            id,
            self.routers[router].view(),
            port,
            &self.config,
            self.routing.clone(),
            inject,
            eject,
        ));
        Ok(id)
    }

    pub fn build(self) -> Network {
        Network {
            routers: self.routers,
            terminals: self.terminals,
            channels: self.channels,
            graph: self.graph,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RoutingParameters, RoutingRegistry};

    fn builder() -> NetworkBuilder {
        let config = RouterConfiguration::default();
        let routing = RoutingRegistry::new()
            .build(
                "dim_order_mesh",
                &RoutingParameters {
                    dims: vec![2],
                    num_vcs: config.num_vcs,
                },
            )
            .unwrap();
        NetworkBuilder::new(&config, routing.into()).unwrap()
    }

    #[test]
    fn ports_are_used_once() {
        let mut b = builder();
        let r0 = b.add_router(3).unwrap();
        let r1 = b.add_router(3).unwrap();
        b.connect(r0, 0, r1, 1, 1, 1).unwrap();
        assert_eq!(
            b.connect(r0, 0, r1, 0, 1, 1),
            Err(Error::InvalidPort { router: 0, port: 0 })
        );
        assert_eq!(
            b.connect(r0, 5, r1, 0, 1, 1),
            Err(Error::InvalidPort { router: 0, port: 5 })
        );
        assert!(b.connect(r0, 1, 7, 0, 1, 1).is_err());
        assert!(b.attach_terminal(r1, 2, 0, 1).is_err());
        assert_eq!(b.attach_terminal(r1, 2, 1, 1), Ok(0));
    }

    #[test]
    fn graph_mirrors_links() {
        let mut b = builder();
        for _ in 0..3 {
            b.add_router(3).unwrap();
        }
        b.connect(0, 0, 1, 1, 2, 1).unwrap();
        b.connect(1, 0, 2, 1, 2, 1).unwrap();
        let network = b.build();
        assert_eq!(network.graph().edge_count(), 2);
        assert_eq!(network.min_hops(0, 2), Some(2));
        assert_eq!(network.min_hops(2, 0), None);
        assert_eq!(network.channels().flits.len(), 2);
        assert_eq!(network.in_flight(), 0);
    }
}
