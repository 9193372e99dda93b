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

use serde::Serialize;

use crate::Cycle;

/// Per-router event counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouterStats {
    /// Flits received, per input port.
    pub flits_received: Vec<u64>,
    /// Flits sent, per output port.
    pub flits_sent: Vec<u64>,
    pub vc_grants: u64,
    pub sw_grants: u64,
    /// Speculative switch grants that moved a flit.
    pub spec_grants: u64,
    /// Speculative switch grants dropped by the filter or by a failed VC
    /// allocation.
    pub spec_discarded: u64,
}

impl RouterStats {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            flits_received: vec![0; inputs],
            flits_sent: vec![0; outputs],
            ..Default::default()
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.flits_sent.iter().sum()
    }
}

/// Per-terminal traffic counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TerminalStats {
    pub packets_created: u64,
    pub flits_injected: u64,
    pub flits_ejected: u64,
    pub packets_ejected: u64,
    /// Sum over ejected packets of tail ejection cycle minus creation cycle.
    pub total_latency: u64,
    pub max_latency: Cycle,
    /// Sum over ejected packets of the hops taken by their tail flit.
    pub total_hops: u64,
    /// Flits that reached a terminal other than their destination.
    pub misrouted: u64,
    /// Body or tail flits not following the previous flit of their packet.
    pub out_of_order: u64,
}

impl TerminalStats {
    pub fn record_packet(&mut self, latency: Cycle, hops: usize) {
        self.packets_ejected += 1;
        self.total_latency += latency as u64;
        self.max_latency = self.max_latency.max(latency);
        self.total_hops += hops as u64;
    }
}

/// Aggregate over a network, ready to be dumped as YAML.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkStats {
    pub cycles: Cycle,
    pub injected_flits: u64,
    pub ejected_flits: u64,
    pub ejected_packets: u64,
    pub live_flits: usize,
    pub average_packet_latency: f64,
    pub max_packet_latency: Cycle,
    pub average_hops: f64,
    pub speculative_grants: u64,
    pub speculative_discards: u64,
    pub routers: Vec<RouterStats>,
    pub terminals: Vec<TerminalStats>,
}

impl NetworkStats {
    pub fn collect(
        cycles: Cycle,
        live_flits: usize,
        routers: Vec<RouterStats>,
        terminals: Vec<TerminalStats>,
    ) -> Self {
        let ejected_packets: u64 = terminals.iter().map(|t| t.packets_ejected).sum();
        let total_latency: u64 = terminals.iter().map(|t| t.total_latency).sum();
        let total_hops: u64 = terminals.iter().map(|t| t.total_hops).sum();
        let average = |total: u64| {
            if ejected_packets == 0 {
                0.0
            } else {
                total as f64 / ejected_packets as f64
            }
        };
        Self {
            cycles,
            injected_flits: terminals.iter().map(|t| t.flits_injected).sum(),
            ejected_flits: terminals.iter().map(|t| t.flits_ejected).sum(),
            ejected_packets,
            live_flits,
            average_packet_latency: average(total_latency),
            max_packet_latency: terminals.iter().map(|t| t.max_latency).max().unwrap_or(0),
            average_hops: average(total_hops),
            speculative_grants: routers.iter().map(|r| r.spec_grants).sum(),
            speculative_discards: routers.iter().map(|r| r.spec_discarded).sum(),
            routers,
            terminals,
        }
    }
}
