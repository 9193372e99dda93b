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

use itertools::iproduct;
use rand::{Rng, SeedableRng};
use rand_core::RngCore;
use rand_xoshiro::Xoshiro256StarStar;

use noc::config::{AllocatorType, ArbiterType, BufferPolicyType, SpecFilter, TopologyType, VcPriority};
use noc::routing::{RoutingParameters, RoutingRegistry};
use noc::topologies::{delinearize_index, grid_port, terminal_port};
use noc::{Error, Flit, NetworkConfiguration, OutputSet, RouterView, RoutingFunction, Simulation};

fn init_logger() {
    let _logger = env_logger::builder().is_test(true).try_init();
}

/// Every terminal sends `packets` packets of 1 to 4 flits to random
/// destinations, all created at cycle 0.
fn uniform_traffic(sim: &mut Simulation, packets: usize, seed: u64) -> usize {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let terminals = sim.network().terminals().len();
    let mut flits = 0;
    for _ in 0..packets {
        for src in 0..terminals {
            let dest = rng.gen_range(0..terminals);
            let size = rng.gen_range(1..=4);
            sim.enqueue_packet(src, dest, size).unwrap();
            flits += size;
        }
    }
    flits
}

/// Drain the network, then check that every credit came back.
fn drain_and_check(sim: &mut Simulation, max_cycles: usize) {
    assert!(sim.drain(max_cycles).unwrap(), "network did not drain");
    // let the last credits arrive
    sim.run(10).unwrap();
    for router in sim.network().routers() {
        router.check_invariants().unwrap();
        for port in 0..router.outputs() {
            let buf = router.buffer_state(port);
            assert_eq!(buf.total_occupancy(), 0, "{} port {}", router.name(), port);
            for vc in 0..buf.num_vcs() {
                assert_eq!(buf.in_use_by(vc), None);
            }
        }
        assert_eq!(router.in_flight(), 0);
    }
    for terminal in sim.network().terminals() {
        assert_eq!(terminal.buffer_state().total_occupancy(), 0);
        assert_eq!(terminal.stats().misrouted, 0);
        assert_eq!(terminal.stats().out_of_order, 0);
    }
    assert!(!sim.possible_deadlock());
}

#[test]
fn mesh_delivers_everything() {
    init_logger();
    let config = NetworkConfiguration::default();
    let mut sim = Simulation::from_config(&config).unwrap();
    let flits = uniform_traffic(&mut sim, 20, 1);
    drain_and_check(&mut sim, 20_000);

    let stats = sim.stats();
    assert_eq!(stats.ejected_flits as usize, flits);
    assert_eq!(stats.injected_flits as usize, flits);
    assert_eq!(stats.ejected_packets, 20 * 16);
    assert_eq!(stats.live_flits, 0);
    // minimal routing: between 1 (self) and 7 (corner to corner) routers
    assert!(stats.average_hops >= 1.0 && stats.average_hops <= 7.0);
    assert!(stats.max_packet_latency > 0);
}

#[test]
fn hops_match_the_graph_distance() {
    init_logger();
    let config = NetworkConfiguration {
        dims: vec![4, 3],
        ..Default::default()
    };
    let mut sim = Simulation::from_config(&config).unwrap();
    let (src, dest) = (0, 11);
    sim.enqueue_packet(src, dest, 3).unwrap();
    assert!(sim.drain(200).unwrap());
    let distance = sim.network().min_hops(src, dest).unwrap();
    // every router on the path forwards the packet once, the last one to
    // the terminal
    assert_eq!(
        sim.network().terminal(dest).stats().total_hops as usize,
        distance + 1
    );
}

#[test]
fn zero_load_latency() {
    init_logger();
    let config = NetworkConfiguration {
        dims: vec![4],
        ..Default::default()
    };
    let mut sim = Simulation::from_config(&config).unwrap();
    sim.enqueue_packet(0, 3, 1).unwrap();
    assert!(sim.drain(200).unwrap());
    // injection: select a VC at 0 and send, 1 cycle on the channel; then
    // 4 routers of 3 cycles each, the last one ending on the ejection
    // channel
    assert_eq!(sim.stats().max_packet_latency, 1 + 4 * 3);
}

#[test]
fn allocators_and_policies() {
    init_logger();
    let allocators = [
        AllocatorType::SeparableInputFirst,
        AllocatorType::SeparableOutputFirst,
        AllocatorType::Islip,
        AllocatorType::Wavefront,
    ];
    let policies = [
        BufferPolicyType::Private,
        BufferPolicyType::Shared,
        BufferPolicyType::Limited,
        BufferPolicyType::Dynamic,
    ];
    for (&allocator, &policy, &speculative) in
        iproduct!(allocators.iter(), policies.iter(), [false, true].iter())
    {
        let mut config = NetworkConfiguration {
            dims: vec![3, 3],
            ..Default::default()
        };
        config.router.vc_allocator = allocator;
        config.router.sw_allocator = allocator;
        config.router.buffer_policy = policy;
        config.router.buf_size = 10;
        config.router.vc_buf_size = if policy == BufferPolicyType::Private { 5 } else { 6 };
        config.router.private_buf_size = 2;
        config.router.speculative = speculative;
        log::debug!("{:?} {:?} speculative={}", allocator, policy, speculative);

        let mut sim = Simulation::from_config(&config).unwrap();
        let flits = uniform_traffic(&mut sim, 10, 2);
        drain_and_check(&mut sim, 20_000);
        assert_eq!(sim.stats().ejected_flits as usize, flits);
    }
}

#[test]
fn router_options() {
    init_logger();
    let variants: Vec<Box<dyn Fn(&mut NetworkConfiguration)>> = vec![
        Box::new(|c: &mut NetworkConfiguration| c.router.arbiter = ArbiterType::Matrix),
        Box::new(|c: &mut NetworkConfiguration| c.router.alloc_iters = 3),
        Box::new(|c: &mut NetworkConfiguration| c.router.wait_for_tail_credit = true),
        Box::new(|c: &mut NetworkConfiguration| c.router.vc_busy_when_full = true),
        Box::new(|c: &mut NetworkConfiguration| {
            c.router.input_speedup = 2;
            c.router.output_speedup = 2;
        }),
        Box::new(|c: &mut NetworkConfiguration| c.router.output_buffer_size = 1),
        Box::new(|c: &mut NetworkConfiguration| {
            c.router.routing_delay = 1;
            c.router.vc_alloc_delay = 2;
            c.router.sw_alloc_delay = 2;
            c.router.crossbar_delay = 2;
        }),
        Box::new(|c: &mut NetworkConfiguration| {
            c.router.speculative = true;
            c.router.spec_filter = SpecFilter::MaskByRequests;
        }),
        Box::new(|c: &mut NetworkConfiguration| c.router.vc_priority = VcPriority::LocalAge),
        Box::new(|c: &mut NetworkConfiguration| c.router.vc_priority = VcPriority::QueueLength),
        Box::new(|c: &mut NetworkConfiguration| c.router.vc_priority = VcPriority::HopCount),
        Box::new(|c: &mut NetworkConfiguration| c.channel_latency = 3),
        Box::new(|c: &mut NetworkConfiguration| c.credit_latency = 4),
        Box::new(|c: &mut NetworkConfiguration| {
            c.router.num_vcs = 4;
            c.routing_function = "xy_yx_mesh".to_string();
        }),
    ];
    for (i, variant) in variants.iter().enumerate() {
        let mut config = NetworkConfiguration {
            dims: vec![3, 3],
            ..Default::default()
        };
        variant(&mut config);
        log::debug!("variant {}: {:?}", i, config.router);
        let mut sim = Simulation::from_config(&config).unwrap();
        let flits = uniform_traffic(&mut sim, 10, 3 + i as u64);
        drain_and_check(&mut sim, 20_000);
        assert_eq!(sim.stats().ejected_flits as usize, flits, "variant {}", i);
    }
}

#[test]
fn torus_with_dateline_drains() {
    init_logger();
    let config = NetworkConfiguration {
        topology: TopologyType::Torus,
        dims: vec![4, 4],
        routing_function: "dim_order_torus".to_string(),
        ..Default::default()
    };
    let mut sim = Simulation::from_config(&config).unwrap();
    let flits = uniform_traffic(&mut sim, 30, 4);
    drain_and_check(&mut sim, 50_000);
    assert_eq!(sim.stats().ejected_flits as usize, flits);
}

#[test]
fn flit_priorities_drain() {
    init_logger();
    let mut config = NetworkConfiguration {
        dims: vec![2],
        ..Default::default()
    };
    config.router.vc_priority = VcPriority::Flit;
    config.router.sw_allocator = AllocatorType::Wavefront;
    config.router.vc_allocator = AllocatorType::Wavefront;
    let mut sim = Simulation::from_config(&config).unwrap();
    for _ in 0..5 {
        sim.enqueue_packet(0, 1, 4).unwrap();
    }
    let mut urgent = noc::PacketRequest::new(1, 4);
    urgent.priority = 10;
    urgent.watch = true;
    sim.enqueue(0, &urgent).unwrap();
    drain_and_check(&mut sim, 1000);
    assert_eq!(sim.stats().ejected_packets, 6);
}

/// Always travels up its ring, on any VC: deadlocks on a torus.
#[derive(Debug)]
struct Greedy {
    dims: Vec<usize>,
    num_vcs: usize,
}

impl RoutingFunction for Greedy {
    fn route(
        &self,
        router: &RouterView,
        flit: &mut Flit,
        in_port: usize,
        inject: bool,
        _rng: &mut dyn RngCore,
    ) -> OutputSet {
        let mut outputs = OutputSet::new();
        let port = if inject {
            in_port
        } else if delinearize_index(router.id, &self.dims) == delinearize_index(flit.dest, &self.dims) {
            terminal_port(&self.dims)
        } else {
            grid_port(0, true)
        };
        outputs.add_range(port, 0, self.num_vcs - 1, 0);
        outputs
    }
}

fn greedy(params: &RoutingParameters) -> Result<Box<dyn RoutingFunction>, Error> {
    Ok(Box::new(Greedy {
        dims: params.dims.clone(),
        num_vcs: params.num_vcs,
    }))
}

#[test]
fn watchdog_reports_a_cyclic_wait() {
    init_logger();
    let mut config = NetworkConfiguration {
        topology: TopologyType::Torus,
        dims: vec![4],
        routing_function: "greedy".to_string(),
        deadlock_warn_timeout: 50,
        ..Default::default()
    };
    config.router.num_vcs = 1;
    config.router.vc_buf_size = 1;
    let mut registry = RoutingRegistry::new();
    registry.register("greedy", greedy);
    let mut sim = Simulation::from_config_with_registry(&config, &registry).unwrap();
    // every packet holds a VC on its first link while waiting for the next
    for src in 0..4 {
        sim.enqueue_packet(src, (src + 2) % 4, 8).unwrap();
    }
    sim.run(300).unwrap();
    assert!(sim.possible_deadlock());
    assert!(sim.live_flits() > 0);
}
