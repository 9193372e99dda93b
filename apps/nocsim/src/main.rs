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

//! Runs synthetic traffic through a mesh or torus and prints the network
//! statistics as YAML.

use anyhow::{bail, Context};
use env_logger::Target;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::Serialize;
use std::str::FromStr;
use structopt::StructOpt;

use noc::{NetworkConfiguration, NetworkStats, PacketRequest, Simulation};

/// Destination choice for generated packets.
#[derive(Clone, Copy, Debug)]
enum Traffic {
    Uniform,
    /// Terminal i sends to terminal n - 1 - i.
    Complement,
    /// Coordinates reversed: (x, y) sends to (y, x).
    Transpose,
}

impl FromStr for Traffic {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Traffic::Uniform),
            "complement" => Ok(Traffic::Complement),
            "transpose" => Ok(Traffic::Transpose),
            _ => Err(Self::Err::new(
                std::io::ErrorKind::Other,
                format!("Invalid traffic pattern: {}", s),
            )),
        }
    }
}

impl Traffic {
    fn destination(&self, src: usize, dims: &[usize], rng: &mut Pcg64) -> usize {
        let nodes: usize = dims.iter().product();
        match self {
            Traffic::Uniform => rng.gen_range(0..nodes),
            Traffic::Complement => nodes - 1 - src,
            Traffic::Transpose => {
                let mut coords = noc::topologies::delinearize_index(src, dims);
                coords.reverse();
                noc::topologies::linearize_index(&coords, dims)
            }
        }
    }
}

#[derive(StructOpt)]
#[structopt(name = "nocsim", about = "Cycle-level simulation of a virtual-channel network")]
struct Arguments {
    /// YAML network configuration; defaults to a 4x4 mesh
    #[structopt(short, long)]
    config: Option<String>,
    #[structopt(long, default_value = "10000")]
    cycles: usize,
    /// Packets offered per terminal per cycle
    #[structopt(short, long, default_value = "0.05")]
    rate: f64,
    /// Flits per packet
    #[structopt(short, long, default_value = "4")]
    packet_size: usize,
    /// supported patterns: uniform, complement, transpose
    #[structopt(short, long, default_value = "uniform")]
    traffic: Traffic,
    /// Overrides the seed of the configuration
    #[structopt(short, long)]
    seed: Option<u64>,
    /// Cycles allowed, after injection stops, for the network to drain
    #[structopt(short, long, default_value = "0")]
    drain: usize,
}

#[derive(Serialize)]
struct Report {
    drained: bool,
    possible_deadlock: bool,
    offered_packets: u64,
    stats: NetworkStats,
}

fn run(args: &Arguments) -> anyhow::Result<Report> {
    let mut config = match &args.config {
        Some(file) => NetworkConfiguration::from_file(file)
            .with_context(|| format!("reading configuration {}", file))?,
        None => NetworkConfiguration::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if !(0.0..=1.0).contains(&args.rate) {
        bail!("injection rate {} is not a probability", args.rate);
    }
    if args.packet_size == 0 {
        bail!("packets need at least one flit");
    }
    if let Traffic::Transpose = args.traffic {
        if config.dims.windows(2).any(|w| w[0] != w[1]) {
            bail!("transpose traffic needs equal dimensions, got {:?}", config.dims);
        }
    }

    let mut simulation = Simulation::from_config(&config)?;
    let mut rng = Pcg64::seed_from_u64(config.seed);
    let terminals = simulation.network().terminals().len();
    let mut offered_packets = 0;
    log::info!(
        "{} {:?}, {} terminals, {:?} traffic at {}",
        config.topology,
        config.dims,
        terminals,
        args.traffic,
        args.rate
    );

    for _ in 0..args.cycles {
        for src in 0..terminals {
            if rng.gen_bool(args.rate) {
                let dest = args.traffic.destination(src, &config.dims, &mut rng);
                simulation.enqueue(src, &PacketRequest::new(dest, args.packet_size))?;
                offered_packets += 1;
            }
        }
        simulation.step()?;
    }
    let drained = simulation.drain(args.drain)?;
    if !drained {
        log::info!(
            "{} flits still alive after {} cycles",
            simulation.live_flits(),
            simulation.cycle()
        );
    }

    Ok(Report {
        drained,
        possible_deadlock: simulation.possible_deadlock(),
        offered_packets,
        stats: simulation.stats(),
    })
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("nocsim"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .parse_default_env()
        .init();

    let report = run(&args)?;
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}
