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

use itertools::Itertools;
use std::rc::Rc;

use super::{grid_port, grid_radix, linearize_index, terminal_port};
use crate::config::NetworkConfiguration;
use crate::network::{Network, NetworkBuilder};
use crate::routing::RoutingFunction;
use crate::Error;

/// A k-ary n-mesh: like a torus, without the wrap-around links.
pub fn mesh(config: &NetworkConfiguration, routing: Rc<dyn RoutingFunction>) -> Result<Network, Error> {
    let dims = &config.dims;
    let mut builder = NetworkBuilder::new(&config.router, routing)?;
    let nodes = dims.iter().product::<usize>();
    for _ in 0..nodes {
        builder.add_router(grid_radix(dims))?;
    }

    // build the links: for each node, add the connections to their
    // "higher" node pairs.
    for e in dims.iter().map(|&ub| 0..ub).multi_cartesian_product() {
        // e is a vector that contains the coordinates of a node
        for (d, m) in dims.iter().enumerate() {
            if e[d] + 1 == *m {
                continue;
            }
            let mut n = e.clone();
            n[d] = e[d] + 1;

            let src = linearize_index(&e, dims);
            let dst = linearize_index(&n, dims);

            // all the links are bidirectional
            builder.connect(
                src,
                grid_port(d, true),
                dst,
                grid_port(d, false),
                config.channel_latency,
                config.credit_latency,
            )?;
            builder.connect(
                dst,
                grid_port(d, false),
                src,
                grid_port(d, true),
                config.channel_latency,
                config.credit_latency,
            )?;
        }
    }

    for router in 0..nodes {
        builder.attach_terminal(
            router,
            terminal_port(dims),
            config.channel_latency,
            config.credit_latency,
        )?;
    }
    Ok(builder.build())
}
