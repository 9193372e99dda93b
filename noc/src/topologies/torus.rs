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

/// A k-ary n-cube: every ring of length 2 or more is closed by a
/// wrap-around link.
pub fn torus(config: &NetworkConfiguration, routing: Rc<dyn RoutingFunction>) -> Result<Network, Error> {
    let dims = &config.dims;
    let mut builder = NetworkBuilder::new(&config.router, routing)?;
    let nodes = dims.iter().product::<usize>();
    for _ in 0..nodes {
        builder.add_router(grid_radix(dims))?;
    }

    for e in dims.iter().map(|&ub| 0..ub).multi_cartesian_product() {
        for (d, m) in dims.iter().enumerate() {
            if *m < 2 {
                continue;
            }
            let mut n = e.clone();
            n[d] = (e[d] + 1) % m;

            let src = linearize_index(&e, dims);
            let dst = linearize_index(&n, dims);

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

#[cfg(test)]
mod topology_tests {
    use super::*;
    use crate::config::TopologyType;
    use crate::routing::{RoutingParameters, RoutingRegistry};
    use crate::topologies::delinearize_index;
    use petgraph::graph::node_index;
    use std::convert::TryInto;

    #[test]
    fn test_torus() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let (x, y, z) = (3, 4, 3);
        let dims = vec![x, y, z];
        let config = NetworkConfiguration {
            topology: TopologyType::Torus,
            dims: dims.clone(),
            routing_function: "dim_order_torus".to_string(),
            ..Default::default()
        };
        let routing = RoutingRegistry::new()
            .build(
                &config.routing_function,
                &RoutingParameters {
                    dims: dims.clone(),
                    num_vcs: config.router.num_vcs,
                },
            )
            .unwrap();
        let topo = torus(&config, routing.into()).unwrap();
        assert_eq!(topo.routers().len(), x * y * z);
        assert_eq!(topo.graph().edge_count(), 2 * 3 * x * y * z);

        /*
          0  1  2    12 13 14    24 25 26
          3  4  5    15 *16 17   27 28 29
          6  7  8    18 19 20    30 31 32
          9 10 11    21 22 23    33 34 35

         16 is connected to 15, 17, 13, 19, 4, 28
        */
        let index = node_index(linearize_index(&[1, 1, 1], &dims));
        let neighbors = [
            [0, 1, 1],
            [2, 1, 1],
            [1, 0, 1],
            [1, 2, 1],
            [1, 1, 0],
            [1, 1, 2],
        ];
        for n in topo.graph().neighbors(index) {
            let e = delinearize_index(n.index(), &dims);
            log::debug!("\tneighbor: {:?}", e);
            assert!(neighbors.contains(&e.try_into().unwrap()));
        }

        // wrap-around links shorten the corner-to-corner path
        assert_eq!(topo.min_hops(0, x * y * z - 1), Some(3));
    }
}
