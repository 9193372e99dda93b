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

//! Routing functions and the registry that builds them by name.
//!
//! A routing function maps the head flit of a packet to the set of output
//! ports and VC ranges it may take at the current router. When called with
//! `inject == true` it is asked on behalf of the source terminal instead:
//! only the VC ranges matter, naming the router VCs the packet may be
//! injected on.

use log::debug;
use rand::Rng;
use rand_core::RngCore;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::flit::Flit;
use crate::topologies::{delinearize_index, grid_port, terminal_port};
use crate::Error;

/// A contiguous, inclusive range of VCs on one output port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputCandidate {
    pub port: usize,
    pub vc_start: usize,
    pub vc_end: usize,
    /// Preference among candidates; higher is better.
    pub priority: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutputSet {
    candidates: Vec<OutputCandidate>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, port: usize, vc_start: usize, vc_end: usize, priority: i64) {
        assert!(vc_start <= vc_end, "empty VC range");
        self.candidates.push(OutputCandidate {
            port,
            vc_start,
            vc_end,
            priority,
        });
    }

    pub fn candidates(&self) -> &[OutputCandidate] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Every (port, vc, priority) the set allows.
    pub fn iter_vcs(&self) -> impl Iterator<Item = (usize, usize, i64)> + '_ {
        self.candidates
            .iter()
            .flat_map(|c| (c.vc_start..=c.vc_end).map(move |vc| (c.port, vc, c.priority)))
    }

    pub fn contains(&self, port: usize, vc: usize) -> bool {
        self.iter_vcs().any(|(p, v, _)| p == port && v == vc)
    }

    /// Distinct ports, in candidate order.
    pub fn ports(&self) -> Vec<usize> {
        let mut ports: Vec<usize> = Vec::new();
        for c in &self.candidates {
            if !ports.contains(&c.port) {
                ports.push(c.port);
            }
        }
        ports
    }
}

/// What a routing function may know about the router it runs in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouterView {
    pub id: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub num_vcs: usize,
}

pub trait RoutingFunction: Debug {
    /// Candidate outputs for `flit` arriving on `in_port`. The function may
    /// record per-packet decisions in the flit (`phase`, `intermediate`).
    fn route(
        &self,
        router: &RouterView,
        flit: &mut Flit,
        in_port: usize,
        inject: bool,
        rng: &mut dyn RngCore,
    ) -> OutputSet;
}

/// Static knowledge handed to routing function factories.
#[derive(Clone, Debug)]
pub struct RoutingParameters {
    pub dims: Vec<usize>,
    pub num_vcs: usize,
}

pub type RoutingFactory = fn(&RoutingParameters) -> Result<Box<dyn RoutingFunction>, Error>;

/// Name to factory table of routing functions.
#[derive(Debug)]
pub struct RoutingRegistry {
    factories: HashMap<String, RoutingFactory>,
}

impl Default for RoutingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRegistry {
    /// A registry with the built-in grid routing functions.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("dim_order_mesh", DimOrderMesh::factory);
        registry.register("xy_yx_mesh", XyYxMesh::factory);
        registry.register("dim_order_torus", DimOrderTorus::factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: RoutingFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            debug!("routing function {} replaced", name);
        }
    }

    pub fn build(
        &self,
        name: &str,
        params: &RoutingParameters,
    ) -> Result<Box<dyn RoutingFunction>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownRoutingFunction(name.to_string()))?;
        factory(params)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Output port of the first dimension, in `order`, where `cur` and `dest`
/// differ; the terminal port if they are the same router.
fn mesh_next_port(cur: &[usize], dest: &[usize], order: impl Iterator<Item = usize>) -> usize {
    for d in order {
        if cur[d] != dest[d] {
            return grid_port(d, dest[d] > cur[d]);
        }
    }
    terminal_port(cur)
}

/// Dimension-order routing on a mesh: correct the lowest dimension first.
#[derive(Debug)]
pub struct DimOrderMesh {
    dims: Vec<usize>,
    num_vcs: usize,
}

impl DimOrderMesh {
    fn factory(params: &RoutingParameters) -> Result<Box<dyn RoutingFunction>, Error> {
        Ok(Box::new(Self {
            dims: params.dims.clone(),
            num_vcs: params.num_vcs,
        }))
    }
}

impl RoutingFunction for DimOrderMesh {
    fn route(
        &self,
        router: &RouterView,
        flit: &mut Flit,
        in_port: usize,
        inject: bool,
        _rng: &mut dyn RngCore,
    ) -> OutputSet {
        let mut outputs = OutputSet::new();
        if inject {
            outputs.add_range(in_port, 0, self.num_vcs - 1, 0);
            return outputs;
        }
        let cur = delinearize_index(router.id, &self.dims);
        let dest = delinearize_index(flit.dest, &self.dims);
        let port = mesh_next_port(&cur, &dest, 0..self.dims.len());
        outputs.add_range(port, 0, self.num_vcs - 1, 0);
        outputs
    }
}

/// Randomized XY/YX routing on a mesh. Each packet picks, at its source,
/// either ascending or descending dimension order and keeps it to the
/// destination. The two orders use disjoint halves of the VCs, so the
/// combination stays deadlock free.
#[derive(Debug)]
pub struct XyYxMesh {
    dims: Vec<usize>,
    num_vcs: usize,
}

const PHASE_ASCENDING: u8 = 1;
const PHASE_DESCENDING: u8 = 2;

impl XyYxMesh {
    fn factory(params: &RoutingParameters) -> Result<Box<dyn RoutingFunction>, Error> {
        if params.num_vcs < 2 {
            return Err(Error::InvalidConfiguration(
                "xy_yx_mesh needs at least 2 VCs".to_string(),
            ));
        }
        Ok(Box::new(Self {
            dims: params.dims.clone(),
            num_vcs: params.num_vcs,
        }))
    }

    fn vc_range(&self, phase: u8) -> (usize, usize) {
        let half = self.num_vcs / 2;
        if phase == PHASE_DESCENDING {
            (half, self.num_vcs - 1)
        } else {
            (0, half - 1)
        }
    }
}

impl RoutingFunction for XyYxMesh {
    fn route(
        &self,
        router: &RouterView,
        flit: &mut Flit,
        in_port: usize,
        inject: bool,
        rng: &mut dyn RngCore,
    ) -> OutputSet {
        if flit.phase == 0 {
            flit.phase = if rng.gen_bool(0.5) {
                PHASE_ASCENDING
            } else {
                PHASE_DESCENDING
            };
        }
        let (vc_start, vc_end) = self.vc_range(flit.phase);
        let mut outputs = OutputSet::new();
        if inject {
            outputs.add_range(in_port, vc_start, vc_end, 0);
            return outputs;
        }
        let cur = delinearize_index(router.id, &self.dims);
        let dest = delinearize_index(flit.dest, &self.dims);
        let n = self.dims.len();
        let port = if flit.phase == PHASE_DESCENDING {
            mesh_next_port(&cur, &dest, (0..n).rev())
        } else {
            mesh_next_port(&cur, &dest, 0..n)
        };
        outputs.add_range(port, vc_start, vc_end, 0);
        outputs
    }
}

/// Dimension-order routing on a torus, taking the shorter way around each
/// ring. A packet that still has to cross the wrap-around link of its
/// current ring travels on the lower half of the VCs, every other packet on
/// the upper half.
#[derive(Debug)]
pub struct DimOrderTorus {
    dims: Vec<usize>,
    num_vcs: usize,
}

impl DimOrderTorus {
    fn factory(params: &RoutingParameters) -> Result<Box<dyn RoutingFunction>, Error> {
        if params.num_vcs < 2 {
            return Err(Error::InvalidConfiguration(
                "dim_order_torus needs at least 2 VCs".to_string(),
            ));
        }
        Ok(Box::new(Self {
            dims: params.dims.clone(),
            num_vcs: params.num_vcs,
        }))
    }
}

impl RoutingFunction for DimOrderTorus {
    fn route(
        &self,
        router: &RouterView,
        flit: &mut Flit,
        in_port: usize,
        inject: bool,
        _rng: &mut dyn RngCore,
    ) -> OutputSet {
        let half = self.num_vcs / 2;
        let mut outputs = OutputSet::new();
        if inject {
            outputs.add_range(in_port, 0, self.num_vcs - 1, 0);
            return outputs;
        }
        let cur = delinearize_index(router.id, &self.dims);
        let dest = delinearize_index(flit.dest, &self.dims);
        for (d, &k) in self.dims.iter().enumerate() {
            if cur[d] == dest[d] {
                continue;
            }
            let forward = (dest[d] + k - cur[d]) % k;
            let positive = forward <= k / 2;
            let crosses_wrap = if positive {
                dest[d] < cur[d]
            } else {
                dest[d] > cur[d]
            };
            let (vc_start, vc_end) = if crosses_wrap {
                (0, half - 1)
            } else {
                (half, self.num_vcs - 1)
            };
            outputs.add_range(grid_port(d, positive), vc_start, vc_end, 0);
            return outputs;
        }
        outputs.add_range(terminal_port(&self.dims), 0, self.num_vcs - 1, 0);
        outputs
    }
}
