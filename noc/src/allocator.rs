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

//! Bipartite matching between requestors (inputs) and resources (outputs).
//!
//! A router uses one allocator for VC allocation (input VCs against output
//! VCs) and one or two for switch allocation (crossbar inputs against
//! crossbar outputs). Every cycle the router clears the allocator, adds the
//! requests of the cycle, and calls `allocate`. The result is a matching: no
//! input is assigned two outputs and no output two inputs.

use log::trace;
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::arbiter::{new_arbiter, Arbiter};
use crate::config::{AllocatorType, ArbiterType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    pub input: usize,
    pub output: usize,
    /// Opaque caller tag, e.g., the requesting VC.
    pub tag: usize,
    /// Priority used when the input chooses among outputs.
    pub in_priority: i64,
    /// Priority used when the output chooses among inputs.
    pub out_priority: i64,
}

/// The requests of one cycle and the matching computed from them.
#[derive(Clone, Debug)]
pub struct RequestTable {
    in_requests: Vec<BTreeMap<usize, Request>>,
    out_requests: Vec<BTreeMap<usize, Request>>,
    in_match: Vec<Option<usize>>,
    out_match: Vec<Option<usize>>,
    num_requests: usize,
}

impl RequestTable {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            in_requests: vec![BTreeMap::new(); inputs],
            out_requests: vec![BTreeMap::new(); outputs],
            in_match: vec![None; inputs],
            out_match: vec![None; outputs],
            num_requests: 0,
        }
    }

    fn clear(&mut self) {
        self.in_requests.iter_mut().for_each(|r| r.clear());
        self.out_requests.iter_mut().for_each(|r| r.clear());
        self.in_match.iter_mut().for_each(|m| *m = None);
        self.out_match.iter_mut().for_each(|m| *m = None);
        self.num_requests = 0;
    }

    fn add(&mut self, request: Request) {
        assert!(request.input < self.in_requests.len(), "invalid input {}", request.input);
        assert!(request.output < self.out_requests.len(), "invalid output {}", request.output);
        let replace = match self.in_requests[request.input].get(&request.output) {
            None => {
                self.num_requests += 1;
                true
            }
            Some(old) => {
                request.in_priority > old.in_priority
                    || (request.in_priority == old.in_priority
                        && request.out_priority > old.out_priority)
            }
        };
        if replace {
            self.in_requests[request.input].insert(request.output, request);
            self.out_requests[request.output].insert(request.input, request);
        }
    }

    fn grant(&mut self, input: usize, output: usize) {
        debug_assert!(self.in_match[input].is_none() && self.out_match[output].is_none());
        trace!("grant {} -> {}", input, output);
        self.in_match[input] = Some(output);
        self.out_match[output] = Some(input);
    }

    fn single_request(&self) -> Option<Request> {
        if self.num_requests != 1 {
            return None;
        }
        self.in_requests
            .iter()
            .find_map(|r| r.values().next().copied())
    }

    pub fn inputs(&self) -> usize {
        self.in_requests.len()
    }

    pub fn outputs(&self) -> usize {
        self.out_requests.len()
    }
}

pub trait Allocator: Debug {
    fn table(&self) -> &RequestTable;
    fn table_mut(&mut self) -> &mut RequestTable;

    /// Compute the matching for the current requests.
    fn allocate(&mut self);

    /// Drop all requests and grants.
    fn clear(&mut self) {
        self.table_mut().clear();
    }

    /// Register a candidate edge. A second request for the same pair
    /// replaces the first only if it has a higher input priority, or an
    /// equal input priority and a higher output priority.
    fn add_request(
        &mut self,
        input: usize,
        output: usize,
        tag: usize,
        in_priority: i64,
        out_priority: i64,
    ) {
        self.table_mut().add(Request {
            input,
            output,
            tag,
            in_priority,
            out_priority,
        });
    }

    /// Input granted `output`, if any.
    fn input_assigned(&self, output: usize) -> Option<usize> {
        self.table().out_match[output]
    }

    /// Output granted to `input`, if any.
    fn output_assigned(&self, input: usize) -> Option<usize> {
        self.table().in_match[input]
    }

    fn read_request(&self, input: usize, output: usize) -> Option<&Request> {
        self.table().in_requests[input].get(&output)
    }

    fn has_input_requests(&self, input: usize) -> bool {
        !self.table().in_requests[input].is_empty()
    }

    fn has_output_requests(&self, output: usize) -> bool {
        !self.table().out_requests[output].is_empty()
    }

    fn num_requests(&self) -> usize {
        self.table().num_requests
    }

    fn inputs(&self) -> usize {
        self.table().inputs()
    }

    fn outputs(&self) -> usize {
        self.table().outputs()
    }

    /// All granted (input, output) pairs, in input order.
    fn grants(&self) -> Vec<(usize, usize)> {
        self.table()
            .in_match
            .iter()
            .enumerate()
            .filter_map(|(input, output)| output.map(|o| (input, o)))
            .collect()
    }
}

pub fn new_allocator(
    allocator_type: AllocatorType,
    inputs: usize,
    outputs: usize,
    iterations: usize,
    arbiter_type: ArbiterType,
) -> Box<dyn Allocator> {
    match allocator_type {
        AllocatorType::SeparableInputFirst => Box::new(SeparableAllocator::new(
            SeparableKind::InputFirst,
            inputs,
            outputs,
            iterations,
            arbiter_type,
        )),
        AllocatorType::SeparableOutputFirst => Box::new(SeparableAllocator::new(
            SeparableKind::OutputFirst,
            inputs,
            outputs,
            iterations,
            arbiter_type,
        )),
        AllocatorType::Islip => Box::new(SeparableAllocator::new(
            SeparableKind::Islip,
            inputs,
            outputs,
            iterations,
            arbiter_type,
        )),
        AllocatorType::Wavefront => Box::new(WavefrontAllocator::new(inputs, outputs)),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeparableKind {
    /// Each input picks one output, then each output picks one input.
    InputFirst,
    /// Each output picks one input, then each input accepts one output.
    OutputFirst,
    /// Output-first, but arbiters only advance on grants accepted in the
    /// first iteration.
    Islip,
}

/// A bank of input arbiters and a bank of output arbiters, iterated a fixed
/// number of times over the still-unmatched inputs and outputs.
#[derive(Debug)]
pub struct SeparableAllocator {
    table: RequestTable,
    kind: SeparableKind,
    iterations: usize,
    input_arbiters: Vec<Box<dyn Arbiter>>,
    output_arbiters: Vec<Box<dyn Arbiter>>,
}

impl SeparableAllocator {
    pub fn new(
        kind: SeparableKind,
        inputs: usize,
        outputs: usize,
        iterations: usize,
        arbiter_type: ArbiterType,
    ) -> Self {
        assert!(iterations > 0);
        Self {
            table: RequestTable::new(inputs, outputs),
            kind,
            iterations,
            input_arbiters: (0..inputs).map(|_| new_arbiter(arbiter_type, outputs)).collect(),
            output_arbiters: (0..outputs).map(|_| new_arbiter(arbiter_type, inputs)).collect(),
        }
    }

    fn input_stage(&mut self, candidates: impl Fn(usize, usize) -> bool) -> Vec<Option<usize>> {
        let mut choice = vec![None; self.table.inputs()];
        for input in 0..self.table.inputs() {
            if self.table.in_match[input].is_some() {
                continue;
            }
            let arbiter = &mut self.input_arbiters[input];
            arbiter.clear();
            for (&output, req) in &self.table.in_requests[input] {
                if self.table.out_match[output].is_none() && candidates(input, output) {
                    arbiter.add_request(output, req.tag, req.in_priority);
                }
            }
            choice[input] = arbiter.arbitrate().map(|w| w.input);
        }
        choice
    }

    fn output_stage(&mut self, candidates: impl Fn(usize, usize) -> bool) -> Vec<Option<usize>> {
        let mut choice = vec![None; self.table.outputs()];
        for output in 0..self.table.outputs() {
            if self.table.out_match[output].is_some() {
                continue;
            }
            let arbiter = &mut self.output_arbiters[output];
            arbiter.clear();
            for (&input, req) in &self.table.out_requests[output] {
                if self.table.in_match[input].is_none() && candidates(input, output) {
                    arbiter.add_request(input, req.tag, req.out_priority);
                }
            }
            choice[output] = arbiter.arbitrate().map(|w| w.input);
        }
        choice
    }

    fn commit(&mut self, input: usize, output: usize, update: bool) {
        self.table.grant(input, output);
        if update {
            self.input_arbiters[input].update_state();
            self.output_arbiters[output].update_state();
        }
    }

    fn allocate_input_first(&mut self) {
        for _ in 0..self.iterations {
            let input_choice = self.input_stage(|_, _| true);
            let output_choice =
                self.output_stage(|input, output| input_choice[input] == Some(output));
            for (output, input) in output_choice.iter().enumerate() {
                if let Some(input) = *input {
                    self.commit(input, output, true);
                }
            }
        }
    }

    fn allocate_output_first(&mut self) {
        for iteration in 0..self.iterations {
            let output_choice = self.output_stage(|_, _| true);
            let input_choice =
                self.input_stage(|input, output| output_choice[output] == Some(input));
            let update = self.kind == SeparableKind::OutputFirst || iteration == 0;
            for (input, output) in input_choice.iter().enumerate() {
                if let Some(output) = *output {
                    self.commit(input, output, update);
                }
            }
        }
    }
}

impl Allocator for SeparableAllocator {
    fn table(&self) -> &RequestTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut RequestTable {
        &mut self.table
    }

    fn allocate(&mut self) {
        if self.table.num_requests == 0 {
            return;
        }
        if let Some(req) = self.table.single_request() {
            // keep the arbiters' fairness state in step with the grant
            let input_arbiter = &mut self.input_arbiters[req.input];
            input_arbiter.clear();
            input_arbiter.add_request(req.output, req.tag, req.in_priority);
            input_arbiter.arbitrate();
            let output_arbiter = &mut self.output_arbiters[req.output];
            output_arbiter.clear();
            output_arbiter.add_request(req.input, req.tag, req.out_priority);
            output_arbiter.arbitrate();
            self.commit(req.input, req.output, true);
            return;
        }
        match self.kind {
            SeparableKind::InputFirst => self.allocate_input_first(),
            SeparableKind::OutputFirst | SeparableKind::Islip => self.allocate_output_first(),
        }
    }
}

/// Wavefront allocator over the square request matrix of side
/// `max(inputs, outputs)`.
///
/// Cell (i, o) lies on diagonal `(i + o) % square`; the cells of one diagonal
/// never share a row or a column, so a whole diagonal can be granted at
/// once. Allocation makes two sweeps starting from the priority diagonal:
/// the first, forward, grants only requests carrying the highest output
/// priority of the cycle; the second, backward, grants whatever is left. The
/// priority diagonal then moves to the one after the first diagonal that
/// produced a grant.
#[derive(Clone, Debug)]
pub struct WavefrontAllocator {
    table: RequestTable,
    square: usize,
    priority_diagonal: usize,
}

impl WavefrontAllocator {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            table: RequestTable::new(inputs, outputs),
            square: inputs.max(outputs),
            priority_diagonal: 0,
        }
    }

    pub fn priority_diagonal(&self) -> usize {
        self.priority_diagonal
    }

    /// Grant every eligible cell of `diagonal`; true if anything was granted.
    fn sweep_diagonal(&mut self, diagonal: usize, min_priority: Option<i64>) -> bool {
        let mut granted = false;
        for output in 0..self.square {
            let input = (diagonal + self.square - output) % self.square;
            if input >= self.table.inputs() || output >= self.table.outputs() {
                continue;
            }
            if self.table.in_match[input].is_some() || self.table.out_match[output].is_some() {
                continue;
            }
            let eligible = match self.table.in_requests[input].get(&output) {
                Some(req) => min_priority.map_or(true, |p| req.out_priority == p),
                None => false,
            };
            if eligible {
                self.table.grant(input, output);
                granted = true;
            }
        }
        granted
    }
}

impl Allocator for WavefrontAllocator {
    fn table(&self) -> &RequestTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut RequestTable {
        &mut self.table
    }

    fn allocate(&mut self) {
        if self.table.num_requests == 0 {
            return;
        }
        if let Some(req) = self.table.single_request() {
            self.table.grant(req.input, req.output);
            self.priority_diagonal = (req.input + req.output + 1) % self.square;
            return;
        }
        let max_priority = self
            .table
            .in_requests
            .iter()
            .flat_map(|r| r.values())
            .map(|r| r.out_priority)
            .max();

        let mut first_granted = None;
        for p in 0..self.square {
            let diagonal = (self.priority_diagonal + p) % self.square;
            if self.sweep_diagonal(diagonal, max_priority) && first_granted.is_none() {
                first_granted = Some(diagonal);
            }
        }
        for p in 0..self.square {
            let diagonal = (self.priority_diagonal + self.square - p) % self.square;
            if self.sweep_diagonal(diagonal, None) && first_granted.is_none() {
                first_granted = Some(diagonal);
            }
        }
        if let Some(diagonal) = first_granted {
            self.priority_diagonal = (diagonal + 1) % self.square;
        }
    }
}
