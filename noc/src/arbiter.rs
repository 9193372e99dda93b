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

//! Single-resource arbiters.
//!
//! An arbiter picks one winner among the requestors of a single resource.
//! The highest priority always wins; the fairness state of the arbiter only
//! breaks ties among equal priorities. The state is advanced explicitly with
//! `update_state`, so that a caller (e.g., iSLIP) can decide whether a
//! grant counts.

use std::fmt::Debug;

use crate::config::ArbiterType;

/// A request for the arbitrated resource: who asks, a caller tag, priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArbiterRequest {
    pub input: usize,
    pub tag: usize,
    pub priority: i64,
}

pub trait Arbiter: Debug {
    fn add_request(&mut self, input: usize, tag: usize, priority: i64);
    /// Select a winner among the current requests. Does not change the
    /// fairness state.
    fn arbitrate(&mut self) -> Option<ArbiterRequest>;
    /// Commit the last selected winner to the fairness state.
    fn update_state(&mut self);
    fn clear(&mut self);
    fn size(&self) -> usize;
}

pub fn new_arbiter(arbiter_type: ArbiterType, size: usize) -> Box<dyn Arbiter> {
    match arbiter_type {
        ArbiterType::RoundRobin => Box::new(RoundRobinArbiter::new(size)),
        ArbiterType::Matrix => Box::new(MatrixArbiter::new(size)),
    }
}

/// Higher priority wins; among equal priorities the first requestor at or
/// after the pointer wins. Committing a winner moves the pointer past it.
#[derive(Clone, Debug)]
pub struct RoundRobinArbiter {
    requests: Vec<Option<(usize, i64)>>,
    pointer: usize,
    selected: Option<usize>,
}

impl RoundRobinArbiter {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            requests: vec![None; size],
            pointer: 0,
            selected: None,
        }
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }
}

impl Arbiter for RoundRobinArbiter {
    fn add_request(&mut self, input: usize, tag: usize, priority: i64) {
        // a second request from the same input replaces the first only with
        // a strictly higher priority
        match self.requests[input] {
            Some((_, pri)) if pri >= priority => {}
            _ => self.requests[input] = Some((tag, priority)),
        }
    }

    fn arbitrate(&mut self) -> Option<ArbiterRequest> {
        let size = self.requests.len();
        let mut best: Option<ArbiterRequest> = None;
        for offset in 0..size {
            let input = (self.pointer + offset) % size;
            if let Some((tag, priority)) = self.requests[input] {
                if best.map_or(true, |b| priority > b.priority) {
                    best = Some(ArbiterRequest {
                        input,
                        tag,
                        priority,
                    });
                }
            }
        }
        self.selected = best.map(|b| b.input);
        best
    }

    fn update_state(&mut self) {
        if let Some(input) = self.selected {
            self.pointer = (input + 1) % self.requests.len();
        }
    }

    fn clear(&mut self) {
        self.requests.iter_mut().for_each(|r| *r = None);
        self.selected = None;
    }

    fn size(&self) -> usize {
        self.requests.len()
    }
}

/// Least-recently-served arbitration: `beats[i][j]` means `i` wins over `j`
/// at equal priority. A committed winner drops below everybody else.
#[derive(Clone, Debug)]
pub struct MatrixArbiter {
    requests: Vec<Option<(usize, i64)>>,
    beats: Vec<Vec<bool>>,
    selected: Option<usize>,
}

impl MatrixArbiter {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            requests: vec![None; size],
            beats: (0..size)
                .map(|i| (0..size).map(|j| i < j).collect())
                .collect(),
            selected: None,
        }
    }
}

impl Arbiter for MatrixArbiter {
    fn add_request(&mut self, input: usize, tag: usize, priority: i64) {
        match self.requests[input] {
            Some((_, pri)) if pri >= priority => {}
            _ => self.requests[input] = Some((tag, priority)),
        }
    }

    fn arbitrate(&mut self) -> Option<ArbiterRequest> {
        let max_priority = self.requests.iter().flatten().map(|(_, p)| *p).max()?;
        let contenders: Vec<usize> = (0..self.requests.len())
            .filter(|&i| matches!(self.requests[i], Some((_, p)) if p == max_priority))
            .collect();
        let winner = *contenders
            .iter()
            .find(|&&i| contenders.iter().all(|&j| i == j || self.beats[i][j]))
            .expect("matrix arbiter state is not a total order");
        self.selected = Some(winner);
        let (tag, priority) = self.requests[winner]?;
        Some(ArbiterRequest {
            input: winner,
            tag,
            priority,
        })
    }

    fn update_state(&mut self) {
        if let Some(winner) = self.selected {
            for j in 0..self.requests.len() {
                if j != winner {
                    self.beats[winner][j] = false;
                    self.beats[j][winner] = true;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.requests.iter_mut().for_each(|r| *r = None);
        self.selected = None;
    }

    fn size(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(arbiter: &mut dyn Arbiter, inputs: &[usize], rounds: usize) -> Vec<usize> {
        let mut order = vec![];
        for _ in 0..rounds {
            arbiter.clear();
            for &i in inputs {
                arbiter.add_request(i, i * 10, 0);
            }
            let winner = arbiter.arbitrate().unwrap();
            assert_eq!(winner.tag, winner.input * 10);
            arbiter.update_state();
            order.push(winner.input);
        }
        order
    }

    #[test]
    fn round_robin_rotates() {
        let mut arbiter = RoundRobinArbiter::new(4);
        assert_eq!(serve(&mut arbiter, &[0, 2, 3], 6), vec![0, 2, 3, 0, 2, 3]);
    }

    #[test]
    fn matrix_serves_least_recent() {
        let mut arbiter = MatrixArbiter::new(4);
        assert_eq!(serve(&mut arbiter, &[1, 3], 4), vec![1, 3, 1, 3]);
        // 0 has never been served, so it beats everyone
        assert_eq!(serve(&mut arbiter, &[0, 1, 3], 3), vec![0, 1, 3]);
    }

    #[test]
    fn priority_beats_fairness() {
        for arbiter_type in [ArbiterType::RoundRobin, ArbiterType::Matrix] {
            let mut arbiter = new_arbiter(arbiter_type, 3);
            arbiter.add_request(0, 0, 1);
            arbiter.add_request(2, 2, 5);
            arbiter.add_request(1, 1, 5);
            assert_eq!(arbiter.arbitrate().unwrap().input, 1);
            arbiter.update_state();
            arbiter.clear();
            arbiter.add_request(0, 0, 1);
            arbiter.add_request(2, 2, 5);
            arbiter.add_request(1, 1, 5);
            assert_eq!(arbiter.arbitrate().unwrap().input, 2);
        }
    }

    #[test]
    fn no_request_no_winner() {
        let mut arbiter = RoundRobinArbiter::new(2);
        assert!(arbiter.arbitrate().is_none());
        arbiter.update_state();
        assert_eq!(arbiter.pointer(), 0);
    }
}
