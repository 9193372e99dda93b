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

//! The two tokens that travel on channels: flits (forward) and credits
//! (backward), plus the arena that owns every in-flight flit.

use bitvec::prelude::*;
use std::fmt;

use crate::{Cycle, Error};

/// Stable handle to a flit stored in a [`FlitArena`].
///
/// VC queues, channels and pipeline stages only ever hold handles; the flit
/// data itself lives in exactly one arena slot from creation to retirement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlitHandle(usize);

impl FlitHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for FlitHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Flow control digit.
#[derive(Clone, Debug, Default)]
pub struct Flit {
    /// Monotonic identity, assigned by the arena.
    pub id: u64,
    /// Packet this flit belongs to.
    pub pid: u64,
    pub head: bool,
    pub tail: bool,
    /// Traffic class.
    pub class: usize,
    /// VC on the link the flit is currently traversing; `None` until the
    /// first VC allocation.
    pub vc: Option<usize>,
    /// Source terminal.
    pub src: usize,
    /// Destination terminal.
    pub dest: usize,
    /// Priority set by the traffic generator. Its meaning (class, age,
    /// sequence number) is up to the generator.
    pub priority: i64,
    pub hops: usize,
    /// Trace this flit through the pipeline at info level.
    pub watch: bool,
    /// Cycle the packet was created.
    pub ctime: Cycle,
    /// Cycle the flit entered the network.
    pub itime: Option<Cycle>,
    /// Scratch fields owned by routing functions, e.g., an intermediate
    /// destination or a dimension-order phase.
    pub intermediate: Option<usize>,
    pub phase: u8,
}

impl Flit {
    pub fn new(pid: u64, src: usize, dest: usize, head: bool, tail: bool) -> Self {
        Self {
            pid,
            src,
            dest,
            head,
            tail,
            ..Default::default()
        }
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "flit {} (pid {}{}{}) {} -> {} vc {:?} pri {} hops {}",
            self.id,
            self.pid,
            if self.head { " head" } else { "" },
            if self.tail { " tail" } else { "" },
            self.src,
            self.dest,
            self.vc,
            self.priority,
            self.hops
        )
    }
}

/// Backward acknowledgment: the set of VCs for which one buffer slot each has
/// been freed downstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credit {
    vcs: BitVec,
}

impl Credit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_vc(vc: usize) -> Self {
        let mut credit = Self::new();
        credit.add_vc(vc);
        credit
    }

    /// Adds `vc` to the released set. Merging the same VC twice is a
    /// programming error: a single credit can only release one slot per VC.
    pub fn add_vc(&mut self, vc: usize) {
        if self.vcs.len() <= vc {
            self.vcs.resize(vc + 1, false);
        }
        assert!(!self.vcs[vc], "VC {} already in credit", vc);
        self.vcs.set(vc, true);
    }

    pub fn contains(&self, vc: usize) -> bool {
        self.vcs.get(vc).map(|b| *b).unwrap_or(false)
    }

    pub fn vcs(&self) -> impl Iterator<Item = usize> + '_ {
        self.vcs.iter_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.vcs.not_any()
    }
}

/// Owning table of every flit alive in the simulation.
///
/// Freed slots are reused, so handles are only meaningful while the flit is
/// alive.
#[derive(Debug, Default)]
pub struct FlitArena {
    slots: Vec<Option<Flit>>,
    free: Vec<usize>,
    next_id: u64,
    live: usize,
}

impl FlitArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `flit`, assigning it the next identity.
    pub fn insert(&mut self, mut flit: Flit) -> FlitHandle {
        flit.id = self.next_id;
        self.next_id += 1;
        self.live += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(flit);
                FlitHandle(idx)
            }
            None => {
                self.slots.push(Some(flit));
                FlitHandle(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: FlitHandle) -> Result<&Flit, Error> {
        self.slots
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::UnknownFlit(handle))
    }

    pub fn get_mut(&mut self, handle: FlitHandle) -> Result<&mut Flit, Error> {
        self.slots
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::UnknownFlit(handle))
    }

    /// Retires a flit, returning its data.
    pub fn remove(&mut self, handle: FlitHandle) -> Result<Flit, Error> {
        let flit = self
            .slots
            .get_mut(handle.0)
            .and_then(|slot| slot.take())
            .ok_or(Error::UnknownFlit(handle))?;
        self.free.push(handle.0);
        self.live -= 1;
        Ok(flit)
    }

    /// Number of flits currently alive.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of flits ever created.
    pub fn created(&self) -> u64 {
        self.next_id
    }
}
