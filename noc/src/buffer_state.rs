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

//! Sender-side mirror of a downstream input buffer.
//!
//! The router driving an output port keeps one [`BufferState`] for the
//! input buffer at the other end of the link. Occupancy goes up when a flit
//! is sent and down when a credit comes back, so a correct sender can never
//! overflow the receiver. How the buffer space is split between VCs is a
//! [`BufferPolicy`].

use log::{error, trace};
use std::fmt::Debug;

use crate::config::{BufferPolicyType, RouterConfiguration};
use crate::flit::{Credit, Flit};
use crate::Error;

/// Strategy deciding how much of the downstream buffer each VC may use.
///
/// All hooks are called *before* the per-VC occupancy is updated by the
/// owning [`BufferState`], so `occupancy` is the value prior to the change.
pub trait BufferPolicy: Debug {
    /// `vc` has been taken by an upstream packet.
    fn alloc_vc(&mut self, vc: usize);
    /// `vc` has been released.
    fn free_vc(&mut self, vc: usize);
    /// One slot is about to be consumed on `vc`.
    fn alloc_slot_for(&mut self, vc: usize, occupancy: &[usize]) -> Result<(), Error>;
    /// One slot is about to be returned on `vc`.
    fn free_slot_for(&mut self, vc: usize, occupancy: &[usize]);
    fn is_full_for(&self, vc: usize, occupancy: &[usize]) -> bool;
    /// The maximum number of slots `vc` can currently hold.
    fn limit_for(&self, vc: usize) -> usize;
    /// Total buffer capacity across all VCs.
    fn capacity(&self) -> usize;
}

/// Every VC owns `vc_buf_size` slots; nothing is shared.
#[derive(Clone, Debug)]
pub struct PrivateBufferPolicy {
    vc_buf_size: usize,
    num_vcs: usize,
}

impl PrivateBufferPolicy {
    pub fn new(num_vcs: usize, vc_buf_size: usize) -> Self {
        Self {
            vc_buf_size,
            num_vcs,
        }
    }
}

impl BufferPolicy for PrivateBufferPolicy {
    fn alloc_vc(&mut self, _vc: usize) {}
    fn free_vc(&mut self, _vc: usize) {}

    fn alloc_slot_for(&mut self, vc: usize, occupancy: &[usize]) -> Result<(), Error> {
        if occupancy[vc] >= self.vc_buf_size {
            return Err(Error::BufferOverflow {
                vc,
                occupancy: occupancy[vc] + 1,
                capacity: self.vc_buf_size,
            });
        }
        Ok(())
    }

    fn free_slot_for(&mut self, _vc: usize, _occupancy: &[usize]) {}

    fn is_full_for(&self, vc: usize, occupancy: &[usize]) -> bool {
        occupancy[vc] >= self.vc_buf_size
    }

    fn limit_for(&self, _vc: usize) -> usize {
        self.vc_buf_size
    }

    fn capacity(&self) -> usize {
        self.vc_buf_size * self.num_vcs
    }
}

/// Each VC owns `private_buf_size` slots; the rest of the buffer is a pool
/// any VC may draw from once its private slots are used up.
#[derive(Clone, Debug)]
pub struct SharedBufferPolicy {
    private_buf_size: usize,
    shared_buf_size: usize,
    shared_occupancy: usize,
    buf_size: usize,
}

impl SharedBufferPolicy {
    pub fn new(num_vcs: usize, buf_size: usize, private_buf_size: usize) -> Self {
        assert!(num_vcs * private_buf_size <= buf_size);
        Self {
            private_buf_size,
            shared_buf_size: buf_size - num_vcs * private_buf_size,
            shared_occupancy: 0,
            buf_size,
        }
    }

    pub fn shared_occupancy(&self) -> usize {
        self.shared_occupancy
    }
}

impl BufferPolicy for SharedBufferPolicy {
    fn alloc_vc(&mut self, _vc: usize) {}
    fn free_vc(&mut self, _vc: usize) {}

    fn alloc_slot_for(&mut self, vc: usize, occupancy: &[usize]) -> Result<(), Error> {
        if occupancy[vc] >= self.private_buf_size {
            if self.shared_occupancy >= self.shared_buf_size {
                return Err(Error::BufferOverflow {
                    vc,
                    occupancy: occupancy[vc] + 1,
                    capacity: self.limit_for(vc),
                });
            }
            self.shared_occupancy += 1;
        }
        Ok(())
    }

    fn free_slot_for(&mut self, vc: usize, occupancy: &[usize]) {
        if occupancy[vc] > self.private_buf_size {
            self.shared_occupancy -= 1;
        }
    }

    fn is_full_for(&self, vc: usize, occupancy: &[usize]) -> bool {
        occupancy[vc] >= self.private_buf_size && self.shared_occupancy >= self.shared_buf_size
    }

    fn limit_for(&self, _vc: usize) -> usize {
        self.private_buf_size + self.shared_buf_size
    }

    fn capacity(&self) -> usize {
        self.buf_size
    }
}

/// A shared buffer in which no single VC may hold more than `max_held_slots`.
///
/// With `dynamic` set, the cap is recomputed as the whole buffer divided by
/// the number of VCs currently in use, so a lone packet may use the entire
/// buffer while many concurrent packets get an even share.
#[derive(Clone, Debug)]
pub struct LimitedSharedBufferPolicy {
    shared: SharedBufferPolicy,
    max_held_slots: usize,
    active_vcs: usize,
    dynamic: bool,
}

impl LimitedSharedBufferPolicy {
    pub fn new(
        num_vcs: usize,
        buf_size: usize,
        private_buf_size: usize,
        max_held_slots: usize,
    ) -> Self {
        Self {
            shared: SharedBufferPolicy::new(num_vcs, buf_size, private_buf_size),
            max_held_slots,
            active_vcs: 0,
            dynamic: false,
        }
    }

    pub fn dynamic(num_vcs: usize, buf_size: usize, private_buf_size: usize) -> Self {
        Self {
            shared: SharedBufferPolicy::new(num_vcs, buf_size, private_buf_size),
            max_held_slots: buf_size,
            active_vcs: 0,
            dynamic: true,
        }
    }

    fn update_limit(&mut self) {
        if self.dynamic {
            self.max_held_slots = self.shared.buf_size / self.active_vcs.max(1);
        }
    }
}

impl BufferPolicy for LimitedSharedBufferPolicy {
    fn alloc_vc(&mut self, _vc: usize) {
        self.active_vcs += 1;
        self.update_limit();
    }

    fn free_vc(&mut self, _vc: usize) {
        assert!(self.active_vcs > 0);
        self.active_vcs -= 1;
        self.update_limit();
    }

    fn alloc_slot_for(&mut self, vc: usize, occupancy: &[usize]) -> Result<(), Error> {
        if occupancy[vc] >= self.max_held_slots {
            return Err(Error::BufferOverflow {
                vc,
                occupancy: occupancy[vc] + 1,
                capacity: self.max_held_slots,
            });
        }
        self.shared.alloc_slot_for(vc, occupancy)
    }

    fn free_slot_for(&mut self, vc: usize, occupancy: &[usize]) {
        self.shared.free_slot_for(vc, occupancy)
    }

    fn is_full_for(&self, vc: usize, occupancy: &[usize]) -> bool {
        occupancy[vc] >= self.max_held_slots || self.shared.is_full_for(vc, occupancy)
    }

    fn limit_for(&self, vc: usize) -> usize {
        self.max_held_slots.min(self.shared.limit_for(vc))
    }

    fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

/// Build the policy selected by `config`.
pub fn new_policy(config: &RouterConfiguration) -> Box<dyn BufferPolicy> {
    let num_vcs = config.num_vcs;
    let buf_size = config.total_buf_size();
    match config.buffer_policy {
        BufferPolicyType::Private => {
            Box::new(PrivateBufferPolicy::new(num_vcs, config.vc_buf_size))
        }
        BufferPolicyType::Shared => Box::new(SharedBufferPolicy::new(
            num_vcs,
            buf_size,
            config.private_buf_size,
        )),
        BufferPolicyType::Limited => Box::new(LimitedSharedBufferPolicy::new(
            num_vcs,
            buf_size,
            config.private_buf_size,
            config.vc_buf_size,
        )),
        BufferPolicyType::Dynamic => Box::new(LimitedSharedBufferPolicy::dynamic(
            num_vcs,
            buf_size,
            config.private_buf_size,
        )),
    }
}

/// Upstream view of the input buffer of one downstream port.
#[derive(Debug)]
pub struct BufferState {
    occupancy: Vec<usize>,
    /// Tag (input VC index of the owning router) of the packet holding the VC.
    in_use_by: Vec<Option<usize>>,
    tail_sent: Vec<bool>,
    /// Flits sent and slots credited per VC, kept for conservation checks.
    sent: Vec<u64>,
    credited: Vec<u64>,
    wait_for_tail_credit: bool,
    vc_busy_when_full: bool,
    policy: Box<dyn BufferPolicy>,
}

impl BufferState {
    pub fn new(
        num_vcs: usize,
        policy: Box<dyn BufferPolicy>,
        wait_for_tail_credit: bool,
        vc_busy_when_full: bool,
    ) -> Self {
        Self {
            occupancy: vec![0; num_vcs],
            in_use_by: vec![None; num_vcs],
            tail_sent: vec![false; num_vcs],
            sent: vec![0; num_vcs],
            credited: vec![0; num_vcs],
            wait_for_tail_credit,
            vc_busy_when_full,
            policy,
        }
    }

    pub fn from_config(config: &RouterConfiguration) -> Self {
        Self::new(
            config.num_vcs,
            new_policy(config),
            config.wait_for_tail_credit,
            config.vc_busy_when_full,
        )
    }

    pub fn num_vcs(&self) -> usize {
        self.occupancy.len()
    }

    /// Reserve `vc` for the packet identified by `tag`.
    pub fn take_buffer(&mut self, vc: usize, tag: usize) -> Result<(), Error> {
        if let Some(owner) = self.in_use_by[vc] {
            error!(
                "Buffer for VC {} taken by {} while in use by {}",
                vc, tag, owner
            );
            return Err(Error::BufferAlreadyTaken { vc });
        }
        self.in_use_by[vc] = Some(tag);
        self.tail_sent[vc] = false;
        self.policy.alloc_vc(vc);
        Ok(())
    }

    /// Account for `flit` leaving towards the downstream buffer.
    pub fn sending_flit(&mut self, flit: &Flit) -> Result<(), Error> {
        let vc = match flit.vc {
            Some(vc) => vc,
            None => {
                error!("Flit {} sent without a VC", flit.id);
                return Err(Error::FlitWithoutVc { flit: flit.id });
            }
        };
        if let Err(e) = self.policy.alloc_slot_for(vc, &self.occupancy) {
            error!("Flit {} sent to full buffer: {}", flit.id, e);
            return Err(e);
        }
        self.occupancy[vc] += 1;
        self.sent[vc] += 1;
        trace!("sending flit {} on VC {}, occupancy {}", flit.id, vc, self.occupancy[vc]);
        if flit.tail {
            self.tail_sent[vc] = true;
            if !self.wait_for_tail_credit {
                self.release(vc);
            }
        }
        Ok(())
    }

    /// Return one slot for every VC named in `credit`.
    pub fn process_credit(&mut self, credit: &Credit) -> Result<(), Error> {
        for vc in credit.vcs() {
            if vc >= self.num_vcs() || self.occupancy[vc] == 0 {
                error!("Buffer occupancy fell below zero for VC {}", vc);
                return Err(Error::BufferUnderflow { vc });
            }
            if self.wait_for_tail_credit && self.in_use_by[vc].is_none() {
                error!("Received credit for idle buffer VC {}", vc);
                return Err(Error::CreditForIdleBuffer { vc });
            }
            self.policy.free_slot_for(vc, &self.occupancy);
            self.occupancy[vc] -= 1;
            self.credited[vc] += 1;
            if self.wait_for_tail_credit && self.occupancy[vc] == 0 && self.tail_sent[vc] {
                self.release(vc);
            }
        }
        Ok(())
    }

    fn release(&mut self, vc: usize) {
        assert!(self.in_use_by[vc].is_some(), "VC {} released twice", vc);
        self.in_use_by[vc] = None;
        self.policy.free_vc(vc);
    }

    pub fn is_available_for(&self, vc: usize) -> bool {
        self.in_use_by[vc].is_none() && !(self.vc_busy_when_full && self.is_full_for(vc))
    }

    pub fn is_full_for(&self, vc: usize) -> bool {
        self.policy.is_full_for(vc, &self.occupancy)
    }

    /// Number of slots `vc` could still be sent right now.
    pub fn available_for(&self, vc: usize) -> usize {
        if self.is_full_for(vc) {
            0
        } else {
            self.policy.limit_for(vc).saturating_sub(self.occupancy[vc])
        }
    }

    pub fn occupancy(&self, vc: usize) -> usize {
        self.occupancy[vc]
    }

    pub fn total_occupancy(&self) -> usize {
        self.occupancy.iter().sum()
    }

    pub fn capacity(&self) -> usize {
        self.policy.capacity()
    }

    pub fn in_use_by(&self, vc: usize) -> Option<usize> {
        self.in_use_by[vc]
    }

    pub fn tail_sent(&self, vc: usize) -> bool {
        self.tail_sent[vc]
    }

    /// Sent-minus-credited equals occupancy and occupancy is within the
    /// policy limit, for every VC.
    pub fn is_conserved(&self) -> bool {
        (0..self.num_vcs()).all(|vc| {
            self.sent[vc] - self.credited[vc] == self.occupancy[vc] as u64
                && self.occupancy[vc] <= self.policy.capacity()
        })
    }
}
