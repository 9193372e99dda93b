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

use log::trace;
use std::collections::VecDeque;

use crate::flit::{Credit, FlitHandle};
use crate::{Cycle, Error};

pub type FlitChannel = Channel<FlitHandle>;
pub type CreditChannel = Channel<Credit>;

/// A fixed-latency pipe carrying at most one token per cycle.
///
/// The channel is modeled as a delay line pre-filled with `latency` empty
/// slots: every cycle exactly one slot leaves (`read_inputs`) and one slot
/// enters (`write_outputs`), so a token sent in cycle `t` is received in
/// cycle `t + latency`, and tokens leave in the order they entered.
///
/// Within a cycle the receiver must call `receive` after `read_inputs` and
/// the sender must call `send` before `write_outputs`.
#[derive(Clone, Debug)]
pub struct Channel<T> {
    line: VecDeque<Option<T>>,
    /// Token written by the sender this cycle.
    input: Option<T>,
    /// Token delivered to the receiver this cycle.
    output: Option<T>,
    latency: Cycle,
}

impl<T: std::fmt::Debug> Channel<T> {
    pub fn new(latency: Cycle) -> Self {
        assert!(latency > 0, "channels need at least one cycle of latency");
        Self {
            line: (0..latency).map(|_| None).collect(),
            input: None,
            output: None,
            latency,
        }
    }

    pub fn latency(&self) -> Cycle {
        self.latency
    }

    /// Queue `item` for transmission this cycle.
    pub fn send(&mut self, item: T) -> Result<(), Error> {
        if self.input.is_some() {
            log::error!("channel already carries {:?} this cycle", self.input);
            return Err(Error::ChannelOverrun);
        }
        self.input = Some(item);
        Ok(())
    }

    /// True if nothing has been sent yet this cycle.
    pub fn is_idle(&self) -> bool {
        self.input.is_none()
    }

    /// Take the token delivered this cycle, if any.
    pub fn receive(&mut self) -> Option<T> {
        self.output.take()
    }

    /// Peek at the token delivered this cycle.
    pub fn peek(&self) -> Option<&T> {
        self.output.as_ref()
    }

    /// Deliver the token at the head of the delay line. A token delivered
    /// in the previous cycle and never received would be lost.
    pub fn read_inputs(&mut self) -> Result<(), Error> {
        if self.output.is_some() {
            log::error!("token {:?} was never received", self.output);
            return Err(Error::ChannelOverrun);
        }
        self.output = self.line.pop_front().flatten();
        Ok(())
    }

    /// Latch this cycle's token into the delay line.
    pub fn write_outputs(&mut self) {
        let item = self.input.take();
        if item.is_some() {
            trace!("channel latched {:?}", item);
        }
        self.line.push_back(item);
    }

    /// Number of tokens in transit, including undelivered ones.
    pub fn in_flight(&self) -> usize {
        self.line.iter().filter(|slot| slot.is_some()).count()
            + self.input.is_some() as usize
            + self.output.is_some() as usize
    }
}

/// Flit and credit channel indices of one end of a link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkEnd {
    pub flits: usize,
    pub credits: usize,
}

/// Every channel of a network. Routers and terminals refer to channels by
/// their index in the bank.
#[derive(Debug, Default)]
pub struct ChannelBank {
    pub flits: Vec<FlitChannel>,
    pub credits: Vec<CreditChannel>,
}

impl ChannelBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_flit_channel(&mut self, latency: Cycle) -> usize {
        self.flits.push(Channel::new(latency));
        self.flits.len() - 1
    }

    pub fn add_credit_channel(&mut self, latency: Cycle) -> usize {
        self.credits.push(Channel::new(latency));
        self.credits.len() - 1
    }

    pub fn read_inputs(&mut self) -> Result<(), Error> {
        for channel in self.flits.iter_mut() {
            channel.read_inputs()?;
        }
        for channel in self.credits.iter_mut() {
            channel.read_inputs()?;
        }
        Ok(())
    }

    pub fn write_outputs(&mut self) {
        self.flits.iter_mut().for_each(|c| c.write_outputs());
        self.credits.iter_mut().for_each(|c| c.write_outputs());
    }

    pub fn flits_in_flight(&self) -> usize {
        self.flits.iter().map(|c| c.in_flight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step<T: std::fmt::Debug>(channel: &mut Channel<T>, send: Option<T>) -> Option<T> {
        channel.read_inputs().unwrap();
        let received = channel.receive();
        if let Some(item) = send {
            channel.send(item).unwrap();
        }
        channel.write_outputs();
        received
    }

    #[test]
    fn fixed_delay_in_order() {
        let mut channel = Channel::new(3);
        let mut received = vec![];
        for cycle in 0..10 {
            let send = if cycle < 4 { Some(cycle) } else { None };
            if let Some(item) = step(&mut channel, send) {
                received.push((cycle, item));
            }
        }
        assert_eq!(received, vec![(3, 0), (4, 1), (5, 2), (6, 3)]);
        assert_eq!(channel.in_flight(), 0);
    }

    #[test]
    fn one_token_per_cycle() {
        let mut channel = Channel::new(1);
        channel.read_inputs().unwrap();
        channel.send(1).unwrap();
        assert!(!channel.is_idle());
        assert_eq!(channel.send(2), Err(Error::ChannelOverrun));
        channel.write_outputs();
        assert_eq!(channel.in_flight(), 1);
    }

    #[test]
    fn unreceived_token_is_an_error() {
        let mut channel = Channel::new(1);
        step(&mut channel, Some(7));
        channel.read_inputs().unwrap();
        assert_eq!(channel.peek(), Some(&7));
        channel.write_outputs();
        assert_eq!(channel.read_inputs(), Err(Error::ChannelOverrun));
    }
}
