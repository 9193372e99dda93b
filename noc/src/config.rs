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

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use crate::{Cycle, Error};

/// Implements `FromStr` over the snake_case names of a configuration enum,
/// reporting unknown names with the given error variant.
macro_rules! named_enum {
    ($ty:ident, $err:path, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;
            fn from_str(s: &str) -> Result<Self, Error> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    _ => Err($err(s.to_string())),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $name),)+
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicyType {
    Private,
    Shared,
    Limited,
    Dynamic,
}

named_enum!(BufferPolicyType, Error::UnknownBufferPolicy, {
    "private" => Private,
    "shared" => Shared,
    "limited" => Limited,
    "dynamic" => Dynamic,
});

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorType {
    SeparableInputFirst,
    SeparableOutputFirst,
    Islip,
    Wavefront,
}

named_enum!(AllocatorType, Error::UnknownAllocator, {
    "separable_input_first" => SeparableInputFirst,
    "separable_output_first" => SeparableOutputFirst,
    "islip" => Islip,
    "wavefront" => Wavefront,
});

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterType {
    RoundRobin,
    Matrix,
}

named_enum!(ArbiterType, Error::UnknownArbiter, {
    "round_robin" => RoundRobin,
    "matrix" => Matrix,
});

/// Which non-speculative activity cancels a speculative switch grant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecFilter {
    /// Drop the speculative grant if any non-speculative request uses the
    /// same input or output.
    MaskByRequests,
    /// Drop the speculative grant only if a non-speculative grant uses the
    /// same input or output.
    MaskByGrants,
}

named_enum!(SpecFilter, Error::InvalidConfiguration, {
    "mask_by_requests" => MaskByRequests,
    "mask_by_grants" => MaskByGrants,
});

/// How a VC computes its allocator input priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VcPriority {
    None,
    /// Older head flits (earlier arrival at this router) win.
    LocalAge,
    /// Longer queues win.
    QueueLength,
    /// Flits that travelled further win.
    HopCount,
    /// Use the priority carried by the flit.
    Flit,
}

named_enum!(VcPriority, Error::InvalidConfiguration, {
    "none" => None,
    "local_age" => LocalAge,
    "queue_length" => QueueLength,
    "hop_count" => HopCount,
    "flit" => Flit,
});

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyType {
    Mesh,
    Torus,
}

named_enum!(TopologyType, Error::InvalidConfiguration, {
    "mesh" => Mesh,
    "torus" => Torus,
});

/// Parameters of one input-queued VC router.
///
/// Read once when the router is built.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfiguration {
    pub num_vcs: usize,
    /// Slots per VC for the private policy, per-VC cap for the limited one.
    pub vc_buf_size: usize,
    /// Total input buffer size; 0 means `num_vcs * vc_buf_size`.
    pub buf_size: usize,
    pub buffer_policy: BufferPolicyType,
    /// Slots reserved per VC under the shared policies.
    pub private_buf_size: usize,
    pub vc_allocator: AllocatorType,
    pub sw_allocator: AllocatorType,
    pub arbiter: ArbiterType,
    pub alloc_iters: usize,
    pub speculative: bool,
    pub spec_filter: SpecFilter,
    pub input_speedup: usize,
    pub output_speedup: usize,
    /// Flits an output port may hold waiting for its channel.
    pub output_buffer_size: usize,
    pub routing_delay: Cycle,
    pub vc_alloc_delay: Cycle,
    pub sw_alloc_delay: Cycle,
    pub crossbar_delay: Cycle,
    pub wait_for_tail_credit: bool,
    pub vc_busy_when_full: bool,
    pub vc_priority: VcPriority,
}

impl Default for RouterConfiguration {
    fn default() -> Self {
        Self {
            num_vcs: 2,
            vc_buf_size: 4,
            buf_size: 0,
            buffer_policy: BufferPolicyType::Private,
            private_buf_size: 1,
            vc_allocator: AllocatorType::SeparableInputFirst,
            sw_allocator: AllocatorType::SeparableInputFirst,
            arbiter: ArbiterType::RoundRobin,
            alloc_iters: 1,
            speculative: false,
            spec_filter: SpecFilter::MaskByGrants,
            input_speedup: 1,
            output_speedup: 1,
            output_buffer_size: 4,
            routing_delay: 0,
            vc_alloc_delay: 1,
            sw_alloc_delay: 1,
            crossbar_delay: 1,
            wait_for_tail_credit: false,
            vc_busy_when_full: false,
            vc_priority: VcPriority::None,
        }
    }
}

impl RouterConfiguration {
    pub fn total_buf_size(&self) -> usize {
        if self.buf_size == 0 {
            self.num_vcs * self.vc_buf_size
        } else {
            self.buf_size
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(msg: &str) -> Result<(), Error> {
            log::error!("{}", msg);
            Err(Error::InvalidConfiguration(msg.to_string()))
        }
        if self.num_vcs == 0 {
            return invalid("num_vcs must be positive");
        }
        if self.total_buf_size() == 0 {
            return invalid("buffer size must be positive");
        }
        if self.alloc_iters == 0 {
            return invalid("alloc_iters must be positive");
        }
        if self.input_speedup == 0 || self.output_speedup == 0 {
            return invalid("speedups must be positive");
        }
        if self.output_buffer_size == 0 {
            return invalid("output_buffer_size must be positive");
        }
        if self.crossbar_delay == 0 {
            return invalid("crossbar_delay must be positive");
        }
        match self.buffer_policy {
            BufferPolicyType::Private => {
                if self.vc_buf_size == 0 {
                    return invalid("vc_buf_size must be positive");
                }
                if self.buf_size != 0 && self.buf_size != self.num_vcs * self.vc_buf_size {
                    return invalid("private buffers require buf_size == num_vcs * vc_buf_size");
                }
            }
            BufferPolicyType::Shared | BufferPolicyType::Limited | BufferPolicyType::Dynamic => {
                if self.num_vcs * self.private_buf_size > self.total_buf_size() {
                    return invalid("private slots exceed the shared buffer size");
                }
                if self.buffer_policy == BufferPolicyType::Limited && self.vc_buf_size == 0 {
                    return invalid("vc_buf_size must be positive");
                }
            }
        }
        Ok(())
    }
}

/// Parameters of a whole network: topology, routing and the router template.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub topology: TopologyType,
    /// Radix per dimension.
    pub dims: Vec<usize>,
    pub routing_function: String,
    pub channel_latency: Cycle,
    pub credit_latency: Cycle,
    /// Cycles without any flit movement, while flits are in flight, after
    /// which a possible deadlock is reported.
    pub deadlock_warn_timeout: Cycle,
    pub seed: u64,
    pub router: RouterConfiguration,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            topology: TopologyType::Mesh,
            dims: vec![4, 4],
            routing_function: "dim_order_mesh".to_string(),
            channel_latency: 1,
            credit_latency: 1,
            deadlock_warn_timeout: 256,
            seed: 0x87654321FEDCBA09u64,
            router: RouterConfiguration::default(),
        }
    }
}

impl NetworkConfiguration {
    pub fn from_file(file_name: &str) -> Result<Self, Error> {
        let file = File::open(Path::new(file_name)).map_err(|e| {
            Error::InvalidConfiguration(format!("File {} not found. {:?}", file_name, e))
        })?;
        let reader = BufReader::new(file);
        let config: Self = serde_yaml::from_reader(reader)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(config: &str) -> Result<Self, Error> {
        let config: Self =
            serde_yaml::from_str(config).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.dims.is_empty() || self.dims.iter().any(|&k| k == 0) {
            return Err(Error::InvalidConfiguration(format!(
                "invalid dimensions {:?}",
                self.dims
            )));
        }
        if self.channel_latency == 0 || self.credit_latency == 0 {
            return Err(Error::InvalidConfiguration(
                "channel latencies must be positive".to_string(),
            ));
        }
        self.router.validate()
    }

    pub fn num_nodes(&self) -> usize {
        self.dims.iter().product()
    }
}
