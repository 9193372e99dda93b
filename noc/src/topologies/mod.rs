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

//! k-ary n-dimensional grid topologies.
//!
//! Every router of a grid has `2n + 1` ports. Port `2d` leads to the
//! neighbor one step up in dimension `d`, port `2d + 1` to the neighbor one
//! step down, and port `2n` to the local terminal. Input ports follow the
//! same numbering: input `p` receives from the neighbor that output `p`
//! sends to. Router `i` and terminal `i` sit at the same grid coordinates.

mod mesh;
mod torus;

pub use mesh::mesh;
pub use torus::torus;

/// Output port towards the neighbor in dimension `dim`.
pub fn grid_port(dim: usize, positive: bool) -> usize {
    2 * dim + if positive { 0 } else { 1 }
}

/// Port connecting a grid router to its terminal.
pub fn terminal_port(dims: &[usize]) -> usize {
    2 * dims.len()
}

pub fn grid_radix(dims: &[usize]) -> usize {
    2 * dims.len() + 1
}

/// return the linear index of the element in a multi-dimensional grid
/// The element is represented as a vector of coordinates in `dims`.
pub fn linearize_index(elem: &[usize], dims: &[usize]) -> usize {
    let mut index: usize = 0;
    for (d, c) in elem.iter().enumerate() {
        index += c * dims[0..d].iter().product::<usize>();
    }
    index
}

/// given a linear index of the element, return the vector of coordinates in a
/// multi-dimensional grid of `dims` dimensions.
pub fn delinearize_index(index: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = index;
    let mut elem = vec![0; dims.len()];
    for (d, m) in dims.iter().enumerate() {
        elem[d] = idx % m;
        idx /= m;
    }
    elem
}

#[cfg(test)]
mod topology_tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn test_linearize() {
        assert_eq!(linearize_index(&[1, 1], &[4, 4]), 5);
        assert_eq!(linearize_index(&[1, 1], &[5, 5]), 6);
        assert_eq!(linearize_index(&[3, 3], &[4, 4]), 15);
    }

    #[test]
    fn test_delinearize() {
        assert_eq!(delinearize_index(6, &[4, 4]), vec![2, 1]);
        assert_eq!(delinearize_index(6, &[5, 5]), vec![1, 1]);
        assert_eq!(delinearize_index(15, &[4, 4]), vec![3, 3]);
    }

    #[test]
    fn test_lindelin() {
        let dims = vec![3, 4, 5, 6];
        for e in dims.iter().map(|&d| 0..d).multi_cartesian_product() {
            assert_eq!(delinearize_index(linearize_index(&e, &dims), &dims), e);
        }
    }

    #[test]
    fn test_ports() {
        let dims = [4, 4, 2];
        assert_eq!(grid_port(0, true), 0);
        assert_eq!(grid_port(0, false), 1);
        assert_eq!(grid_port(2, false), 5);
        assert_eq!(terminal_port(&dims), 6);
        assert_eq!(grid_radix(&dims), 7);
    }
}
