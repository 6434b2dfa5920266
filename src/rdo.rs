//! Rate-distortion optimized truncation
//!
//! Every data chunk carries an estimate of the squared error it removes. The
//! chunks of one `(iteration, subband, chunk index)` form a chain ordered from
//! the most to the least significant bit-plane; only prefixes of a chain are
//! decodable. Each chain is reduced to its upper convex hull, the hull
//! segments of all chains are ranked by slope, and every quality level keeps
//! the longest prefix of that ranking that fits its byte budget.

use crate::address::ChunkAddress;
use crate::layout::VolumeFormat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// One emitted data chunk, as seen by the optimizer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RdoChunk {
    /// Packed [`ChunkAddress`]
    pub address: u64,
    pub length: u64,
    /// Distortion reduction per byte
    pub lambda: f64,
}

impl RdoChunk {
    /// `ones` one bits on plane `bit_plane` each remove about `4^bit_plane` of squared error
    pub fn new(address: ChunkAddress, length: u64, ones: u64) -> Self {
        let distortion = ones as f64 * 4f64.powi(address.bit_plane as i32);
        Self {
            address: address.pack(),
            length,
            lambda: distortion / length.max(1) as f64,
        }
    }

    pub fn distortion(&self) -> f64 {
        self.lambda * self.length.max(1) as f64
    }
}

/// Truncation planes of one chain, one per quality level; `i16::MAX` keeps nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdoEntry {
    pub subband: u8,
    pub chunk: u64,
    pub min_bit_plane: Vec<i16>,
}

/// Contents of one `.rdo` file: the chains of one (iteration, spatial file)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdoFile {
    pub entries: Vec<RdoEntry>,
}

/// Result of the optimization
#[derive(Debug, Clone, Default)]
pub struct RdoPlan {
    /// Byte budget per quality level, ascending
    pub budgets: Vec<u64>,
    /// Data bytes actually kept per quality level
    pub retained_bytes: Vec<u64>,
    /// Truncation tables keyed by (iteration, spatial file)
    pub files: BTreeMap<(u8, u64), RdoFile>,
}

type ChainKey = (u8, u8, u64);

#[derive(Debug, Clone, Copy)]
struct Segment {
    chain: ChainKey,
    bytes: u64,
    slope: f64,
    lowest_plane: i16,
    /// Address of the segment's last chunk, used to break ties
    address: u64,
}

/// Upper convex hull of a chain's cumulative (bytes, distortion) curve
fn hull_segments(chain: ChainKey, links: &[RdoChunk]) -> Vec<Segment> {
    let mut points = Vec::with_capacity(links.len() + 1);
    points.push((0u64, 0f64));
    for link in links {
        let (r, d) = points[points.len() - 1];
        points.push((r + link.length.max(1), d + link.distortion()));
    }
    let slope = |a: (u64, f64), b: (u64, f64)| (b.1 - a.1) / (b.0 - a.0) as f64;
    let mut hull: Vec<usize> = vec![0];
    for i in 1..points.len() {
        while hull.len() >= 2 {
            let a = points[hull[hull.len() - 2]];
            let b = points[hull[hull.len() - 1]];
            if slope(a, b) <= slope(b, points[i]) {
                hull.pop();
            } else {
                break;
            }
        }
        hull.push(i);
    }
    hull.windows(2)
        .map(|w| {
            let (a, b) = (points[w[0]], points[w[1]]);
            let last = &links[w[1] - 1];
            Segment {
                chain,
                bytes: b.0 - a.0,
                slope: slope(a, b),
                lowest_plane: ChunkAddress::unpack(last.address).bit_plane as i16,
                address: last.address,
            }
        })
        .collect()
}

/// Choose per-level truncation planes.
///
/// `divisors` are the configured quality levels: level budget = total data
/// bytes / divisor. Levels are returned in ascending budget order.
pub fn optimize(format: &VolumeFormat, chunks: &[RdoChunk], divisors: &[u32]) -> RdoPlan {
    if divisors.is_empty() {
        return RdoPlan::default();
    }
    let mut chains: BTreeMap<ChainKey, Vec<RdoChunk>> = BTreeMap::new();
    for chunk in chunks {
        let a = ChunkAddress::unpack(chunk.address);
        chains
            .entry((a.iteration, a.subband, a.chunk))
            .or_default()
            .push(*chunk);
    }
    let mut segments = Vec::new();
    for (key, links) in chains.iter_mut() {
        links.sort_by(|a, b| b.address.cmp(&a.address));
        segments.extend(hull_segments(*key, links));
    }
    segments.sort_by(|a, b| {
        b.slope
            .partial_cmp(&a.slope)
            .unwrap_or(Ordering::Equal)
            .then(b.address.cmp(&a.address))
    });

    let total: u64 = chunks.iter().map(|c| c.length).sum();
    let mut budgets: Vec<u64> = divisors.iter().map(|&d| total / d.max(1) as u64).collect();
    budgets.sort_unstable();

    let n_levels = budgets.len();
    let mut planes: BTreeMap<ChainKey, Vec<i16>> = chains
        .keys()
        .map(|&k| (k, vec![i16::MAX; n_levels]))
        .collect();
    let mut retained_bytes = Vec::with_capacity(n_levels);
    for (level, &budget) in budgets.iter().enumerate() {
        let mut used = 0u64;
        for seg in &segments {
            if used + seg.bytes > budget {
                break;
            }
            used += seg.bytes;
            if let Some(p) = planes.get_mut(&seg.chain) {
                p[level] = p[level].min(seg.lowest_plane);
            }
        }
        retained_bytes.push(used);
    }

    let mut files: BTreeMap<(u8, u64), RdoFile> = BTreeMap::new();
    for ((iteration, subband, chunk), min_bit_plane) in planes {
        let file = chunk >> format.iteration(iteration as usize).chunk_bits;
        files
            .entry((iteration, file))
            .or_default()
            .entries
            .push(RdoEntry {
                subband,
                chunk,
                min_bit_plane,
            });
    }

    debug!(
        levels = n_levels,
        total_bytes = total,
        budgets = ?budgets,
        retained = ?retained_bytes,
        "rate-distortion levels chosen"
    );

    RdoPlan {
        budgets,
        retained_bytes,
        files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FormatBuilder;
    use glam::IVec3;

    fn format() -> VolumeFormat {
        FormatBuilder::new()
            .with_dimensions(IVec3::splat(64))
            .with_brick_size(IVec3::splat(16))
            .with_bricks_per_chunk(8)
            .with_chunks_per_file(2)
            .finalize()
            .unwrap()
    }

    fn chain(subband: usize, chunk: u64, planes: &[(u16, u64, u64)]) -> Vec<RdoChunk> {
        planes
            .iter()
            .map(|&(bp, length, ones)| RdoChunk::new(ChunkAddress::new(0, subband, bp, chunk), length, ones))
            .collect()
    }

    #[test]
    fn test_hull_merges_concave_steps() {
        // second link is worse per byte than the third, so they merge
        let links = chain(1, 0, &[(6, 10, 100), (5, 100, 1), (4, 10, 400)]);
        let mut sorted = links.clone();
        sorted.sort_by(|a, b| b.address.cmp(&a.address));
        let segs = hull_segments((0, 1, 0), &sorted);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].lowest_plane, 6);
        assert_eq!(segs[1].lowest_plane, 4);
        assert_eq!(segs[1].bytes, 110);
        assert!(segs[0].slope > segs[1].slope);
    }

    #[test]
    fn test_levels_are_monotone() {
        let format = format();
        let mut chunks = Vec::new();
        for c in 0..4u64 {
            chunks.extend(chain(1, c, &[(7, 20, 30 + c), (6, 40, 80), (5, 80, 200), (4, 160, 300)]));
            chunks.extend(chain(3, c, &[(5, 30, 10), (4, 60, 100 + 5 * c)]));
        }
        let plan = optimize(&format, &chunks, &[1, 8, 2, 4]);
        assert_eq!(plan.budgets.len(), 4);
        assert!(plan.budgets.windows(2).all(|w| w[0] <= w[1]));
        assert!(plan.retained_bytes.windows(2).all(|w| w[0] <= w[1]));
        for (level, (&kept, &budget)) in plan.retained_bytes.iter().zip(&plan.budgets).enumerate() {
            assert!(kept <= budget, "level {} over budget", level);
        }
        // divisor 1 keeps everything
        assert_eq!(*plan.retained_bytes.last().unwrap(), plan.budgets[3]);
        for file in plan.files.values() {
            for entry in &file.entries {
                assert!(entry.min_bit_plane.windows(2).all(|w| w[0] >= w[1]));
                assert_eq!(*entry.min_bit_plane.last().unwrap(), 4);
            }
        }
        // 4 chunks of 2 per file -> 2 files
        assert_eq!(plan.files.len(), 2);
    }

    #[test]
    fn test_empty_configuration() {
        let plan = optimize(&format(), &[], &[]);
        assert!(plan.budgets.is_empty());
        assert!(plan.files.is_empty());
    }
}
