//! 多路归并：把各 fragment 已排序的位置范围序列合成一条全局序列
//!
//! 输入的每条序列内部按 `range.start` 递增且互不重叠；输出按位置递增，
//! 同一 fragment 首尾相接的范围会被合并。任意两段重叠视为上游错误。

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::common::{push_fragment_coalesced, FragmentCellPosRange, FragmentError, Result};

pub fn merge_by_position(seqs: Vec<Vec<FragmentCellPosRange>>) -> Result<Vec<FragmentCellPosRange>> {
    for (s, seq) in seqs.iter().enumerate() {
        for pair in seq.windows(2) {
            if pair[0].range.end >= pair[1].range.start || pair[0].range.start > pair[0].range.end {
                return Err(FragmentError::InvalidArgument(format!(
                    "sequence {s} is not sorted and disjoint at {} / {}",
                    pair[0].range, pair[1].range,
                )));
            }
        }
    }

    // 小顶堆：(起始位置, fragment id, 序列下标, 序列内下标)
    let mut heap = BinaryHeap::with_capacity(seqs.len());
    for (s, seq) in seqs.iter().enumerate() {
        if let Some(first) = seq.first() {
            heap.push(Reverse((first.range.start, first.fragment_id, s, 0usize)));
        }
    }

    let total = seqs.iter().map(Vec::len).sum();
    let mut out: Vec<FragmentCellPosRange> = Vec::with_capacity(total);
    while let Some(Reverse((_, _, s, i))) = heap.pop() {
        let item = seqs[s][i];
        if let Some(prev) = out.last() {
            if prev.range.end >= item.range.start {
                return Err(FragmentError::InvalidArgument(format!(
                    "range {} of fragment {} overlaps range {} of fragment {}",
                    item.range, item.fragment_id, prev.range, prev.fragment_id,
                )));
            }
        }
        push_fragment_coalesced(&mut out, 0, item);
        if let Some(next) = seqs[s].get(i + 1) {
            heap.push(Reverse((next.range.start, next.fragment_id, s, i + 1)));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CellPosRange;
    use proptest::prelude::*;

    fn r(f: usize, s: u64, e: u64) -> FragmentCellPosRange {
        FragmentCellPosRange::new(f, CellPosRange::new(s, e))
    }

    #[test]
    fn test_interleaved_fragments() {
        let merged = merge_by_position(vec![
            vec![r(0, 0, 2), r(0, 10, 11)],
            vec![r(1, 3, 5), r(1, 12, 20)],
            vec![],
        ]).unwrap();
        assert_eq!(merged, vec![r(0, 0, 2), r(1, 3, 5), r(0, 10, 11), r(1, 12, 20)]);
    }

    #[test]
    fn test_same_fragment_runs_coalesce() {
        let merged = merge_by_position(vec![vec![r(2, 0, 3)], vec![r(2, 4, 7)]]).unwrap();
        assert_eq!(merged, vec![r(2, 0, 7)]);
    }

    #[test]
    fn test_overlap_rejected() {
        assert!(merge_by_position(vec![vec![r(0, 0, 5)], vec![r(1, 5, 6)]]).is_err());
        assert!(merge_by_position(vec![vec![r(0, 4, 5), r(0, 0, 1)]]).is_err());
    }

    /// 把 0..n 随机切成若干段并随机分给 k 个 fragment
    fn partitioned() -> impl Strategy<Value = (u64, Vec<Vec<FragmentCellPosRange>>)> {
        (1u64..200, 1usize..6).prop_flat_map(|(n, k)| {
            (
                Just(n),
                Just(k),
                prop::collection::vec(any::<bool>(), n as usize),
                prop::collection::vec(0..k, n as usize),
            )
        }).prop_map(|(n, k, cuts, owners)| {
            let mut seqs = vec![Vec::new(); k];
            let mut start = 0u64;
            for pos in 0..n {
                if pos + 1 == n || cuts[pos as usize] {
                    let owner = owners[start as usize];
                    seqs[owner].push(r(owner, start, pos));
                    start = pos + 1;
                }
            }
            (n, seqs)
        })
    }

    proptest! {
        #[test]
        fn merged_ranges_cover_every_position_once((n, seqs) in partitioned()) {
            let merged = merge_by_position(seqs).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let mut next = 0u64;
            for item in &merged {
                prop_assert_eq!(item.range.start, next);
                next = item.range.end + 1;
            }
            prop_assert_eq!(next, n);
            for pair in merged.windows(2) {
                prop_assert!(!(pair[0].fragment_id == pair[1].fragment_id
                    && pair[0].range.is_followed_by(&pair[1].range)));
            }
        }
    }
}
