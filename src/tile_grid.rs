//! Dense fragment 的规则 tile 网格
//!
//! 网格覆盖 fragment 的写入域（必须与数组 tile 边界对齐）。tile id 按 tile order
//! 线性化，tile 内单元格按 cell order 线性化；单元格位置 = tile_id × 每 tile 单元格数 + tile 内偏移。

use crate::common::{push_coalesced, CellPosRange, FragmentError, Result, TileId};
use crate::coords::intersection;
use crate::schema::Layout;

#[derive(Debug, Clone)]
pub struct TileGrid {
    domain:        Vec<i64>,
    extents:       Vec<i64>,
    tiles_per_dim: Vec<i64>,
    tile_order:    Layout,
    cell_order:    Layout,
}

/// 维度从慢到快的排列
fn dims_slow_to_fast(dim_num: usize, order: Layout) -> Vec<usize> {
    match order {
        Layout::RowMajor => (0..dim_num).collect(),
        Layout::ColMajor => (0..dim_num).rev().collect(),
    }
}

fn linearize(idx: &[i64], shape: &[i64], order: Layout) -> i64 {
    dims_slow_to_fast(idx.len(), order)
        .into_iter()
        .fold(0, |pos, d| pos * shape[d] + idx[d])
}

fn delinearize(mut pos: i64, shape: &[i64], order: Layout) -> Vec<i64> {
    let mut idx = vec![0; shape.len()];
    for d in dims_slow_to_fast(shape.len(), order).into_iter().rev() {
        idx[d] = pos % shape[d];
        pos /= shape[d];
    }
    idx
}

/// 闭区间 `[lo, hi]` 的长度；溢出 i64 时为 None
pub(crate) fn span(lo: i64, hi: i64) -> Option<i64> {
    hi.checked_sub(lo)?.checked_add(1)
}

impl TileGrid {
    pub fn new(
        array_domain: &[i64],
        domain:       &[i64],
        extents:      &[i64],
        tile_order:   Layout,
        cell_order:   Layout,
    ) -> Result<Self> {
        let mut tiles_per_dim = Vec::with_capacity(extents.len());
        let mut cell_num = 1u64;
        for (d, &ext) in extents.iter().enumerate() {
            let (lo, hi) = (domain[2 * d], domain[2 * d + 1]);
            let len    = span(lo, hi);
            let offset = lo.checked_sub(array_domain[2 * d]);
            let (Some(len), Some(offset)) = (len, offset) else {
                return Err(FragmentError::Init(format!(
                    "dense range [{lo},{hi}] on dimension {d} is too large"
                )));
            };
            if ext <= 0 || offset % ext != 0 || len % ext != 0 {
                return Err(FragmentError::Init(format!(
                    "dense range [{lo},{hi}] on dimension {d} is not aligned to tile extent {ext}"
                )));
            }
            cell_num = cell_num.checked_mul(len as u64).ok_or_else(|| {
                FragmentError::Init("dense range holds more cells than positions can address".into())
            })?;
            tiles_per_dim.push(len / ext);
        }
        Ok(Self {
            domain: domain.to_vec(),
            extents: extents.to_vec(),
            tiles_per_dim, tile_order, cell_order,
        })
    }

    pub fn tile_num(&self) -> u64 {
        self.tiles_per_dim.iter().map(|&n| n as u64).product()
    }

    pub fn cell_num_per_tile(&self) -> u64 {
        self.extents.iter().map(|&e| e as u64).product()
    }

    /// tile 在网格中的坐标
    pub fn tile_coords(&self, tile_id: TileId) -> Vec<i64> {
        delinearize(tile_id as i64, &self.tiles_per_dim, self.tile_order)
    }

    /// tile 覆盖的坐标闭区间
    pub fn tile_domain(&self, tile_id: TileId) -> Vec<i64> {
        self.tile_coords(tile_id)
            .iter()
            .enumerate()
            .flat_map(|(d, &t)| {
                let lo = self.domain[2 * d] + t * self.extents[d];
                [lo, lo + self.extents[d] - 1]
            })
            .collect()
    }

    /// 单元格坐标对应的 fragment 内位置
    pub fn cell_pos(&self, coords: &[i64]) -> Option<u64> {
        let mut tile_idx  = Vec::with_capacity(coords.len());
        let mut local_idx = Vec::with_capacity(coords.len());
        for (d, &c) in coords.iter().enumerate() {
            if c < self.domain[2 * d] || c > self.domain[2 * d + 1] {
                return None;
            }
            let off = c - self.domain[2 * d];
            tile_idx.push(off / self.extents[d]);
            local_idx.push(off % self.extents[d]);
        }
        let tile_id = linearize(&tile_idx, &self.tiles_per_dim, self.tile_order) as u64;
        let local   = linearize(&local_idx, &self.extents, self.cell_order) as u64;
        Some(tile_id * self.cell_num_per_tile() + local)
    }

    /// tile 与 `range` 重叠部分的最大连续位置段（按 cell order）
    pub fn cell_pos_ranges(&self, tile_id: TileId, range: &[i64]) -> Vec<CellPosRange> {
        let mut out = Vec::new();
        let tile_domain = self.tile_domain(tile_id);
        let Some(overlap) = intersection(&tile_domain, range) else {
            return out;
        };
        let dim_num  = self.extents.len();
        let lo: Vec<i64> = (0..dim_num).map(|d| overlap[2 * d] - tile_domain[2 * d]).collect();
        let hi: Vec<i64> = (0..dim_num).map(|d| overlap[2 * d + 1] - tile_domain[2 * d]).collect();

        let order = dims_slow_to_fast(dim_num, self.cell_order);
        let (outer, fast) = (&order[..dim_num - 1], order[dim_num - 1]);
        let base = tile_id * self.cell_num_per_tile();

        let mut idx = lo.clone();
        loop {
            let start = linearize(&idx, &self.extents, self.cell_order) as u64;
            let len   = (hi[fast] - lo[fast]) as u64;
            push_coalesced(&mut out, CellPosRange::new(base + start, base + start + len));

            // 里程表式推进外层维度
            let mut k = outer.len();
            loop {
                if k == 0 {
                    return out;
                }
                k -= 1;
                let d = outer[k];
                if idx[d] < hi[d] {
                    idx[d] += 1;
                    break;
                }
                idx[d] = lo[d];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_8x8() -> TileGrid {
        TileGrid::new(&[0, 7, 0, 7], &[0, 7, 0, 7], &[4, 4], Layout::RowMajor, Layout::RowMajor).unwrap()
    }

    #[test]
    fn test_tile_domains_in_tile_order() {
        let g = grid_8x8();
        assert_eq!(g.tile_num(), 4);
        assert_eq!(g.tile_domain(0), vec![0, 3, 0, 3]);
        assert_eq!(g.tile_domain(1), vec![0, 3, 4, 7]);
        assert_eq!(g.tile_domain(2), vec![4, 7, 0, 3]);
        assert_eq!(g.tile_coords(3), vec![1, 1]);
    }

    #[test]
    fn test_partial_tile_ranges() {
        let g = grid_8x8();
        let q = [2, 5, 2, 5];
        assert_eq!(g.cell_pos_ranges(0, &q), vec![CellPosRange::new(10, 11), CellPosRange::new(14, 15)]);
        assert_eq!(g.cell_pos_ranges(1, &q), vec![CellPosRange::new(24, 25), CellPosRange::new(28, 29)]);
    }

    #[test]
    fn test_full_rows_coalesce() {
        let g = grid_8x8();
        assert_eq!(g.cell_pos_ranges(3, &[0, 7, 0, 7]), vec![CellPosRange::new(48, 63)]);
        assert_eq!(g.cell_pos_ranges(2, &[5, 6, 0, 3]), vec![CellPosRange::new(36, 43)]);
        assert!(g.cell_pos_ranges(0, &[4, 7, 4, 7]).is_empty());
    }

    #[test]
    fn test_col_major_cells() {
        let g = TileGrid::new(&[0, 1, 0, 2], &[0, 1, 0, 2], &[2, 3], Layout::RowMajor, Layout::ColMajor).unwrap();
        assert_eq!(g.cell_pos_ranges(0, &[0, 1, 1, 2]), vec![CellPosRange::new(2, 5)]);
        assert_eq!(g.cell_pos_ranges(0, &[1, 1, 0, 2]), vec![
            CellPosRange::new(1, 1), CellPosRange::new(3, 3), CellPosRange::new(5, 5),
        ]);
        assert_eq!(g.cell_pos(&[1, 2]), Some(5));
    }

    #[test]
    fn test_unaligned_domain_rejected() {
        assert!(TileGrid::new(&[0, 7], &[1, 4], &[4], Layout::RowMajor, Layout::RowMajor).is_err());
        assert!(TileGrid::new(&[0, 7], &[4, 6], &[4], Layout::RowMajor, Layout::RowMajor).is_err());
        assert!(TileGrid::new(&[0, 15], &[4, 11], &[4], Layout::RowMajor, Layout::RowMajor).is_ok());
    }

    #[test]
    fn test_oversized_domain_rejected() {
        let full = [i64::MIN, i64::MAX];
        assert!(matches!(
            TileGrid::new(&full, &full, &[2], Layout::RowMajor, Layout::RowMajor),
            Err(FragmentError::Init(_))
        ));
        assert!(matches!(
            TileGrid::new(&[0, 7], &[i64::MIN, 7], &[4], Layout::RowMajor, Layout::RowMajor),
            Err(FragmentError::Init(_))
        ));
        // 每维都合法，但单元格总数超出 u64
        let wide = [0, 1 << 40, 0, 1 << 40];
        let domain = [0, (1 << 40) - 1, 0, (1 << 40) - 1];
        assert!(TileGrid::new(&wide, &domain, &[1, 1], Layout::RowMajor, Layout::RowMajor).is_err());
    }
}
