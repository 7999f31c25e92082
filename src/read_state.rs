//! 读取状态
//!
//! 记录当前重叠 tile、每个属性的溢出标志与拷贝游标，以及已解析但尚未拷贝完的
//! 位置范围队列。各属性共享队列、各自推进，因此一次 `read` 溢出后再次调用会从
//! 上次停下的位置继续，而不是重新计算。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::common::{AttributeId, CellPosRange, Result, TileId};
use crate::coords::{CoordBuffer, Coordinate};

/// 重叠 tile 游标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCursor {
    NotStarted,
    At(TileId),
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
struct AttributeCursor {
    /// 队列中的绝对下标
    next_range: usize,
    /// 该范围内已拷贝的单元格数
    cells_done: u64,
}

#[derive(Debug)]
pub struct ReadState {
    query_range: CoordBuffer,
    tile:        TileCursor,
    files:       Vec<PathBuf>,
    overflow:    Vec<bool>,
    cursors:     Vec<AttributeCursor>,
    queue:       VecDeque<CellPosRange>,
    /// queue[0] 的绝对下标
    queue_base:  usize,
    coords_tile: Option<(TileId, CoordBuffer)>,
}

impl ReadState {
    /// `files` 按属性 id 排列（含坐标伪属性）
    pub fn new(query_range: CoordBuffer, files: Vec<PathBuf>) -> Self {
        let n = files.len();
        Self {
            query_range,
            tile: TileCursor::NotStarted,
            files,
            overflow: vec![false; n],
            cursors: vec![AttributeCursor::default(); n],
            queue: VecDeque::new(),
            queue_base: 0,
            coords_tile: None,
        }
    }

    pub fn query_range(&self) -> &CoordBuffer { &self.query_range }
    pub fn tile_cursor(&self) -> TileCursor   { self.tile }

    pub fn current_tile(&self) -> Option<TileId> {
        match self.tile {
            TileCursor::At(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn set_tile_cursor(&mut self, cursor: TileCursor) { self.tile = cursor; }

    pub(crate) fn file(&self, attribute_id: AttributeId) -> Option<&Path> {
        self.files.get(attribute_id).map(PathBuf::as_path)
    }

    // ── 溢出 ──────────────────────────────────────────────────────────────────

    pub fn overflow(&self, attribute_id: AttributeId) -> bool {
        self.overflow.get(attribute_id).copied().unwrap_or(false)
    }

    pub(crate) fn set_overflow(&mut self, attribute_id: AttributeId, value: bool) {
        if let Some(flag) = self.overflow.get_mut(attribute_id) {
            *flag = value;
        }
    }

    pub fn reset_overflow(&mut self) {
        self.overflow.iter_mut().for_each(|f| *f = false);
    }

    /// 该属性已拷贝完目前解析出的全部范围（即当前 tile 的贡献）
    pub fn tile_done(&self, attribute_id: AttributeId) -> bool {
        self.cursors.get(attribute_id).map_or(true, |c| {
            c.next_range >= self.queue_end() && c.cells_done == 0
        })
    }

    // ── 范围队列 ──────────────────────────────────────────────────────────────

    fn queue_end(&self) -> usize { self.queue_base + self.queue.len() }

    pub fn queued_ranges(&self) -> usize { self.queue.len() }

    pub(crate) fn enqueue(&mut self, ranges: impl IntoIterator<Item = CellPosRange>) {
        self.queue.extend(ranges);
    }

    /// 属性下一段待拷贝的范围（扣除已拷贝的前缀）
    pub(crate) fn next_pending(&self, attribute_id: AttributeId) -> Option<CellPosRange> {
        let c = self.cursors.get(attribute_id)?;
        let r = self.queue.get(c.next_range.checked_sub(self.queue_base)?)?;
        Some(CellPosRange::new(r.start + c.cells_done, r.end))
    }

    /// 记录属性又拷贝了 `cells` 个单元格
    pub(crate) fn advance(&mut self, attribute_id: AttributeId, cells: u64) {
        let Some(c) = self.cursors.get_mut(attribute_id) else { return };
        let Some(r) = c.next_range.checked_sub(self.queue_base).and_then(|i| self.queue.get(i)) else {
            return;
        };
        if c.cells_done + cells >= r.cell_num() {
            c.next_range += 1;
            c.cells_done = 0;
        } else {
            c.cells_done += cells;
        }
    }

    /// 丢弃所有活跃属性都已拷贝完的范围
    pub(crate) fn trim(&mut self, active: &[AttributeId]) {
        let min = active.iter()
            .filter_map(|&a| self.cursors.get(a))
            .map(|c| c.next_range)
            .min()
            .unwrap_or(self.queue_base);
        while self.queue_base < min && self.queue.pop_front().is_some() {
            self.queue_base += 1;
        }
    }

    // ── 坐标 tile 缓存 ────────────────────────────────────────────────────────

    pub(crate) fn cached_coords<T: Coordinate>(&self, tile: TileId) -> Option<Result<&[T]>> {
        match &self.coords_tile {
            Some((t, buf)) if *t == tile => Some(buf.typed::<T>()),
            _ => None,
        }
    }

    pub(crate) fn cache_coords(&mut self, tile: TileId, coords: CoordBuffer) {
        self.coords_tile = Some((tile, coords));
    }
}
