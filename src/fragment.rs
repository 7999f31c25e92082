//! Fragment：一次写入批次产生的、不可变的数组片段
//!
//! ```text
//! Uninitialized ──init──▶ Reading(ReadState) ──finalize──▶ Finalized
//!               └─init──▶ Writing(WriteState) ─finalize──▶ Finalized
//! ```
//!
//! 写入先落在临时目录 `.<name>` 下；finalize 依次刷出最后一个 tile、fsync 属性文件、
//! 持久化 book-keeping，最后原子改名为 `<name>`。改名是唯一的发布点。
//!
//! finalize 失败时 fragment 停留在 Writing：前置检查失败可以继续写入；
//! 一旦开始落盘则只能重试 finalize，已冻结的 book-keeping 不会重写。

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::array::{Array, QueryMode};
use crate::book_keeping::BookKeeping;
use crate::common::{
    push_coalesced, push_fragment_coalesced, AttributeId, CellPosRange, CopyStatus,
    FragmentCellPosRange, FragmentCellRange, FragmentError, FragmentId, Result, TileCoverage,
    TileId,
};
use crate::coords::{
    cell_in_range, cmp_cells, contains, intersection, overlaps, range_corners, with_coord_type,
    CoordBuffer, Coordinate,
};
use crate::read_state::{ReadState, TileCursor};
use crate::tile_grid::TileGrid;
use crate::write_state::{attribute_file, WriteState};

pub const BOOK_KEEPING_FILE: &str = "__book_keeping.tdb";

/// 读写状态互斥
#[derive(Debug)]
pub enum FragmentState {
    Uninitialized,
    Reading(ReadState),
    Writing(WriteState),
    Finalized,
}

impl FragmentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Reading(_)    => "reading",
            Self::Writing(ws) if ws.is_sealed() => "finalizing",
            Self::Writing(_)    => "writing",
            Self::Finalized     => "finalized",
        }
    }
}

/// 在已排序的扁平坐标数组中二分，返回第一个不满足 `pred` 的单元格下标
fn partition_cells<T: Coordinate>(coords: &[T], dim_num: usize, pred: impl Fn(&[T]) -> bool) -> usize {
    let (mut lo, mut hi) = (0, coords.len() / dim_num);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(&coords[mid * dim_num..(mid + 1) * dim_num]) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn to_i64_range<T: Coordinate>(range: &[T]) -> Result<Vec<i64>> {
    range.iter()
        .map(|v| v.to_i64())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| FragmentError::InvalidArgument("dense ranges require integer coordinates".into()))
}

#[derive(Debug)]
pub struct Fragment<'a> {
    array:         &'a Array,
    book_keeping:  BookKeeping,
    dense:         bool,
    /// 当前目录名：发布前为临时名
    fragment_name: String,
    stable_name:   String,
    full_domain:   bool,
    published:     bool,
    /// dense 读取时由 non-empty domain 重建
    grid:          Option<TileGrid>,
    state:         FragmentState,
}

impl<'a> Fragment<'a> {
    pub fn new(array: &'a Array) -> Self {
        let schema = array.schema();
        Self {
            array,
            book_keeping: BookKeeping::new(schema),
            dense: schema.dense,
            fragment_name: String::new(),
            stable_name: String::new(),
            full_domain: false,
            published: false,
            grid: None,
            state: FragmentState::Uninitialized,
        }
    }

    // ── 生命周期 ──────────────────────────────────────────────────────────────

    /// 按数组的查询模式打开 fragment。
    ///
    /// 写模式下 `range` 是写入域（dense 必须与 tile 边界对齐），读模式下是查询范围。
    /// 失败时 fragment 仍处于 Uninitialized。
    pub fn init(&mut self, fragment_name: &str, range: &CoordBuffer) -> Result<()> {
        if !matches!(self.state, FragmentState::Uninitialized) {
            return Err(FragmentError::InvalidState { op: "init", state: self.state.name() });
        }
        if fragment_name.is_empty() || fragment_name.starts_with('.') || fragment_name.contains('/') {
            return Err(FragmentError::Init(format!("invalid fragment name {fragment_name:?}")));
        }
        self.array.check_range(range).map_err(|e| match e {
            FragmentError::Init(msg) => FragmentError::Init(msg),
            other => FragmentError::Init(other.to_string()),
        })?;

        let array   = self.array;
        let schema  = array.schema();
        let storage = array.storage();
        match array.mode() {
            QueryMode::Write => {
                let temp = format!(".{fragment_name}");
                let path = array.fragment_path(&temp);
                if storage.exists(&path) || storage.exists(&array.fragment_path(fragment_name)) {
                    return Err(FragmentError::Init(format!("fragment {fragment_name} already exists")));
                }
                let ws = WriteState::new(array, &path, range)?;
                storage.create_dir(&path).map_err(|e| FragmentError::io(&path, e))?;

                self.full_domain   = *range == schema.domain;
                self.fragment_name = temp;
                self.stable_name   = fragment_name.to_string();
                self.state         = FragmentState::Writing(ws);
                info!(fragment = fragment_name, dense = self.dense, "fragment opened for write");
            }
            QueryMode::Read => {
                let path = array.fragment_path(fragment_name);
                if !storage.exists(&path) {
                    return Err(FragmentError::Init(format!("fragment {fragment_name} not found")));
                }
                let bk = BookKeeping::load(storage, &path.join(BOOK_KEEPING_FILE))?;
                if bk.dense() != schema.dense
                    || bk.coord_type() != schema.coord_type()
                    || bk.dim_num() != schema.dim_num()
                {
                    return Err(FragmentError::Init(format!(
                        "fragment {fragment_name} does not match schema of array {}",
                        schema.array_name,
                    )));
                }

                self.grid = if schema.dense {
                    let domain = bk.non_empty_domain().and_then(CoordBuffer::to_i64_vec);
                    let array_d = schema.domain.to_i64_vec();
                    let extents = schema.tile_extents.as_ref().and_then(CoordBuffer::to_i64_vec);
                    match (domain, array_d, extents) {
                        (Some(d), Some(ad), Some(e)) => {
                            Some(TileGrid::new(&ad, &d, &e, schema.tile_order, schema.cell_order)?)
                        }
                        _ => return Err(FragmentError::Init(format!(
                            "dense fragment {fragment_name} has no usable domain"
                        ))),
                    }
                } else {
                    None
                };

                let files = (0..=schema.attribute_num())
                    .map(|a| attribute_file(&path, schema, a))
                    .collect();
                self.full_domain   = bk.non_empty_domain() == Some(&schema.domain);
                self.book_keeping  = bk;
                self.fragment_name = fragment_name.to_string();
                self.stable_name   = fragment_name.to_string();
                self.published     = true;
                self.state         = FragmentState::Reading(ReadState::new(range.clone(), files));
                info!(
                    fragment = fragment_name,
                    tiles = self.book_keeping.tile_num(),
                    "fragment opened for read"
                );
            }
        }
        Ok(())
    }

    /// 写入一批单元格。
    ///
    /// `buffers` 按数组参与写入的属性顺序排列，必须覆盖全部属性（sparse 含坐标）；
    /// 第 i 个缓冲区只使用前 `buffer_sizes[i]` 字节。
    pub fn write(&mut self, buffers: &[&[u8]], buffer_sizes: &[usize]) -> Result<()> {
        let FragmentState::Writing(ws) = &mut self.state else {
            return Err(FragmentError::InvalidState { op: "write", state: self.state.name() });
        };
        let schema = self.array.schema();
        let ids = self.array.attribute_ids();
        let attr_num = schema.all_attribute_ids().len();
        if buffers.len() != ids.len() || buffer_sizes.len() != ids.len() {
            return Err(FragmentError::InvalidArgument(format!(
                "expected {} buffers and sizes, got {} and {}",
                ids.len(), buffers.len(), buffer_sizes.len(),
            )));
        }

        let mut by_attr: Vec<Option<&[u8]>> = vec![None; attr_num];
        for ((&id, &buf), &size) in ids.iter().zip(buffers).zip(buffer_sizes) {
            let data = buf.get(..size).ok_or_else(|| {
                FragmentError::InvalidArgument(format!(
                    "buffer size {size} exceeds buffer length {} for attribute {id}", buf.len(),
                ))
            })?;
            by_attr[id] = Some(data);
        }
        let by_attr = by_attr.into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FragmentError::InvalidArgument("write requires every attribute".into()))?;

        ws.write(self.array, &mut self.book_keeping, &by_attr)
    }

    /// 结束读或写。写模式下完成持久化并发布，读模式下只释放读取状态。
    ///
    /// 写模式下只有发布成功才进入 Finalized；出错后可修正原因再调用一次。
    pub fn finalize(&mut self) -> Result<()> {
        let array = self.array;
        let ws = match &mut self.state {
            other @ (FragmentState::Uninitialized | FragmentState::Finalized) => {
                return Err(FragmentError::InvalidState { op: "finalize", state: other.name() });
            }
            FragmentState::Reading(_) => {
                self.state = FragmentState::Finalized;
                return Ok(());
            }
            FragmentState::Writing(ws) => ws,
        };

        let storage = array.storage();
        let path    = array.fragment_path(&self.fragment_name);
        if !self.book_keeping.is_frozen() {
            ws.finalize(array, &mut self.book_keeping)?;
            ws.sync_files(array)?;
            self.book_keeping.flush(
                storage,
                &path.join(BOOK_KEEPING_FILE),
                array.config().book_keeping_compression,
            )?;
        }
        storage.sync(&path).map_err(|e| FragmentError::io(&path, e))?;
        self.rename_fragment()?;
        self.state = FragmentState::Finalized;
        Ok(())
    }

    /// 临时名 → 稳定名；失败时保持临时名
    fn rename_fragment(&mut self) -> Result<()> {
        let from = self.array.fragment_path(&self.fragment_name);
        let to   = self.array.fragment_path(&self.stable_name);
        match self.array.storage().rename(&from, &to) {
            Ok(()) => {
                self.fragment_name = self.stable_name.clone();
                self.published = true;
                info!(
                    fragment = %self.stable_name,
                    tiles = self.book_keeping.tile_num(),
                    "fragment published"
                );
                Ok(())
            }
            Err(e) => {
                warn!(fragment = %self.stable_name, error = %e, "fragment publish failed");
                Err(FragmentError::Publish { name: self.stable_name.clone(), reason: e.to_string() })
            }
        }
    }

    // ── 访问器 ────────────────────────────────────────────────────────────────

    pub fn array(&self)         -> &'a Array     { self.array }
    pub fn dense(&self)         -> bool          { self.dense }
    pub fn fragment_name(&self) -> &str          { &self.fragment_name }
    pub fn full_domain(&self)   -> bool          { self.full_domain }
    pub fn is_published(&self)  -> bool          { self.published }
    pub fn book_keeping(&self)  -> &BookKeeping  { &self.book_keeping }
    pub fn state(&self)         -> &FragmentState { &self.state }

    pub fn cell_num_per_tile(&self) -> u64 {
        self.array.schema().cell_num_per_tile()
    }

    /// 一个满 tile 在该属性文件中的字节数
    pub fn tile_size(&self, attribute_id: AttributeId) -> Option<usize> {
        let cell_size = self.array.schema().cell_size(attribute_id)?;
        Some(cell_size * self.cell_num_per_tile() as usize)
    }

    pub fn read_state(&self) -> Option<&ReadState> {
        match &self.state {
            FragmentState::Reading(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn write_state(&self) -> Option<&WriteState> {
        match &self.state {
            FragmentState::Writing(ws) => Some(ws),
            _ => None,
        }
    }

    pub fn current_tile(&self) -> Option<TileId> {
        self.read_state().and_then(ReadState::current_tile)
    }

    /// 当前 tile 在 dense 网格中的坐标
    pub fn get_global_tile_coords(&self) -> Option<Vec<i64>> {
        let tile = self.current_tile()?;
        self.grid.as_ref().map(|g| g.tile_coords(tile))
    }

    pub fn overflow(&self, attribute_id: AttributeId) -> bool {
        self.read_state().is_some_and(|rs| rs.overflow(attribute_id))
    }

    pub fn tile_done(&self, attribute_id: AttributeId) -> bool {
        self.read_state().map_or(true, |rs| rs.tile_done(attribute_id))
    }

    pub fn reset_overflow(&mut self) {
        if let FragmentState::Reading(rs) = &mut self.state {
            rs.reset_overflow();
        }
    }

    fn read_state_ref(&self, op: &'static str) -> Result<&ReadState> {
        match &self.state {
            FragmentState::Reading(rs) => Ok(rs),
            other => Err(FragmentError::InvalidState { op, state: other.name() }),
        }
    }

    fn read_state_mut(&mut self, op: &'static str) -> Result<&mut ReadState> {
        match &mut self.state {
            FragmentState::Reading(rs) => Ok(rs),
            other => Err(FragmentError::InvalidState { op, state: other.name() }),
        }
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    /// 按数组参与读取的属性顺序填充缓冲区，`buffer_sizes[i]` 返回写入的字节数。
    ///
    /// 缓冲区放不下时该属性进入 overflow；再次调用从上次停下的位置继续。
    /// 所有属性都返回 0 字节且无 overflow 时表示读完。
    pub fn read(&mut self, buffers: &mut [&mut [u8]], buffer_sizes: &mut [usize]) -> Result<()> {
        self.read_state_ref("read")?;
        let array  = self.array;
        let schema = array.schema();
        let ids    = array.attribute_ids();
        if buffers.len() != ids.len() || buffer_sizes.len() != ids.len() {
            return Err(FragmentError::InvalidArgument(format!(
                "expected {} buffers and sizes, got {} and {}",
                ids.len(), buffers.len(), buffer_sizes.len(),
            )));
        }
        if self.dense && ids.contains(&schema.coords_attribute_id()) {
            return Err(FragmentError::InvalidArgument("dense fragments store no coordinates".into()));
        }

        for (i, &attr) in ids.iter().enumerate() {
            let cell_size = schema.cell_size(attr)
                .ok_or_else(|| FragmentError::InvalidArgument(format!("unknown attribute {attr}")))?;
            let capacity = buffers[i].len();
            let mut offset = 0usize;
            self.read_state_mut("read")?.set_overflow(attr, false);

            loop {
                let Some(pending) = self.read_state_ref("read")?.next_pending(attr) else {
                    if self.fill_read_queue()? {
                        continue;
                    }
                    break;
                };
                let fit = ((capacity - offset) / cell_size) as u64;
                if fit == 0 {
                    self.read_state_mut("read")?.set_overflow(attr, true);
                    break;
                }
                let part = if fit >= pending.cell_num() {
                    pending
                } else {
                    CellPosRange::new(pending.start, pending.start + fit - 1)
                };
                self.copy_cell_range(attr, &mut buffers[i][..], capacity, &mut offset, part)?;
                let rs = self.read_state_mut("read")?;
                rs.advance(attr, part.cell_num());
                if part != pending {
                    rs.set_overflow(attr, true);
                    break;
                }
            }
            buffer_sizes[i] = offset;
        }

        self.read_state_mut("read")?.trim(ids);
        Ok(())
    }

    /// 推进到下一个有贡献的 tile 并把它的位置范围放入队列；没有更多 tile 时返回 false
    fn fill_read_queue(&mut self) -> Result<bool> {
        while let Some(tile) = self.get_next_overlapping_tile_mult()? {
            let ranges = self.query_ranges_in_tile(tile)?;
            if !ranges.is_empty() {
                self.read_state_mut("read")?.enqueue(ranges);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 查询范围在某个 tile 内的全部位置段
    fn query_ranges_in_tile(&mut self, tile: TileId) -> Result<Vec<CellPosRange>> {
        let query = self.read_state_ref("read")?.query_range().clone();
        if let Some(grid) = &self.grid {
            let q = query.to_i64_vec()
                .ok_or_else(|| FragmentError::InvalidArgument("dense ranges require integer coordinates".into()))?;
            return Ok(grid.cell_pos_ranges(tile, &q));
        }
        let mut out = Vec::new();
        with_coord_type!(query.coord_type(), T => {
            self.tile_cell_pos_ranges_sparse::<T>(tile, query.typed::<T>()?, &mut out)?
        });
        Ok(out)
    }

    /// 把属性在 `range` 内的字节拷贝到 `buffer[*buffer_offset..]`。
    ///
    /// 剩余容量（`buffer_size - *buffer_offset`）放不下整个范围时什么都不写，
    /// `buffer_offset` 不变，标记该属性 overflow 并返回 [`CopyStatus::Overflow`]。
    pub fn copy_cell_range(
        &mut self,
        attribute_id:  AttributeId,
        buffer:        &mut [u8],
        buffer_size:   usize,
        buffer_offset: &mut usize,
        range:         CellPosRange,
    ) -> Result<CopyStatus> {
        self.read_state_ref("copy_cell_range")?;
        let array  = self.array;
        let schema = array.schema();
        if self.dense && attribute_id == schema.coords_attribute_id() {
            return Err(FragmentError::InvalidArgument("dense fragments store no coordinates".into()));
        }
        let cell_size = schema.cell_size(attribute_id)
            .ok_or_else(|| FragmentError::InvalidArgument(format!("unknown attribute {attribute_id}")))?;
        let cap = self.cell_num_per_tile();
        let total = self.book_keeping.cell_num(cap);
        if range.start > range.end || range.end >= total {
            return Err(FragmentError::InvalidArgument(format!(
                "cell range {range} outside fragment of {total} cells"
            )));
        }

        let bytes = range.cell_num() as usize * cell_size;
        let capacity = buffer_size.min(buffer.len());
        let storage = array.storage();
        let tile_offset = self.book_keeping.tile_offset(attribute_id, range.start / cap);
        let rs = self.read_state_mut("copy_cell_range")?;
        if *buffer_offset > capacity || bytes > capacity - *buffer_offset {
            rs.set_overflow(attribute_id, true);
            return Ok(CopyStatus::Overflow);
        }

        let tile_offset = tile_offset.ok_or_else(|| {
            FragmentError::Corrupted(format!("no offset for tile {} of attribute {attribute_id}", range.start / cap))
        })?;
        let file_offset = tile_offset + (range.start % cap) * cell_size as u64;
        let path = rs.file(attribute_id)
            .ok_or_else(|| FragmentError::InvalidArgument(format!("unknown attribute {attribute_id}")))?;
        let dst = &mut buffer[*buffer_offset..*buffer_offset + bytes];
        storage.read_at(path, file_offset, dst).map_err(|e| FragmentError::io(path, e))?;
        *buffer_offset += bytes;
        Ok(CopyStatus::Copied)
    }

    // ── 跨 fragment 合并原语 ───────────────────────────────────────────────────

    /// 推进到下一个与查询范围重叠的 tile（tile id 递增，不回头）
    pub fn get_next_overlapping_tile_mult(&mut self) -> Result<Option<TileId>> {
        with_coord_type!(self.array.schema().coord_type(), T => self.next_overlapping_tile::<T>())
    }

    fn next_overlapping_tile<T: Coordinate>(&mut self) -> Result<Option<TileId>> {
        let bk = &self.book_keeping;
        let rs = match &mut self.state {
            FragmentState::Reading(rs) => rs,
            other => {
                return Err(FragmentError::InvalidState {
                    op: "get_next_overlapping_tile_mult", state: other.name(),
                });
            }
        };
        let start = match rs.tile_cursor() {
            TileCursor::NotStarted => 0,
            TileCursor::At(t)      => t + 1,
            TileCursor::Exhausted  => return Ok(None),
        };

        let query = rs.query_range().typed::<T>()?;
        let mut next = None;
        for tile in start..bk.tile_num() {
            if overlaps(bk.mbr::<T>(tile)?, query) {
                next = Some(tile);
                break;
            }
        }
        rs.set_tile_cursor(next.map_or(TileCursor::Exhausted, TileCursor::At));
        debug!(fragment = %self.fragment_name, tile = ?next, "advanced to overlapping tile");
        Ok(next)
    }

    /// 当前 tile 对查询范围的贡献
    pub fn compute_fragment_cell_ranges<T: Coordinate>(
        &self,
        fragment_i: FragmentId,
        out:        &mut Vec<FragmentCellRange>,
    ) -> Result<()> {
        let rs = self.read_state_ref("compute_fragment_cell_ranges")?;
        let Some(tile) = rs.current_tile() else { return Ok(()) };
        let mbr   = self.book_keeping.mbr::<T>(tile)?;
        let query = rs.query_range().typed::<T>()?;
        let Some(overlap) = intersection(mbr, query) else { return Ok(()) };

        let coverage = if contains(query, mbr) { TileCoverage::Full } else { TileCoverage::Partial };
        out.push(FragmentCellRange {
            fragment_id: fragment_i,
            tile_id:     tile,
            cell_range:  T::into_buffer(overlap),
            coverage,
        });
        Ok(())
    }

    /// 当前 tile 是否整体落在 `range` 内（边界重合也算）
    pub fn max_overlap<T: Coordinate>(&self, range: &[T]) -> Result<bool> {
        let rs = self.read_state_ref("max_overlap")?;
        match rs.current_tile() {
            Some(tile) => Ok(contains(range, self.book_keeping.mbr::<T>(tile)?)),
            None => Ok(false),
        }
    }

    /// dense：当前 tile 内落在 `cell_range` 的最大连续位置段
    pub fn get_cell_pos_ranges_dense<T: Coordinate>(
        &self,
        fragment_i: FragmentId,
        cell_range: &[T],
        out:        &mut Vec<FragmentCellPosRange>,
    ) -> Result<()> {
        let rs = self.read_state_ref("get_cell_pos_ranges_dense")?;
        let Some(grid) = &self.grid else {
            return Err(FragmentError::InvalidArgument("fragment is not dense".into()));
        };
        let Some(tile) = rs.current_tile() else { return Ok(()) };
        let floor = out.len();
        for r in grid.cell_pos_ranges(tile, &to_i64_range(cell_range)?) {
            push_fragment_coalesced(out, floor, FragmentCellPosRange::new(fragment_i, r));
        }
        Ok(())
    }

    /// sparse：`tile_domain ∩ cell_range` 内所有存储单元格的最大连续位置段。
    ///
    /// 按 MBR 剪枝后逐 tile 解析：tile 整体被包含时直接给出整段，
    /// 否则读入坐标并用全局序二分缩小扫描区间。
    pub fn get_cell_pos_ranges_sparse<T: Coordinate>(
        &mut self,
        fragment_i:  FragmentId,
        tile_domain: &[T],
        cell_range:  &[T],
        out:         &mut Vec<FragmentCellPosRange>,
    ) -> Result<()> {
        self.read_state_ref("get_cell_pos_ranges_sparse")?;
        if self.dense {
            return Err(FragmentError::InvalidArgument("fragment is not sparse".into()));
        }
        let Some(target) = intersection(tile_domain, cell_range) else { return Ok(()) };
        let (_, hi) = range_corners(&target);
        let order = self.array.schema().cell_order;

        let mut runs = Vec::new();
        for tile in 0..self.book_keeping.tile_num() {
            let (first, _) = self.book_keeping.bounding_coords::<T>(tile)?;
            if cmp_cells(first, &hi, order) == Ordering::Greater {
                break;
            }
            if overlaps(self.book_keeping.mbr::<T>(tile)?, &target) {
                self.tile_cell_pos_ranges_sparse::<T>(tile, &target, &mut runs)?;
            }
        }

        let floor = out.len();
        for r in runs {
            push_fragment_coalesced(out, floor, FragmentCellPosRange::new(fragment_i, r));
        }
        Ok(())
    }

    /// 单个 sparse tile 内落在 `target` 的位置段，追加并合并到 `out`
    fn tile_cell_pos_ranges_sparse<T: Coordinate>(
        &mut self,
        tile:   TileId,
        target: &[T],
        out:    &mut Vec<CellPosRange>,
    ) -> Result<()> {
        let cap  = self.cell_num_per_tile();
        let base = tile * cap;
        let n    = self.book_keeping.cell_num_in_tile(tile, cap);
        let mbr  = self.book_keeping.mbr::<T>(tile)?;
        if !overlaps(mbr, target) || n == 0 {
            return Ok(());
        }
        if contains(target, mbr) {
            push_coalesced(out, CellPosRange::new(base, base + n - 1));
            return Ok(());
        }

        let order   = self.array.schema().cell_order;
        let dim_num = self.array.schema().dim_num();
        let (lo, hi) = range_corners(target);
        let coords = self.load_coords_tile::<T>(tile)?;
        let begin = partition_cells(coords, dim_num, |c| cmp_cells(c, &lo, order) == Ordering::Less);
        let end   = partition_cells(coords, dim_num, |c| cmp_cells(c, &hi, order) != Ordering::Greater);

        for i in begin..end {
            if cell_in_range(&coords[i * dim_num..(i + 1) * dim_num], target) {
                push_coalesced(out, CellPosRange::single(base + i as u64));
            }
        }
        Ok(())
    }

    /// 读入某个 tile 的坐标（缓存最近一个）
    fn load_coords_tile<T: Coordinate>(&mut self, tile: TileId) -> Result<&[T]> {
        let array     = self.array;
        let schema    = array.schema();
        let storage   = array.storage();
        let coords_id = schema.coords_attribute_id();
        let n         = self.book_keeping.cell_num_in_tile(tile, schema.cell_num_per_tile());
        let offset    = self.book_keeping.tile_offset(coords_id, tile);
        let rs = match &mut self.state {
            FragmentState::Reading(rs) => rs,
            other => return Err(FragmentError::InvalidState { op: "load_coords_tile", state: other.name() }),
        };

        if rs.cached_coords::<T>(tile).is_none() {
            let offset = offset
                .ok_or_else(|| FragmentError::Corrupted(format!("no coordinate offset for tile {tile}")))?;
            let path = rs.file(coords_id)
                .ok_or_else(|| FragmentError::Corrupted("missing coordinate file".into()))?;
            let mut bytes = vec![0u8; n as usize * schema.coords_size()];
            storage.read_at(path, offset, &mut bytes).map_err(|e| FragmentError::io(path, e))?;
            rs.cache_coords(tile, CoordBuffer::from_le_bytes(T::TYPE, &bytes)?);
        }
        match rs.cached_coords::<T>(tile) {
            Some(coords) => coords,
            None => Err(FragmentError::Corrupted(format!("coordinate tile {tile} not cached"))),
        }
    }

    /// 坐标是否存在于本 fragment。dense 以 non-empty domain 判断。
    pub fn coords_exist<T: Coordinate>(&mut self, coords: &[T]) -> Result<bool> {
        self.read_state_ref("coords_exist")?;
        let dim_num = self.array.schema().dim_num();
        if coords.len() != dim_num {
            return Err(FragmentError::InvalidArgument(format!(
                "expected {dim_num} coordinates, got {}", coords.len(),
            )));
        }
        if self.dense {
            return Ok(match self.book_keeping.non_empty_domain() {
                Some(domain) => cell_in_range(coords, domain.typed::<T>()?),
                None => false,
            });
        }

        let order = self.array.schema().cell_order;
        for tile in 0..self.book_keeping.tile_num() {
            let (before, after) = {
                let (first, last) = self.book_keeping.bounding_coords::<T>(tile)?;
                (cmp_cells(coords, first, order), cmp_cells(coords, last, order))
            };
            if before == Ordering::Less {
                break;
            }
            if after == Ordering::Greater || !cell_in_range(coords, self.book_keeping.mbr::<T>(tile)?) {
                continue;
            }
            let stored = self.load_coords_tile::<T>(tile)?;
            let i = partition_cells(stored, dim_num, |c| cmp_cells(c, coords, order) == Ordering::Less);
            let hit = stored.get(i * dim_num..(i + 1) * dim_num)
                .is_some_and(|c| cmp_cells(c, coords, order) == Ordering::Equal);
            return Ok(hit);
        }
        Ok(false)
    }

    /// 全局序中不早于 `start_coords` 的前两个存储坐标（sparse）
    pub fn get_first_two_coords<T: Coordinate>(
        &mut self,
        start_coords: &[T],
    ) -> Result<(Option<Vec<T>>, Option<Vec<T>>)> {
        self.read_state_ref("get_first_two_coords")?;
        if self.dense {
            return Err(FragmentError::InvalidArgument("fragment is not sparse".into()));
        }
        let order   = self.array.schema().cell_order;
        let dim_num = self.array.schema().dim_num();

        let mut found: Vec<Vec<T>> = Vec::with_capacity(2);
        for tile in 0..self.book_keeping.tile_num() {
            let (_, last) = self.book_keeping.bounding_coords::<T>(tile)?;
            if cmp_cells(last, start_coords, order) == Ordering::Less {
                continue;
            }
            let stored = self.load_coords_tile::<T>(tile)?;
            let i = partition_cells(stored, dim_num, |c| cmp_cells(c, start_coords, order) == Ordering::Less);
            for cell in stored[i * dim_num..].chunks_exact(dim_num) {
                found.push(cell.to_vec());
                if found.len() == 2 {
                    break;
                }
            }
            if found.len() == 2 {
                break;
            }
        }

        let mut it = found.into_iter();
        Ok((it.next(), it.next()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArraySchema, Attribute, Layout};
    use crate::storage::LocalStorage;

    fn sparse_schema() -> ArraySchema {
        ArraySchema::sparse(
            "points", &["x", "y"], CoordBuffer::Int64(vec![0, 99, 0, 99]), 4,
            vec![Attribute::new("v", 4)],
        )
    }

    #[test]
    fn test_partition_cells() {
        let coords = [0i64, 0, 0, 5, 1, 2, 3, 3];
        let lt = |p: [i64; 2]| move |c: &[i64]| cmp_cells(c, &p, Layout::RowMajor) == Ordering::Less;
        assert_eq!(partition_cells(&coords, 2, lt([0, 0])), 0);
        assert_eq!(partition_cells(&coords, 2, lt([0, 6])), 2);
        assert_eq!(partition_cells(&coords, 2, lt([9, 9])), 4);
    }

    #[test]
    fn test_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let array = Array::new(sparse_schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();
        let mut frag = Fragment::new(&array);

        assert!(matches!(frag.finalize(), Err(FragmentError::InvalidState { state: "uninitialized", .. })));
        assert!(matches!(frag.write(&[], &[]), Err(FragmentError::InvalidState { .. })));

        frag.init("f1", array.range()).unwrap();
        assert_eq!(frag.fragment_name(), ".f1");
        assert!(frag.full_domain());
        assert!(matches!(frag.init("f1", array.range()), Err(FragmentError::InvalidState { op: "init", .. })));
        assert!(matches!(frag.read(&mut [], &mut []), Err(FragmentError::InvalidState { op: "read", .. })));

        frag.finalize().unwrap();
        assert_eq!(frag.fragment_name(), "f1");
        assert!(frag.is_published());
        assert!(matches!(frag.finalize(), Err(FragmentError::InvalidState { state: "finalized", .. })));
        assert!(matches!(frag.write(&[], &[]), Err(FragmentError::InvalidState { state: "finalized", .. })));
    }

    #[test]
    fn test_init_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let array = Array::new(sparse_schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();

        let mut frag = Fragment::new(&array);
        assert!(matches!(frag.init(".hidden", array.range()), Err(FragmentError::Init(_))));
        assert!(matches!(
            frag.init("f1", &CoordBuffer::Int32(vec![0, 9, 0, 9])),
            Err(FragmentError::Init(_))
        ));
        assert!(matches!(
            frag.init("f1", &CoordBuffer::Int64(vec![9, 0, 0, 9])),
            Err(FragmentError::Init(_))
        ));
        assert_eq!(frag.state().name(), "uninitialized");

        let reader = Array::new(sparse_schema(), dir.path(), LocalStorage, QueryMode::Read).unwrap();
        let mut frag = Fragment::new(&reader);
        assert!(matches!(frag.init("missing", reader.range()), Err(FragmentError::Init(_))));
    }

    #[test]
    fn test_tile_size() {
        let dir = tempfile::tempdir().unwrap();
        let array = Array::new(sparse_schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();
        let frag = Fragment::new(&array);
        assert_eq!(frag.cell_num_per_tile(), 4);
        assert_eq!(frag.tile_size(0), Some(16));
        assert_eq!(frag.tile_size(1), Some(64));
        assert_eq!(frag.tile_size(2), None);
    }
}
