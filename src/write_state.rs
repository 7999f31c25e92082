//! 写入状态：把单元格攒成 tile，满一个 tile 就落盘并登记到 book-keeping
//!
//! 每个属性（sparse 时包括坐标）独立维护一个 tile 缓冲区：
//!   - dense：单元格按全局单元格序到达，攒满 `cell_num_per_tile` 立即刷盘
//!   - sparse：坐标必须按 cell order 非降序到达，同样攒满即刷盘。重复坐标按
//!     [`DuplicatePolicy`] 处理；LastWins 时若上一个单元格已随 tile 落盘，
//!     就在文件中原地覆盖它
//!
//! 一批 sparse 单元格先整体校验（域、顺序），校验失败时状态不变。
//! finalize 开始后进入 sealed 状态，不再接受写入，但 finalize 本身可以重试。

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::array::Array;
use crate::book_keeping::BookKeeping;
use crate::common::{AttributeId, FragmentError, Result};
use crate::config::DuplicatePolicy;
use crate::coords::{
    cell_in_range, cmp_cells, expand_mbr, point_mbr, with_coord_type, CoordBuffer, Coordinate,
};
use crate::schema::{ArraySchema, Layout};
use crate::tile_grid::TileGrid;

/// 属性数据文件名
pub fn attribute_file(dir: &Path, schema: &ArraySchema, attribute_id: AttributeId) -> PathBuf {
    let name = schema.attribute_name(attribute_id).unwrap_or("__unknown");
    dir.join(format!("{name}.tdb"))
}

#[derive(Debug)]
pub struct WriteState {
    files:             Vec<PathBuf>,
    tile_buffers:      Vec<Vec<u8>>,
    cell_sizes:        Vec<usize>,
    /// dense 不写坐标文件
    stored:            Vec<bool>,
    cell_num_per_tile: u64,
    buffered_cells:    u64,
    flushed_tiles:     u64,
    cells_written:     u64,
    /// 每个属性最近刷出的 tile 中最后一个单元格的文件偏移
    last_cell_offsets: Vec<u64>,
    /// finalize 已开始
    sealed:            bool,
    last_tile_cells:   u64,
    /// 写入域：dense 为 fragment 域，sparse 为坐标允许的范围
    write_domain:      CoordBuffer,
    grid:              Option<TileGrid>,
    cell_order:        Layout,
    duplicate_policy:  DuplicatePolicy,
    // 以下仅 sparse 使用
    tile_mbr:          Option<CoordBuffer>,
    tile_first:        Option<CoordBuffer>,
    last_coords:       Option<CoordBuffer>,
    non_empty_domain:  Option<CoordBuffer>,
}

impl WriteState {
    pub fn new(array: &Array, dir: &Path, write_domain: &CoordBuffer) -> Result<Self> {
        let schema = array.schema();
        let attr_num = schema.attribute_num() + 1;

        let grid = if schema.dense {
            let domain  = write_domain.to_i64_vec();
            let array_d = schema.domain.to_i64_vec();
            let extents = schema.tile_extents.as_ref().and_then(|e| e.to_i64_vec());
            match (domain, array_d, extents) {
                (Some(d), Some(ad), Some(e)) => {
                    Some(TileGrid::new(&ad, &d, &e, schema.tile_order, schema.cell_order)?)
                }
                _ => return Err(FragmentError::Init("dense arrays require integer coordinates".into())),
            }
        } else {
            None
        };

        Ok(Self {
            files: (0..attr_num).map(|a| attribute_file(dir, schema, a)).collect(),
            tile_buffers: vec![Vec::new(); attr_num],
            cell_sizes: (0..attr_num).map(|a| schema.cell_size(a).unwrap_or(0)).collect(),
            stored: (0..attr_num).map(|a| !schema.dense || a < schema.attribute_num()).collect(),
            cell_num_per_tile: schema.cell_num_per_tile(),
            buffered_cells: 0,
            flushed_tiles: 0,
            cells_written: 0,
            last_cell_offsets: vec![0; attr_num],
            sealed: false,
            last_tile_cells: 0,
            write_domain: write_domain.clone(),
            grid,
            cell_order: schema.cell_order,
            duplicate_policy: array.config().duplicate_policy,
            tile_mbr: None,
            tile_first: None,
            last_coords: None,
            non_empty_domain: None,
        })
    }

    pub fn buffered_cells(&self) -> u64 { self.buffered_cells }
    pub fn flushed_tiles(&self)  -> u64 { self.flushed_tiles }
    pub fn cells_written(&self)  -> u64 { self.cells_written }
    pub fn is_sealed(&self)      -> bool { self.sealed }

    /// `buffers` 按属性 id 排列（sparse 的最后一个是坐标）
    pub fn write(&mut self, array: &Array, bk: &mut BookKeeping, buffers: &[&[u8]]) -> Result<()> {
        if self.sealed {
            return Err(FragmentError::InvalidState { op: "write", state: "finalizing" });
        }
        if buffers.len() != self.tile_buffers.len() - usize::from(self.grid.is_some()) {
            return Err(FragmentError::InvalidArgument(format!(
                "expected {} buffers, got {}",
                self.tile_buffers.len() - usize::from(self.grid.is_some()),
                buffers.len(),
            )));
        }
        if self.grid.is_some() {
            self.write_dense(array, bk, buffers)
        } else {
            with_coord_type!(array.schema().coord_type(), T => {
                self.write_sparse::<T>(array, bk, buffers)
            })
        }
    }

    /// 属性缓冲区中的单元格数，各属性必须一致
    fn cell_count(&self, buffers: &[&[u8]], reference: AttributeId) -> Result<u64> {
        let n = buffers[reference].len() / self.cell_sizes[reference];
        for (a, buf) in buffers.iter().enumerate() {
            if buf.len() != n * self.cell_sizes[a] {
                return Err(FragmentError::InvalidArgument(format!(
                    "buffer for attribute {a} holds {} bytes, expected {} cells of {} bytes",
                    buf.len(), n, self.cell_sizes[a],
                )));
            }
        }
        Ok(n as u64)
    }

    fn write_dense(&mut self, array: &Array, bk: &mut BookKeeping, buffers: &[&[u8]]) -> Result<()> {
        let n = self.cell_count(buffers, 0)?;
        let expected = self.grid.as_ref().map_or(0, |g| g.tile_num() * g.cell_num_per_tile());
        if self.cells_written + n > expected {
            return Err(FragmentError::InvalidArgument(format!(
                "dense fragment holds {expected} cells, {} already written, {n} more given",
                self.cells_written,
            )));
        }

        let mut done = 0u64;
        while done < n {
            let k = (n - done).min(self.cell_num_per_tile - self.buffered_cells);
            for (a, buf) in buffers.iter().enumerate() {
                let cs = self.cell_sizes[a];
                let (from, to) = (done as usize * cs, (done + k) as usize * cs);
                self.tile_buffers[a].extend_from_slice(&buf[from..to]);
            }
            self.buffered_cells += k;
            self.cells_written  += k;
            done += k;
            if self.buffered_cells == self.cell_num_per_tile {
                self.flush_tile(array, bk)?;
            }
        }
        Ok(())
    }

    fn write_sparse<T: Coordinate>(
        &mut self,
        array:   &Array,
        bk:      &mut BookKeeping,
        buffers: &[&[u8]],
    ) -> Result<()> {
        let coords_id = buffers.len() - 1;
        self.cell_count(buffers, coords_id)?;
        let dim_num = array.schema().dim_num();
        let coords_buf = CoordBuffer::from_le_bytes(T::TYPE, buffers[coords_id])?;
        let coords = coords_buf.typed::<T>()?;
        self.check_sparse_batch(coords, dim_num)?;

        for (i, c) in coords.chunks_exact(dim_num).enumerate() {
            let duplicate = match &self.last_coords {
                Some(last) => cmp_cells(c, last.typed::<T>()?, self.cell_order) == Ordering::Equal,
                None => false,
            };
            if duplicate {
                if self.duplicate_policy == DuplicatePolicy::LastWins {
                    self.overwrite_last_cell(array, &buffers[..coords_id], i)?;
                }
                continue;
            }

            for (a, buf) in buffers.iter().enumerate() {
                let cs = self.cell_sizes[a];
                self.tile_buffers[a].extend_from_slice(&buf[i * cs..(i + 1) * cs]);
            }
            if let Some(mbr) = self.tile_mbr.as_mut() {
                expand_mbr(mbr.typed_mut::<T>()?, c);
            } else {
                self.tile_mbr = Some(T::into_buffer(point_mbr(c)));
                self.tile_first = Some(T::into_buffer(c.to_vec()));
            }
            if let Some(d) = self.non_empty_domain.as_mut() {
                expand_mbr(d.typed_mut::<T>()?, c);
            } else {
                self.non_empty_domain = Some(T::into_buffer(point_mbr(c)));
            }
            self.last_coords = Some(T::into_buffer(c.to_vec()));
            self.buffered_cells += 1;
            self.cells_written  += 1;

            if self.buffered_cells == self.cell_num_per_tile {
                self.flush_tile(array, bk)?;
            }
        }
        Ok(())
    }

    /// 整批检查写入域与全局单元格序，不修改任何状态
    fn check_sparse_batch<T: Coordinate>(&self, coords: &[T], dim_num: usize) -> Result<()> {
        let domain = self.write_domain.typed::<T>()?;
        let mut prev = match &self.last_coords {
            Some(last) => Some(last.typed::<T>()?),
            None => None,
        };
        for c in coords.chunks_exact(dim_num) {
            if !cell_in_range(c, domain) {
                return Err(FragmentError::InvalidArgument(format!(
                    "coordinates {c:?} fall outside the write domain"
                )));
            }
            if prev.is_some_and(|p| cmp_cells(c, p, self.cell_order) == Ordering::Less) {
                return Err(FragmentError::InvalidArgument(format!(
                    "coordinates {c:?} arrive out of global cell order"
                )));
            }
            prev = Some(c);
        }
        Ok(())
    }

    /// 用第 `i` 个输入单元格覆盖最近写入的单元格（不含坐标）
    fn overwrite_last_cell(&mut self, array: &Array, values: &[&[u8]], i: usize) -> Result<()> {
        for (a, buf) in values.iter().enumerate() {
            let cs   = self.cell_sizes[a];
            let cell = &buf[i * cs..(i + 1) * cs];
            if self.buffered_cells > 0 {
                let len = self.tile_buffers[a].len();
                self.tile_buffers[a][len - cs..].copy_from_slice(cell);
            } else {
                // 上一个单元格刚随满 tile 落盘
                let path = &self.files[a];
                array.storage()
                    .write_at(path, self.last_cell_offsets[a], cell)
                    .map_err(|e| FragmentError::io(path, e))?;
            }
        }
        Ok(())
    }

    fn flush_tile(&mut self, array: &Array, bk: &mut BookKeeping) -> Result<()> {
        let storage = array.storage();
        let tile_id = self.flushed_tiles;

        for (a, buf) in self.tile_buffers.iter_mut().enumerate() {
            // 重试时跳过上次已经落盘的属性
            if !self.stored[a] || bk.tile_offset(a, tile_id).is_some() {
                continue;
            }
            let path = &self.files[a];
            let offset = storage.append(path, buf).map_err(|e| FragmentError::io(path, e))?;
            bk.append_tile_offset(a, offset)?;
            self.last_cell_offsets[a] = offset + (buf.len() - self.cell_sizes[a]) as u64;
            buf.clear();
        }

        let coord_type = array.schema().coord_type();
        match &self.grid {
            Some(grid) => {
                let mbr = CoordBuffer::from_i64(coord_type, &grid.tile_domain(tile_id));
                with_coord_type!(coord_type, T => bk.append_mbr::<T>(mbr.typed::<T>()?))?;
            }
            None => {
                let mbr   = self.tile_mbr.take();
                let first = self.tile_first.take();
                if let (Some(mbr), Some(first), Some(last)) = (mbr, first, self.last_coords.as_ref()) {
                    with_coord_type!(coord_type, T => {
                        bk.append_mbr::<T>(mbr.typed::<T>()?)?;
                        bk.append_bounding_coords::<T>(first.typed::<T>()?, last.typed::<T>()?)
                    })?;
                }
            }
        }

        debug!(tile = tile_id, cells = self.buffered_cells, "tile flushed");
        self.buffered_cells = 0;
        self.flushed_tiles += 1;
        Ok(())
    }

    /// 刷出最后一个不满的 tile，并补全 book-keeping 的收尾字段。
    ///
    /// dense 单元格不足时返回错误且状态不变，仍可继续写入；通过检查后进入 sealed，
    /// 之后的 I/O 失败可以再次调用本方法重试。
    pub fn finalize(&mut self, array: &Array, bk: &mut BookKeeping) -> Result<()> {
        if !self.sealed {
            if let Some(grid) = &self.grid {
                let expected = grid.tile_num() * grid.cell_num_per_tile();
                if self.cells_written != expected {
                    return Err(FragmentError::InvalidArgument(format!(
                        "dense fragment received {} of {expected} cells",
                        self.cells_written,
                    )));
                }
            }
            self.sealed = true;
            self.last_tile_cells = match self.buffered_cells {
                0 if self.flushed_tiles > 0 => self.cell_num_per_tile,
                n => n,
            };
        }

        if self.buffered_cells > 0 {
            self.flush_tile(array, bk)?;
        }
        if self.last_tile_cells > 0 {
            bk.set_last_tile_cell_num(self.last_tile_cells)?;
        }

        let domain = if self.grid.is_some() {
            Some(self.write_domain.clone())
        } else {
            self.non_empty_domain.clone()
        };
        bk.set_non_empty_domain(domain)
    }

    /// fsync 所有已写出的属性文件
    pub fn sync_files(&self, array: &Array) -> Result<()> {
        if self.flushed_tiles == 0 {
            return Ok(());
        }
        let storage = array.storage();
        for (path, _) in self.files.iter().zip(&self.stored).filter(|(_, stored)| **stored) {
            storage.sync(path).map_err(|e| FragmentError::io(path, e))?;
        }
        Ok(())
    }
}
