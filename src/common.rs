//! 全局基础类型与错误定义

use std::path::PathBuf;
use thiserror::Error;

use crate::coords::{CoordBuffer, CoordType};

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type FragmentId  = usize;
pub type AttributeId = usize;
pub type TileId      = u64;
/// 单元格在 fragment 磁盘布局（按 tile 排列）中的序号
pub type CellPos     = u64;

// ── CellPosRange ──────────────────────────────────────────────────────────────

/// [start, end] 闭区间的单元格位置范围，对应一段可直接整体拷贝的连续数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPosRange {
    pub start: CellPos,
    pub end:   CellPos,
}

impl CellPosRange {
    pub fn new(start: CellPos, end: CellPos) -> Self { Self { start, end } }
    pub fn single(pos: CellPos) -> Self { Self::new(pos, pos) }

    pub fn cell_num(&self) -> u64 { self.end - self.start + 1 }

    /// `next` 紧接在本范围之后，可以合并
    pub fn is_followed_by(&self, next: &CellPosRange) -> bool {
        self.end + 1 == next.start
    }
}

impl std::fmt::Display for CellPosRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// 追加一个范围；与尾部相邻时就地合并，保证输出范围两两不相邻
pub fn push_coalesced(out: &mut Vec<CellPosRange>, range: CellPosRange) {
    match out.last_mut() {
        Some(last) if last.is_followed_by(&range) => last.end = range.end,
        _ => out.push(range),
    }
}

/// 带 fragment 标记的位置范围（跨 fragment 稀疏合并的交换单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentCellPosRange {
    pub fragment_id: FragmentId,
    pub range:       CellPosRange,
}

impl FragmentCellPosRange {
    pub fn new(fragment_id: FragmentId, range: CellPosRange) -> Self {
        Self { fragment_id, range }
    }
}

/// 同上，但只与 `floor` 之后（本次调用产生）的同 fragment 尾部合并
pub fn push_fragment_coalesced(
    out:   &mut Vec<FragmentCellPosRange>,
    floor: usize,
    item:  FragmentCellPosRange,
) {
    if out.len() > floor {
        if let Some(last) = out.last_mut() {
            if last.fragment_id == item.fragment_id && last.range.is_followed_by(&item.range) {
                last.range.end = item.range.end;
                return;
            }
        }
    }
    out.push(item);
}

// ── FragmentCellRange ─────────────────────────────────────────────────────────

/// 当前 tile 与查询范围的覆盖关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileCoverage {
    /// 整个 tile 落在查询范围内，可整块拷贝
    Full,
    /// 部分重叠，下游还需逐位置解析
    Partial,
}

/// 一个 fragment 对当前 tile 的贡献：重叠区域（坐标闭区间）+ 覆盖类型
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentCellRange {
    pub fragment_id: FragmentId,
    pub tile_id:     TileId,
    /// [lo_0, hi_0, lo_1, hi_1, ...]
    pub cell_range:  CoordBuffer,
    pub coverage:    TileCoverage,
}

// ── 拷贝结果 ──────────────────────────────────────────────────────────────────

/// `copy_cell_range` 的结果；Overflow 不是错误，而是可恢复的暂停信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Copied,
    Overflow,
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("fragment init failed: {0}")]
    Init(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot publish fragment {name}: {reason}")]
    Publish { name: String, reason: String },
    #[error("{op} is not allowed while the fragment is {state}")]
    InvalidState { op: &'static str, state: &'static str },
    #[error("coordinate type mismatch: expected {expected:?}, found {found:?}")]
    CoordTypeMismatch { expected: CoordType, found: CoordType },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("book-keeping corrupted: {0}")]
    Corrupted(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("compression error: {0}")]
    Compression(String),
}

impl FragmentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, FragmentError>;
