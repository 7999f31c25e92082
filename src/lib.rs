//! # array-fragment
//!
//! 多维数组（dense / sparse）的 fragment 存储层：一次写入批次落成一个不可变目录，
//! 读取时按查询范围剪枝 tile、解析出可直接按字节拷贝的单元格位置段。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Array  (ArraySchema + 目录 + StorageBackend + 查询范围)      │
//! │     │ &'a                                                     │
//! │  Fragment<'a>                                                 │
//! │   ├─ BookKeeping   每 tile 的 MBR / 首尾坐标 / 各属性偏移      │
//! │   │                 (byteorder + LZ4 + CRC32 页脚)            │
//! │   └─ FragmentState                                            │
//! │       ├─ Writing(WriteState)  tile 缓冲 → append → 登记       │
//! │       └─ Reading(ReadState)   tile 游标 / 位置段队列 / 溢出    │
//! │                                                               │
//! │  TileGrid      dense 规则网格：tile 域、位置段                 │
//! │  merge         多 fragment 位置段的多路归并                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! 磁盘布局：
//!
//! ```text
//! <array_dir>/
//!   .<fragment>/          写入中（未发布）
//!   <fragment>/           finalize 后原子改名
//!     <attr>.tdb          各属性的 tile，按 tile id 顺序追加
//!     __coords.tdb        sparse 坐标
//!     __book_keeping.tdb
//! ```

// ── 基础类型 ──────────────────────────────────────────────────────────────────
pub mod common;
pub mod coords;
pub mod schema;
pub mod config;

// ── 存储与元数据 ──────────────────────────────────────────────────────────────
pub mod compression;
pub mod storage;
pub mod array;
pub mod tile_grid;
pub mod book_keeping;

// ── Fragment ──────────────────────────────────────────────────────────────────
pub mod write_state;
pub mod read_state;
pub mod fragment;
pub mod merge;

pub use array::{Array, QueryMode};
pub use common::{
    CellPosRange, CopyStatus, FragmentCellPosRange, FragmentCellRange, FragmentError, Result,
    TileCoverage,
};
pub use config::{CompressionType, DuplicatePolicy, FragmentConfig};
pub use coords::{CoordBuffer, CoordType, Coordinate};
pub use fragment::Fragment;
pub use schema::{ArraySchema, Attribute, Layout};
pub use storage::{LocalStorage, StorageBackend};
