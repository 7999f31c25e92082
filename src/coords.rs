//! 坐标类型与几何计算
//!
//! 坐标类型是一个封闭集合（i32 / i64 / f32 / f64）。所有跨类型传递的坐标都放在
//! [`CoordBuffer`] 里，由判别式区分，取用时通过 [`Coordinate::view`] 做类型检查。
//!
//! 范围统一按 `[lo_0, hi_0, lo_1, hi_1, ...]` 排布，两端均为闭区间。

use std::cmp::Ordering;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{FragmentError, Result};
use crate::schema::Layout;

// ── CoordType ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordType {
    Int32,
    Int64,
    Float32,
    Float64,
}

impl CoordType {
    /// 单个坐标值的字节宽度
    pub fn size(self) -> usize {
        match self {
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Int32   => 0,
            Self::Int64   => 1,
            Self::Float32 => 2,
            Self::Float64 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Int32),
            1 => Some(Self::Int64),
            2 => Some(Self::Float32),
            3 => Some(Self::Float64),
            _ => None,
        }
    }
}

/// 按运行时坐标类型分派到泛型代码：`with_coord_type!(ct, T => expr)`
macro_rules! with_coord_type {
    ($ct:expr, $T:ident => $body:expr) => {
        match $ct {
            $crate::coords::CoordType::Int32   => { type $T = i32; $body }
            $crate::coords::CoordType::Int64   => { type $T = i64; $body }
            $crate::coords::CoordType::Float32 => { type $T = f32; $body }
            $crate::coords::CoordType::Float64 => { type $T = f64; $body }
        }
    };
}
pub(crate) use with_coord_type;

// ── CoordBuffer ───────────────────────────────────────────────────────────────

/// 带判别式的坐标数组
#[derive(Debug, Clone, PartialEq)]
pub enum CoordBuffer {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl CoordBuffer {
    pub fn empty(coord_type: CoordType) -> Self {
        match coord_type {
            CoordType::Int32   => Self::Int32(Vec::new()),
            CoordType::Int64   => Self::Int64(Vec::new()),
            CoordType::Float32 => Self::Float32(Vec::new()),
            CoordType::Float64 => Self::Float64(Vec::new()),
        }
    }

    pub fn coord_type(&self) -> CoordType {
        match self {
            Self::Int32(_)   => CoordType::Int32,
            Self::Int64(_)   => CoordType::Int64,
            Self::Float32(_) => CoordType::Float32,
            Self::Float64(_) => CoordType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int32(v)   => v.len(),
            Self::Int64(v)   => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// 以 `T` 的视角读取；类型不符返回 CoordTypeMismatch
    pub fn typed<T: Coordinate>(&self) -> Result<&[T]> {
        T::view(self).ok_or(FragmentError::CoordTypeMismatch {
            expected: T::TYPE,
            found:    self.coord_type(),
        })
    }

    pub fn typed_mut<T: Coordinate>(&mut self) -> Result<&mut Vec<T>> {
        let found = self.coord_type();
        T::view_mut(self).ok_or(FragmentError::CoordTypeMismatch { expected: T::TYPE, found })
    }

    /// 由整数坐标构造指定类型的缓冲区（dense tile 域计算使用）
    pub fn from_i64(coord_type: CoordType, values: &[i64]) -> Self {
        with_coord_type!(coord_type, T => {
            T::into_buffer(values.iter().map(|&v| T::from_i64(v)).collect())
        })
    }

    /// 整数类型返回 i64 副本，浮点类型返回 None
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        with_coord_type!(self.coord_type(), T => {
            T::view(self)?.iter().map(|v| v.to_i64()).collect()
        })
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        with_coord_type!(self.coord_type(), T => {
            T::view(self).unwrap_or_default().iter().try_for_each(|v| v.write_le(w))
        })
    }

    pub fn decode<R: Read>(coord_type: CoordType, n: usize, r: &mut R) -> io::Result<Self> {
        with_coord_type!(coord_type, T => {
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(T::read_le(r)?);
            }
            Ok(T::into_buffer(values))
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.coord_type().size());
        // 写入 Vec 不会失败
        let _ = self.encode(&mut out);
        out
    }

    pub fn from_le_bytes(coord_type: CoordType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % coord_type.size() != 0 {
            return Err(FragmentError::InvalidArgument(format!(
                "{} bytes is not a whole number of {coord_type:?} coordinates",
                bytes.len(),
            )));
        }
        let n = bytes.len() / coord_type.size();
        Self::decode(coord_type, n, &mut &bytes[..])
            .map_err(|e| FragmentError::InvalidArgument(e.to_string()))
    }
}

// ── Coordinate trait ──────────────────────────────────────────────────────────

pub trait Coordinate: Copy + PartialOrd + std::fmt::Debug + 'static {
    const TYPE: CoordType;

    fn view(buf: &CoordBuffer) -> Option<&[Self]>;
    fn view_mut(buf: &mut CoordBuffer) -> Option<&mut Vec<Self>>;
    fn into_buffer(values: Vec<Self>) -> CoordBuffer;

    /// 浮点类型返回 None
    fn to_i64(self) -> Option<i64>;
    fn from_i64(v: i64) -> Self;

    fn write_le<W: Write>(self, w: &mut W) -> io::Result<()>;
    fn read_le<R: Read>(r: &mut R) -> io::Result<Self>;
}

macro_rules! impl_coordinate {
    ($t:ty, $variant:ident, $write:ident, $read:ident, $to_i64:expr) => {
        impl Coordinate for $t {
            const TYPE: CoordType = CoordType::$variant;

            fn view(buf: &CoordBuffer) -> Option<&[Self]> {
                match buf {
                    CoordBuffer::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn view_mut(buf: &mut CoordBuffer) -> Option<&mut Vec<Self>> {
                match buf {
                    CoordBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_buffer(values: Vec<Self>) -> CoordBuffer { CoordBuffer::$variant(values) }

            fn to_i64(self) -> Option<i64> { ($to_i64)(self) }
            fn from_i64(v: i64) -> Self { v as $t }

            fn write_le<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.$write::<LittleEndian>(self)
            }

            fn read_le<R: Read>(r: &mut R) -> io::Result<Self> {
                r.$read::<LittleEndian>()
            }
        }
    };
}

impl_coordinate!(i32, Int32,   write_i32, read_i32, |v: i32| Some(i64::from(v)));
impl_coordinate!(i64, Int64,   write_i64, read_i64, |v: i64| Some(v));
impl_coordinate!(f32, Float32, write_f32, read_f32, |_: f32| None);
impl_coordinate!(f64, Float64, write_f64, read_f64, |_: f64| None);

/// 把坐标元组序列化为写入缓冲区所需的 LE 字节
pub fn coords_to_bytes<T: Coordinate>(coords: &[T]) -> Vec<u8> {
    CoordBuffer::from(coords.to_vec()).to_le_bytes()
}

impl<T: Coordinate> From<Vec<T>> for CoordBuffer {
    fn from(values: Vec<T>) -> Self { T::into_buffer(values) }
}

// ── 几何 ──────────────────────────────────────────────────────────────────────

fn max_of<T: Coordinate>(a: T, b: T) -> T { if a >= b { a } else { b } }
fn min_of<T: Coordinate>(a: T, b: T) -> T { if a <= b { a } else { b } }

/// 每维 lo <= hi，且维数与 `dim_num` 吻合
pub fn is_valid_range<T: Coordinate>(range: &[T], dim_num: usize) -> bool {
    range.len() == dim_num * 2 && range.chunks_exact(2).all(|r| r[0] <= r[1])
}

/// 两个超矩形是否相交（边界接触也算）
pub fn overlaps<T: Coordinate>(a: &[T], b: &[T]) -> bool {
    a.chunks_exact(2)
        .zip(b.chunks_exact(2))
        .all(|(x, y)| x[0] <= y[1] && y[0] <= x[1])
}

/// `inner` 是否完全落在 `outer` 内；边重合视为包含
pub fn contains<T: Coordinate>(outer: &[T], inner: &[T]) -> bool {
    outer.chunks_exact(2)
        .zip(inner.chunks_exact(2))
        .all(|(o, i)| o[0] <= i[0] && i[1] <= o[1])
}

pub fn intersection<T: Coordinate>(a: &[T], b: &[T]) -> Option<Vec<T>> {
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.chunks_exact(2).zip(b.chunks_exact(2)) {
        let lo = max_of(x[0], y[0]);
        let hi = min_of(x[1], y[1]);
        if !(lo <= hi) {
            return None;
        }
        out.push(lo);
        out.push(hi);
    }
    Some(out)
}

pub fn cell_in_range<T: Coordinate>(coords: &[T], range: &[T]) -> bool {
    coords.iter()
        .zip(range.chunks_exact(2))
        .all(|(c, r)| r[0] <= *c && *c <= r[1])
}

/// 用一个单元格扩展 MBR
pub fn expand_mbr<T: Coordinate>(mbr: &mut [T], coords: &[T]) {
    for (r, &c) in mbr.chunks_exact_mut(2).zip(coords) {
        r[0] = min_of(r[0], c);
        r[1] = max_of(r[1], c);
    }
}

/// 单点 MBR
pub fn point_mbr<T: Coordinate>(coords: &[T]) -> Vec<T> {
    coords.iter().flat_map(|&c| [c, c]).collect()
}

/// 范围的两个角：(lo corner, hi corner)
pub fn range_corners<T: Coordinate>(range: &[T]) -> (Vec<T>, Vec<T>) {
    let lo = range.chunks_exact(2).map(|r| r[0]).collect();
    let hi = range.chunks_exact(2).map(|r| r[1]).collect();
    (lo, hi)
}

/// 按单元格顺序比较两个坐标元组
///
/// RowMajor 从第 0 维开始比较，ColMajor 从最后一维开始比较。
pub fn cmp_cells<T: Coordinate>(a: &[T], b: &[T], order: Layout) -> Ordering {
    let cmp = |(x, y): (&T, &T)| x.partial_cmp(y).unwrap_or(Ordering::Equal);
    let first_diff = match order {
        Layout::RowMajor => a.iter().zip(b).map(cmp).find(|o| o.is_ne()),
        Layout::ColMajor => a.iter().rev().zip(b.iter().rev()).map(cmp).find(|o| o.is_ne()),
    };
    first_diff.unwrap_or(Ordering::Equal)
}
