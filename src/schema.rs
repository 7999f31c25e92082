//! 数组 Schema：维度、属性、tile 划分方式

use crate::common::{AttributeId, FragmentError, Result};
use crate::coords::{is_valid_range, with_coord_type, CoordBuffer, CoordType};
use crate::tile_grid::span;

/// 坐标存放在一个伪属性里，id 为 `attribute_num()`
pub const COORDS_NAME: &str = "__coords";

// ── 布局 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 最后一维变化最快
    RowMajor,
    /// 第一维变化最快
    ColMajor,
}

// ── 属性 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name:      String,
    /// 每个单元格的固定字节数
    pub cell_size: usize,
}

impl Attribute {
    pub fn new(name: &str, cell_size: usize) -> Self {
        Self { name: name.into(), cell_size }
    }
}

// ── ArraySchema ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArraySchema {
    pub array_name:   String,
    pub dimensions:   Vec<String>,
    pub attributes:   Vec<Attribute>,
    /// [lo_0, hi_0, lo_1, hi_1, ...]
    pub domain:       CoordBuffer,
    /// dense 数组每维的 tile 宽度
    pub tile_extents: Option<CoordBuffer>,
    /// sparse 数组每个 tile 的单元格数
    pub capacity:     u64,
    pub cell_order:   Layout,
    pub tile_order:   Layout,
    pub dense:        bool,
}

impl ArraySchema {
    /// 构建 dense schema
    pub fn dense(
        array_name:   &str,
        dimensions:   &[&str],
        domain:       CoordBuffer,
        tile_extents: CoordBuffer,
        attributes:   Vec<Attribute>,
    ) -> Self {
        Self {
            array_name: array_name.into(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            attributes, domain,
            tile_extents: Some(tile_extents),
            capacity: 0,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            dense: true,
        }
    }

    /// 构建 sparse schema
    pub fn sparse(
        array_name: &str,
        dimensions: &[&str],
        domain:     CoordBuffer,
        capacity:   u64,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            array_name: array_name.into(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            attributes, domain,
            tile_extents: None,
            capacity,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            dense: false,
        }
    }

    pub fn with_cell_order(mut self, order: Layout) -> Self {
        self.cell_order = order; self
    }
    pub fn with_tile_order(mut self, order: Layout) -> Self {
        self.tile_order = order; self
    }

    pub fn dim_num(&self) -> usize { self.dimensions.len() }
    pub fn coord_type(&self) -> CoordType { self.domain.coord_type() }

    /// 真实属性个数（不含坐标伪属性）
    pub fn attribute_num(&self) -> usize { self.attributes.len() }
    pub fn coords_attribute_id(&self) -> AttributeId { self.attributes.len() }

    /// 属性名；坐标伪属性返回 `__coords`
    pub fn attribute_name(&self, id: AttributeId) -> Option<&str> {
        if id == self.coords_attribute_id() {
            return Some(COORDS_NAME);
        }
        self.attributes.get(id).map(|a| a.name.as_str())
    }

    pub fn attribute_id(&self, name: &str) -> Option<AttributeId> {
        if name == COORDS_NAME {
            return Some(self.coords_attribute_id());
        }
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn cell_size(&self, id: AttributeId) -> Option<usize> {
        if id == self.coords_attribute_id() {
            return Some(self.coords_size());
        }
        self.attributes.get(id).map(|a| a.cell_size)
    }

    /// 一个坐标元组的字节数
    pub fn coords_size(&self) -> usize { self.dim_num() * self.coord_type().size() }

    pub fn cell_num_per_tile(&self) -> u64 {
        match self.tile_extents.as_ref().and_then(|e| e.to_i64_vec()) {
            Some(extents) if self.dense => extents.iter().map(|&e| e as u64).product(),
            _ => self.capacity,
        }
    }

    /// 当前 schema 下所有可读写属性的 id（sparse 时包含坐标）
    pub fn all_attribute_ids(&self) -> Vec<AttributeId> {
        let n = if self.dense { self.attribute_num() } else { self.attribute_num() + 1 };
        (0..n).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(FragmentError::Init(msg));

        if self.dimensions.is_empty() {
            return err("schema has no dimensions".into());
        }
        if self.attributes.is_empty() {
            return err("schema has no attributes".into());
        }
        if let Some(a) = self.attributes.iter().find(|a| a.cell_size == 0 || a.name == COORDS_NAME) {
            return err(format!("invalid attribute `{}`", a.name));
        }
        let dim_num = self.dim_num();
        let domain_ok = with_coord_type!(self.coord_type(), T => {
            self.domain.typed::<T>().map(|d| is_valid_range(d, dim_num)).unwrap_or(false)
        });
        if !domain_ok {
            return err(format!("invalid domain for {dim_num} dimensions"));
        }

        if self.dense {
            if !self.coord_type().is_integer() {
                return err("dense arrays require integer coordinates".into());
            }
            let extents = self.tile_extents.as_ref()
                .filter(|e| e.coord_type() == self.coord_type())
                .and_then(|e| e.to_i64_vec())
                .ok_or_else(|| FragmentError::Init("dense arrays require tile extents".into()))?;
            let domain = self.domain.to_i64_vec().unwrap_or_default();
            if extents.len() != dim_num {
                return err("tile extents do not match dimension count".into());
            }
            for (i, (&ext, r)) in extents.iter().zip(domain.chunks_exact(2)).enumerate() {
                let Some(len) = span(r[0], r[1]) else {
                    return err(format!("domain of dimension {i} is too large"));
                };
                if ext <= 0 || len % ext != 0 {
                    return err(format!("tile extent {ext} does not divide dimension {i}"));
                }
            }
        } else if self.capacity == 0 {
            return err("sparse arrays require a positive capacity".into());
        }
        Ok(())
    }
}
