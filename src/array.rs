//! 数组上下文：Schema + 存储位置 + 当前查询
//!
//! Fragment 只借用 `&Array`，生命周期受 Array 约束。

use std::path::{Path, PathBuf};

use crate::common::{AttributeId, FragmentError, Result};
use crate::config::FragmentConfig;
use crate::coords::{is_valid_range, with_coord_type, CoordBuffer};
use crate::schema::ArraySchema;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Read,
    Write,
}

pub struct Array {
    schema:        ArraySchema,
    dir:           PathBuf,
    storage:       Box<dyn StorageBackend>,
    mode:          QueryMode,
    /// 默认查询范围，未指定时等于整个 domain
    range:         CoordBuffer,
    /// 参与读写的属性；read/write 的缓冲区按此顺序排列
    attribute_ids: Vec<AttributeId>,
    config:        FragmentConfig,
}

impl Array {
    pub fn new(
        schema:  ArraySchema,
        dir:     impl Into<PathBuf>,
        storage: impl StorageBackend + 'static,
        mode:    QueryMode,
    ) -> Result<Self> {
        schema.validate()?;
        let range = schema.domain.clone();
        let attribute_ids = schema.all_attribute_ids();
        Ok(Self {
            schema, range, attribute_ids, mode,
            dir: dir.into(),
            storage: Box::new(storage),
            config: FragmentConfig::default(),
        })
    }

    /// 设置查询范围（读）或写入范围（写）
    pub fn with_range(mut self, range: CoordBuffer) -> Result<Self> {
        self.check_range(&range)?;
        self.range = range;
        Ok(self)
    }

    pub fn with_attributes(mut self, ids: Vec<AttributeId>) -> Result<Self> {
        let limit = self.schema.attribute_num() + usize::from(!self.schema.dense);
        if ids.is_empty() || ids.iter().any(|&id| id >= limit) {
            return Err(FragmentError::Init(format!("invalid attribute ids {ids:?}")));
        }
        self.attribute_ids = ids;
        Ok(self)
    }

    pub fn with_config(mut self, config: FragmentConfig) -> Self {
        self.config = config; self
    }

    /// 范围类型、维数、上下界与 domain 的一致性检查
    pub fn check_range(&self, range: &CoordBuffer) -> Result<()> {
        let domain = &self.schema.domain;
        if range.coord_type() != domain.coord_type() {
            return Err(FragmentError::CoordTypeMismatch {
                expected: domain.coord_type(),
                found:    range.coord_type(),
            });
        }
        let dim_num = self.schema.dim_num();
        let ok = with_coord_type!(domain.coord_type(), T => {
            match (range.typed::<T>(), domain.typed::<T>()) {
                (Ok(r), Ok(d)) => is_valid_range(r, dim_num) && crate::coords::contains(d, r),
                _ => false,
            }
        });
        if !ok {
            return Err(FragmentError::Init(format!("range {range:?} is invalid for domain {domain:?}")));
        }
        Ok(())
    }

    pub fn schema(&self)        -> &ArraySchema          { &self.schema }
    pub fn dir(&self)           -> &Path                 { &self.dir }
    pub fn storage(&self)       -> &dyn StorageBackend   { self.storage.as_ref() }
    pub fn mode(&self)          -> QueryMode             { self.mode }
    pub fn range(&self)         -> &CoordBuffer          { &self.range }
    pub fn attribute_ids(&self) -> &[AttributeId]        { &self.attribute_ids }
    pub fn config(&self)        -> &FragmentConfig       { &self.config }

    pub fn fragment_path(&self, fragment_name: &str) -> PathBuf {
        self.dir.join(fragment_name)
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("array_name", &self.schema.array_name)
            .field("dir", &self.dir)
            .field("mode", &self.mode)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}
