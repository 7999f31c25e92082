//! Fragment 读写配置

/// book-keeping 文件的压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// 同一写入周期内重复坐标的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// 保留先写入的单元格，丢弃后来者
    FirstWins,
    /// 后写入的单元格覆盖先前的值
    LastWins,
}

#[derive(Debug, Clone)]
pub struct FragmentConfig {
    pub book_keeping_compression: CompressionType,
    pub duplicate_policy:         DuplicatePolicy,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            book_keeping_compression: CompressionType::Lz4,
            duplicate_policy:         DuplicatePolicy::LastWins,
        }
    }
}

impl FragmentConfig {
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.book_keeping_compression = comp; self
    }
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy; self
    }
}
