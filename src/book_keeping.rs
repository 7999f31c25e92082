//! Fragment 的 book-keeping 元数据
//!
//! 写入期间只追加，finalize 时整体落盘一次；读取时整体加载，之后只读。
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "FRAGBK\0\0"     │
//! │  Version(4 bytes) = 1              │
//! │  Codec  (1 byte)  None / LZ4       │
//! │  Raw length (8 bytes)              │
//! ├────────────────────────────────────┤
//! │  PAYLOAD (可能经过 LZ4 压缩)         │
//! │    dense / coord type / dim 数      │
//! │    non-empty domain                │
//! │    每 tile MBR                      │
//! │    每 tile 首/末坐标 (sparse)        │
//! │    每属性每 tile 的文件偏移          │
//! │    最后一个 tile 的单元格数          │
//! ├────────────────────────────────────┤
//! │  Payload CRC32  (4 bytes)          │
//! │  Payload length (8 bytes)          │
//! │  MAGIC          (8 bytes)          │
//! └────────────────────────────────────┘
//! ```

use std::io::{self, Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::common::{AttributeId, FragmentError, Result, TileId};
use crate::compression;
use crate::config::CompressionType;
use crate::coords::{CoordBuffer, CoordType, Coordinate};
use crate::schema::ArraySchema;
use crate::storage::StorageBackend;

const MAGIC: &[u8; 8] = b"FRAGBK\0\0";
const VERSION: u32     = 1;
const HEADER_LEN: usize = 8 + 4 + 1 + 8;
const FOOTER_LEN: usize = 4 + 8 + 8;

#[derive(Debug, Clone, PartialEq)]
pub struct BookKeeping {
    dense:              bool,
    coord_type:         CoordType,
    dim_num:            usize,
    /// 含坐标伪属性
    attribute_num:      usize,
    non_empty_domain:   Option<CoordBuffer>,
    /// 每 tile 2×dim 个值，扁平存放
    mbrs:               CoordBuffer,
    /// 每 tile 的首坐标 + 末坐标，扁平存放（仅 sparse）
    bounding_coords:    CoordBuffer,
    /// tile_offsets[attribute][tile]
    tile_offsets:       Vec<Vec<u64>>,
    last_tile_cell_num: u64,
    /// 落盘或加载后不可再修改
    frozen:             bool,
}

impl BookKeeping {
    pub fn new(schema: &ArraySchema) -> Self {
        let coord_type = schema.coord_type();
        Self {
            dense: schema.dense,
            coord_type,
            dim_num: schema.dim_num(),
            attribute_num: schema.attribute_num() + 1,
            non_empty_domain: None,
            mbrs: CoordBuffer::empty(coord_type),
            bounding_coords: CoordBuffer::empty(coord_type),
            tile_offsets: vec![Vec::new(); schema.attribute_num() + 1],
            last_tile_cell_num: 0,
            frozen: false,
        }
    }

    // ── 写入期追加 ────────────────────────────────────────────────────────────

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(FragmentError::InvalidState { op: "book-keeping update", state: "finalized" });
        }
        Ok(())
    }

    pub fn append_tile_offset(&mut self, attribute_id: AttributeId, offset: u64) -> Result<()> {
        self.check_mutable()?;
        self.tile_offsets
            .get_mut(attribute_id)
            .ok_or_else(|| FragmentError::InvalidArgument(format!("attribute {attribute_id} out of range")))?
            .push(offset);
        Ok(())
    }

    pub fn append_mbr<T: Coordinate>(&mut self, mbr: &[T]) -> Result<()> {
        self.check_mutable()?;
        self.mbrs.typed_mut::<T>()?.extend_from_slice(mbr);
        Ok(())
    }

    pub fn append_bounding_coords<T: Coordinate>(&mut self, first: &[T], last: &[T]) -> Result<()> {
        self.check_mutable()?;
        let bc = self.bounding_coords.typed_mut::<T>()?;
        bc.extend_from_slice(first);
        bc.extend_from_slice(last);
        Ok(())
    }

    pub fn set_non_empty_domain(&mut self, domain: Option<CoordBuffer>) -> Result<()> {
        self.check_mutable()?;
        self.non_empty_domain = domain;
        Ok(())
    }

    pub fn set_last_tile_cell_num(&mut self, n: u64) -> Result<()> {
        self.check_mutable()?;
        self.last_tile_cell_num = n;
        Ok(())
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    pub fn dense(&self)       -> bool      { self.dense }
    pub fn coord_type(&self)  -> CoordType { self.coord_type }
    pub fn dim_num(&self)     -> usize     { self.dim_num }
    pub fn is_frozen(&self)   -> bool      { self.frozen }
    pub fn tile_num(&self)    -> u64       { self.tile_offsets.first().map_or(0, |o| o.len() as u64) }
    pub fn last_tile_cell_num(&self) -> u64 { self.last_tile_cell_num }

    pub fn non_empty_domain(&self) -> Option<&CoordBuffer> { self.non_empty_domain.as_ref() }

    pub fn tile_offset(&self, attribute_id: AttributeId, tile: TileId) -> Option<u64> {
        self.tile_offsets.get(attribute_id)?.get(tile as usize).copied()
    }

    /// tile 的坐标包围盒
    pub fn mbr<T: Coordinate>(&self, tile: TileId) -> Result<&[T]> {
        let n = 2 * self.dim_num;
        let start = tile as usize * n;
        self.mbrs.typed::<T>()?
            .get(start..start + n)
            .ok_or_else(|| FragmentError::InvalidArgument(format!("tile {tile} has no MBR")))
    }

    /// tile 的首坐标与末坐标（全局单元格序）
    pub fn bounding_coords<T: Coordinate>(&self, tile: TileId) -> Result<(&[T], &[T])> {
        let n = 2 * self.dim_num;
        let start = tile as usize * n;
        let bc = self.bounding_coords.typed::<T>()?
            .get(start..start + n)
            .ok_or_else(|| FragmentError::InvalidArgument(format!("tile {tile} has no bounding coords")))?;
        Ok(bc.split_at(self.dim_num))
    }

    pub fn cell_num_in_tile(&self, tile: TileId, cell_num_per_tile: u64) -> u64 {
        if tile + 1 == self.tile_num() { self.last_tile_cell_num } else { cell_num_per_tile }
    }

    /// fragment 中的总单元格数
    pub fn cell_num(&self, cell_num_per_tile: u64) -> u64 {
        match self.tile_num() {
            0 => 0,
            n => (n - 1) * cell_num_per_tile + self.last_tile_cell_num,
        }
    }

    // ── 持久化 ────────────────────────────────────────────────────────────────

    fn encode_payload(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u8(u8::from(self.dense))?;
        out.write_u8(self.coord_type.tag())?;
        out.write_u32::<LittleEndian>(self.dim_num as u32)?;
        out.write_u32::<LittleEndian>(self.attribute_num as u32)?;

        match &self.non_empty_domain {
            Some(domain) => {
                out.write_u8(1)?;
                domain.encode(&mut out)?;
            }
            None => out.write_u8(0)?,
        }

        out.write_u64::<LittleEndian>(self.tile_num())?;
        self.mbrs.encode(&mut out)?;
        out.write_u64::<LittleEndian>(self.bounding_coords.len() as u64)?;
        self.bounding_coords.encode(&mut out)?;

        for offsets in &self.tile_offsets {
            out.write_u64::<LittleEndian>(offsets.len() as u64)?;
            for &off in offsets {
                out.write_u64::<LittleEndian>(off)?;
            }
        }
        out.write_u64::<LittleEndian>(self.last_tile_cell_num)?;
        Ok(out)
    }

    fn decode_payload(data: &[u8]) -> io::Result<Self> {
        let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        let mut r = Cursor::new(data);

        let dense = r.read_u8()? != 0;
        let coord_type = CoordType::from_tag(r.read_u8()?).ok_or_else(|| bad("unknown coordinate type"))?;
        let dim_num = r.read_u32::<LittleEndian>()? as usize;
        let attribute_num = r.read_u32::<LittleEndian>()? as usize;

        let non_empty_domain = match r.read_u8()? {
            0 => None,
            _ => Some(CoordBuffer::decode(coord_type, 2 * dim_num, &mut r)?),
        };

        let tile_num = r.read_u64::<LittleEndian>()? as usize;
        let mbrs = CoordBuffer::decode(coord_type, checked_len(tile_num, 2 * dim_num, data)?, &mut r)?;
        let bc_len = r.read_u64::<LittleEndian>()? as usize;
        let bounding_coords = CoordBuffer::decode(coord_type, checked_len(bc_len, 1, data)?, &mut r)?;

        let mut tile_offsets = Vec::with_capacity(attribute_num.min(data.len()));
        for _ in 0..attribute_num {
            let n = r.read_u64::<LittleEndian>()? as usize;
            let mut offsets = Vec::with_capacity(checked_len(n, 1, data)?);
            for _ in 0..n {
                offsets.push(r.read_u64::<LittleEndian>()?);
            }
            tile_offsets.push(offsets);
        }
        let last_tile_cell_num = r.read_u64::<LittleEndian>()?;

        if r.read(&mut [0u8; 1])? != 0 {
            return Err(bad("trailing bytes after payload"));
        }
        Ok(Self {
            dense, coord_type, dim_num, attribute_num, non_empty_domain,
            mbrs, bounding_coords, tile_offsets, last_tile_cell_num,
            frozen: true,
        })
    }

    pub fn serialize(&self, codec: CompressionType) -> Result<Vec<u8>> {
        let raw = self.encode_payload()
            .map_err(|e| FragmentError::Corrupted(e.to_string()))?;
        let body = compression::compress(&raw, codec)?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + FOOTER_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push(codec.tag());
        out.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(MAGIC);
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let corrupted = |msg: &str| FragmentError::Corrupted(msg.to_string());
        let n = data.len();
        if n < HEADER_LEN + FOOTER_LEN || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
            return Err(corrupted("invalid book-keeping magic"));
        }
        let mut header = Cursor::new(&data[8..HEADER_LEN]);
        let version  = header.read_u32::<LittleEndian>().map_err(|e| corrupted(&e.to_string()))?;
        let codec    = header.read_u8().map_err(|e| corrupted(&e.to_string()))?;
        let raw_len  = header.read_u64::<LittleEndian>().map_err(|e| corrupted(&e.to_string()))?;
        if version != VERSION {
            return Err(corrupted(&format!("unsupported book-keeping version {version}")));
        }
        let codec = CompressionType::from_tag(codec).ok_or_else(|| corrupted("unknown codec"))?;

        let mut footer = Cursor::new(&data[n - FOOTER_LEN..n - 8]);
        let crc      = footer.read_u32::<LittleEndian>().map_err(|e| corrupted(&e.to_string()))?;
        let body_len = footer.read_u64::<LittleEndian>().map_err(|e| corrupted(&e.to_string()))? as usize;
        if body_len != n - HEADER_LEN - FOOTER_LEN {
            return Err(corrupted("payload length mismatch"));
        }
        let body = &data[HEADER_LEN..HEADER_LEN + body_len];
        if crc32fast::hash(body) != crc {
            return Err(FragmentError::ChecksumMismatch);
        }

        let raw = compression::decompress(body, codec, raw_len as usize)?;
        Self::decode_payload(&raw).map_err(|e| corrupted(&e.to_string()))
    }

    /// 写入存储并 fsync；之后不可再修改
    pub fn flush(
        &mut self,
        storage: &dyn StorageBackend,
        path:    &Path,
        codec:   CompressionType,
    ) -> Result<()> {
        let bytes = self.serialize(codec)?;
        storage.write_file(path, &bytes).map_err(|e| FragmentError::io(path, e))?;
        storage.sync(path).map_err(|e| FragmentError::io(path, e))?;
        self.frozen = true;
        debug!(path = %path.display(), tiles = self.tile_num(), bytes = bytes.len(), "book-keeping flushed");
        Ok(())
    }

    pub fn load(storage: &dyn StorageBackend, path: &Path) -> Result<Self> {
        let bytes = storage.read_file(path).map_err(|e| FragmentError::io(path, e))?;
        let bk = Self::deserialize(&bytes)?;
        debug!(path = %path.display(), tiles = bk.tile_num(), "book-keeping loaded");
        Ok(bk)
    }
}

/// 防止损坏的长度字段触发超大分配
fn checked_len(count: usize, width: usize, data: &[u8]) -> io::Result<usize> {
    count.checked_mul(width)
        .filter(|&len| len <= data.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "length field exceeds payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use crate::storage::LocalStorage;
    use tempfile::tempdir;

    fn sparse_bk() -> BookKeeping {
        let schema = ArraySchema::sparse(
            "s", &["x", "y"], CoordBuffer::Int32(vec![0, 99, 0, 99]), 4,
            vec![Attribute::new("v", 4)],
        );
        let mut bk = BookKeeping::new(&schema);
        for (tile, off) in [(0u64, 0u64), (1, 16)] {
            bk.append_tile_offset(0, off).unwrap();
            bk.append_tile_offset(1, off * 2).unwrap();
            let t = tile as i32 * 10;
            bk.append_mbr(&[t, t + 5, 0, 9]).unwrap();
            bk.append_bounding_coords(&[t, 0], &[t + 5, 9]).unwrap();
        }
        bk.set_last_tile_cell_num(3).unwrap();
        bk.set_non_empty_domain(Some(CoordBuffer::Int32(vec![0, 15, 0, 9]))).unwrap();
        bk
    }

    #[test]
    fn test_accessors() {
        let bk = sparse_bk();
        assert_eq!(bk.tile_num(), 2);
        assert_eq!(bk.mbr::<i32>(1).unwrap(), &[10, 15, 0, 9]);
        let (first, last) = bk.bounding_coords::<i32>(1).unwrap();
        assert_eq!((first, last), (&[10, 0][..], &[15, 9][..]));
        assert_eq!(bk.tile_offset(1, 1), Some(32));
        assert_eq!(bk.cell_num_in_tile(0, 4), 4);
        assert_eq!(bk.cell_num(4), 7);
        assert!(bk.mbr::<i32>(2).is_err());
        assert!(bk.mbr::<i64>(0).is_err());
    }

    #[test]
    fn test_persisted_form_survives_both_codecs() {
        let bk = sparse_bk();
        for codec in [CompressionType::None, CompressionType::Lz4] {
            let bytes = bk.serialize(codec).unwrap();
            let loaded = BookKeeping::deserialize(&bytes).unwrap();
            assert!(loaded.is_frozen());
            assert_eq!(loaded.mbrs, bk.mbrs);
            assert_eq!(loaded.tile_offsets, bk.tile_offsets);
            assert_eq!(loaded.non_empty_domain(), bk.non_empty_domain());
            assert_eq!(loaded.last_tile_cell_num(), 3);
        }
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sparse_bk().serialize(CompressionType::None).unwrap();
        bytes[HEADER_LEN + 3] ^= 0xff;
        assert!(matches!(BookKeeping::deserialize(&bytes), Err(FragmentError::ChecksumMismatch)));
        assert!(matches!(BookKeeping::deserialize(&bytes[..10]), Err(FragmentError::Corrupted(_))));
    }

    #[test]
    fn test_frozen_after_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bk");
        let mut bk = sparse_bk();
        bk.flush(&LocalStorage, &path, CompressionType::Lz4).unwrap();
        assert!(matches!(
            bk.append_tile_offset(0, 99),
            Err(FragmentError::InvalidState { .. })
        ));
        let mut loaded = BookKeeping::load(&LocalStorage, &path).unwrap();
        assert_eq!(loaded.tile_num(), 2);
        assert!(loaded.set_last_tile_cell_num(1).is_err());
    }
}
