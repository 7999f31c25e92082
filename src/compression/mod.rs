//! 压缩/解压（LZ4 / None），用于 book-keeping 持久化

use crate::common::{FragmentError, Result};
use crate::config::CompressionType;

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| FragmentError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  => {
            let len = i32::try_from(uncompressed_len)
                .map_err(|_| FragmentError::Compression(format!("payload too large: {uncompressed_len}")))?;
            lz4::block::decompress(data, Some(len))
                .map_err(|e| FragmentError::Compression(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_restores_payload() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&data, CompressionType::Lz4).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, CompressionType::Lz4, data.len()).unwrap(), data);
    }

    #[test]
    fn test_corrupt_lz4_is_reported() {
        let err = decompress(&[0xff, 0xff, 0xff], CompressionType::Lz4, 1024).unwrap_err();
        assert!(matches!(err, FragmentError::Compression(_)));
    }
}
