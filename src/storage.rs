//! 后端存储接口
//!
//! Fragment 只通过 [`StorageBackend`] 读写字节与发布目录；具体介质不在本层关心。
//! 默认实现 [`LocalStorage`] 直接落在本地文件系统上。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait StorageBackend {
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// 追加写入，返回本次数据在文件中的起始偏移
    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64>;

    /// 覆盖文件中 `offset` 起的已有字节
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;

    /// 整体写入（覆盖）
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// 将文件（或目录）内容持久化
    fn sync(&self, path: &Path) -> io::Result<()>;

    /// 原子改名；目标已存在时必须失败，不得覆盖
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

// ── LocalStorage ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl StorageBackend for LocalStorage {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = file.metadata()?.len();
        file.write_all(data)?;
        Ok(offset)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        if offset + data.len() as u64 > file.metadata()?.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write past end of {}", path.display()),
            ));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(data)?;
        file.flush()
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn sync(&self, path: &Path) -> io::Result<()> {
        // 目录在 unix 上也可以打开后 fsync
        File::open(path)?.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if to.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            ));
        }
        fs::rename(from, to)?;
        // 改名本身要落盘才算发布完成
        #[cfg(unix)]
        {
            if let Some(parent) = to.parent() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_returns_offsets() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.tdb");
        let s = LocalStorage;
        assert_eq!(s.append(&path, b"abcd").unwrap(), 0);
        assert_eq!(s.append(&path, b"efg").unwrap(), 4);
        assert_eq!(s.file_size(&path).unwrap(), 7);

        let mut buf = [0u8; 3];
        s.read_at(&path, 3, &mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn test_write_at_overwrites_in_place() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a.tdb");
        let s = LocalStorage;
        s.append(&path, b"abcdef").unwrap();
        s.write_at(&path, 2, b"XY").unwrap();
        assert_eq!(s.read_file(&path).unwrap(), b"abXYef");
        assert!(s.write_at(&path, 5, b"XY").is_err());
        assert_eq!(s.file_size(&path).unwrap(), 6);
    }

    #[test]
    fn test_rename_refuses_to_clobber() {
        let dir = tempdir().expect("tempdir");
        let s = LocalStorage;
        let from = dir.path().join(".frag");
        let to   = dir.path().join("frag");
        s.create_dir(&from).unwrap();
        s.create_dir(&to).unwrap();

        let err = s.rename(&from, &to).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(s.exists(&from));

        fs::remove_dir(&to).unwrap();
        s.rename(&from, &to).unwrap();
        assert!(!s.exists(&from));
        assert!(s.exists(&to));
    }
}
