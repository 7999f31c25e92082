//! finalize 的原子发布：任何前置步骤失败都不能出现稳定名目录

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use array_fragment::coords::coords_to_bytes;
use array_fragment::{
    Array, ArraySchema, Attribute, CoordBuffer, CompressionType, Fragment, FragmentConfig,
    FragmentError, LocalStorage, QueryMode, StorageBackend,
};

fn schema() -> ArraySchema {
    ArraySchema::sparse(
        "events", &["t"], CoordBuffer::Int64(vec![0, 1_000]), 2,
        vec![Attribute::new("kind", 1)],
    )
}

fn write_three(frag: &mut Fragment<'_>) -> array_fragment::Result<()> {
    let coords = coords_to_bytes::<i64>(&[1, 5, 9]);
    frag.write(&[&[7u8, 8, 9][..], &coords], &[3, coords.len()])
}

/// 在指定文件名上注入写失败（可开关），并按顺序记录 sync 与 rename
#[derive(Clone)]
struct FaultyStorage {
    inner:     LocalStorage,
    fail_file: &'static str,
    armed:     Arc<AtomicBool>,
    events:    Arc<Mutex<Vec<String>>>,
}

impl FaultyStorage {
    fn new(fail_file: &'static str) -> Self {
        Self {
            inner: LocalStorage,
            fail_file,
            armed: Arc::new(AtomicBool::new(true)),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn check(&self, path: &Path) -> io::Result<()> {
        if self.armed.load(Ordering::SeqCst) && path.file_name().is_some_and(|n| n == self.fail_file) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected failure"));
        }
        Ok(())
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn renames(&self) -> usize {
        self.events().iter().filter(|e| e.starts_with("rename")).count()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

impl StorageBackend for FaultyStorage {
    fn create_dir(&self, path: &Path) -> io::Result<()> { self.inner.create_dir(path) }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        self.check(path)?;
        self.inner.append(path, data)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check(path)?;
        self.inner.write_at(path, offset, data)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.check(path)?;
        self.inner.write_file(path, data)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_at(path, offset, buf)
    }
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> { self.inner.read_file(path) }
    fn file_size(&self, path: &Path) -> io::Result<u64>   { self.inner.file_size(path) }

    fn sync(&self, path: &Path) -> io::Result<()> {
        self.record(format!("sync {}", file_name(path)));
        self.inner.sync(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.record(format!("rename {}", file_name(from)));
        self.inner.rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool { self.inner.exists(path) }
}

fn read_kinds(dir: &Path) -> Vec<u8> {
    let reader = Array::new(schema(), dir, LocalStorage, QueryMode::Read).unwrap();
    let mut frag = Fragment::new(&reader);
    frag.init("e1", reader.range()).unwrap();
    let mut kinds = [0u8; 8];
    let mut coords = [0u8; 64];
    let mut sizes = [kinds.len(), coords.len()];
    frag.read(&mut [&mut kinds[..], &mut coords[..]], &mut sizes).unwrap();
    kinds[..sizes[0]].to_vec()
}

#[test]
fn publish_moves_temp_dir_to_stable_name() {
    let dir = tempfile::tempdir().unwrap();
    let array = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();
    assert!(dir.path().join(".e1").is_dir());
    assert!(!frag.is_published());

    write_three(&mut frag).unwrap();
    frag.finalize().unwrap();

    let stable = dir.path().join("e1");
    assert!(!dir.path().join(".e1").exists());
    assert!(stable.join("__book_keeping.tdb").is_file());
    assert!(stable.join("kind.tdb").is_file());
    assert!(stable.join("__coords.tdb").is_file());
    assert_eq!(frag.fragment_name(), "e1");
}

#[test]
fn name_collision_keeps_fragment_uncommitted_until_retry() {
    let dir = tempfile::tempdir().unwrap();
    let array = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();
    write_three(&mut frag).unwrap();

    // 别的写者先占用了稳定名
    std::fs::create_dir(dir.path().join("e1")).unwrap();
    assert!(matches!(frag.finalize(), Err(FragmentError::Publish { ref name, .. }) if name == "e1"));

    assert!(!frag.is_published());
    assert_eq!(frag.fragment_name(), ".e1");
    assert!(frag.book_keeping().is_frozen());
    assert!(dir.path().join(".e1").join("__book_keeping.tdb").is_file());
    assert!(!dir.path().join("e1").join("__book_keeping.tdb").exists());
    assert!(matches!(
        write_three(&mut frag),
        Err(FragmentError::InvalidState { op: "write", state: "finalizing" })
    ));

    // 未发布的 fragment 不能以稳定名读取
    let reader = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Read).unwrap();
    let mut r = Fragment::new(&reader);
    assert!(r.init("e1", reader.range()).is_err());
    let mut r = Fragment::new(&reader);
    assert!(matches!(r.init(".e1", reader.range()), Err(FragmentError::Init(_))));

    // 冲突解除后重试发布
    std::fs::remove_dir(dir.path().join("e1")).unwrap();
    frag.finalize().unwrap();
    assert!(frag.is_published());
    assert_eq!(frag.fragment_name(), "e1");
    assert!(!dir.path().join(".e1").exists());
    assert_eq!(read_kinds(dir.path()), vec![7, 8, 9]);
    assert!(matches!(frag.finalize(), Err(FragmentError::InvalidState { state: "finalized", .. })));
}

#[test]
fn existing_fragment_name_rejected_at_init() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("e1")).unwrap();
    let array = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    assert!(matches!(frag.init("e1", array.range()), Err(FragmentError::Init(_))));
}

#[test]
fn tiles_and_book_keeping_synced_before_rename() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FaultyStorage::new("nothing");
    let array = Array::new(schema(), dir.path(), storage.clone(), QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();
    write_three(&mut frag).unwrap();
    frag.finalize().unwrap();

    let events = storage.events();
    let at = |e: &str| events.iter().position(|x| x == e).unwrap_or_else(|| panic!("missing {e}: {events:?}"));
    let rename = at("rename .e1");
    assert!(at("sync kind.tdb") < rename);
    assert!(at("sync __coords.tdb") < rename);
    assert!(at("sync __book_keeping.tdb") < rename);
    assert!(at("sync kind.tdb") < at("sync __book_keeping.tdb"));
    assert!(at("sync .e1") < rename);
}

#[test]
fn failed_book_keeping_write_never_renames_and_can_retry() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FaultyStorage::new("__book_keeping.tdb");
    let array = Array::new(schema(), dir.path(), storage.clone(), QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();
    write_three(&mut frag).unwrap();

    assert!(matches!(frag.finalize(), Err(FragmentError::Io { .. })));
    assert_eq!(storage.renames(), 0);
    assert!(!dir.path().join("e1").exists());
    assert!(!frag.is_published());
    assert!(!frag.book_keeping().is_frozen());

    // 再次失败也不会重复刷出 tile
    assert!(matches!(frag.finalize(), Err(FragmentError::Io { .. })));
    assert_eq!(frag.book_keeping().tile_num(), 2);

    storage.armed.store(false, Ordering::SeqCst);
    frag.finalize().unwrap();
    assert_eq!(storage.renames(), 1);
    assert!(frag.is_published());
    assert_eq!(read_kinds(dir.path()), vec![7, 8, 9]);
}

#[test]
fn failed_tile_flush_surfaces_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FaultyStorage::new("kind.tdb");
    let array = Array::new(schema(), dir.path(), storage.clone(), QueryMode::Write).unwrap();
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();

    // 第二个单元格填满第一个 tile，刷盘失败
    assert!(matches!(write_three(&mut frag), Err(FragmentError::Io { .. })));
    assert_eq!(storage.renames(), 0);
    assert!(!dir.path().join("e1").exists());
}

#[test]
fn uncompressed_book_keeping_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = FragmentConfig::default().with_compression(CompressionType::None);
    let array = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Write)
        .unwrap()
        .with_config(config);
    let mut frag = Fragment::new(&array);
    frag.init("e1", array.range()).unwrap();
    write_three(&mut frag).unwrap();
    frag.finalize().unwrap();

    let reader = Array::new(schema(), dir.path(), LocalStorage, QueryMode::Read).unwrap();
    let mut r = Fragment::new(&reader);
    r.init("e1", reader.range()).unwrap();
    assert_eq!(r.book_keeping().tile_num(), 2);
    assert!(r.coords_exist::<i64>(&[9]).unwrap());
    assert!(!r.coords_exist::<i64>(&[2]).unwrap());
}
