//! # array-fragment 使用案例
//!
//! 1. 写入一个 dense fragment（8×8，4×4 tile）并发布
//! 2. 按子区域读取，演示 tile 剪枝与溢出后续读
//! 3. 写入一个 sparse fragment，解析位置段并查询坐标
//! 4. 多 fragment 位置段归并

use array_fragment::coords::coords_to_bytes;
use array_fragment::merge::merge_by_position;
use array_fragment::{
    Array, ArraySchema, Attribute, CoordBuffer, Fragment, LocalStorage, QueryMode, Result,
};

fn decode(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let root = std::env::temp_dir().join(format!("array-fragment-demo-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);

    println!("═══════════════════════════════════════════════════════════");
    println!("   array-fragment 演示                                      ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. Dense 写入
    // =========================================================================
    println!("【1】写入 dense fragment `d1` ...");
    let dense = ArraySchema::dense(
        "grid", &["row", "col"],
        CoordBuffer::Int64(vec![0, 7, 0, 7]),
        CoordBuffer::Int64(vec![4, 4]),
        vec![Attribute::new("v", 4)],
    );
    let dense_dir = root.join("grid");

    let writer = Array::new(dense.clone(), &dense_dir, LocalStorage, QueryMode::Write)?;
    let mut frag = Fragment::new(&writer);
    frag.init("d1", writer.range())?;
    // 按全局单元格序（tile 间 row-major，tile 内 row-major）给出 row*8+col
    let mut values = Vec::with_capacity(64 * 4);
    for tile in 0..4i64 {
        for r in 0..4 {
            for c in 0..4 {
                let (row, col) = ((tile / 2) * 4 + r, (tile % 2) * 4 + c);
                values.extend_from_slice(&((row * 8 + col) as u32).to_le_bytes());
            }
        }
    }
    frag.write(&[&values], &[values.len()])?;
    frag.finalize()?;
    println!("    ✓ 发布为 {}，tile 数 = {}\n", frag.fragment_name(), frag.book_keeping().tile_num());

    // =========================================================================
    // 2. Dense 读取
    // =========================================================================
    println!("【2】读取子区域 [2,5]×[2,5]，每次只给 5 个单元格的缓冲区 ...");
    let reader = Array::new(dense, &dense_dir, LocalStorage, QueryMode::Read)?
        .with_range(CoordBuffer::Int64(vec![2, 5, 2, 5]))?;
    let mut frag = Fragment::new(&reader);
    frag.init("d1", reader.range())?;

    let mut buf = vec![0u8; 5 * 4];
    let mut sizes = [0usize];
    loop {
        frag.read(&mut [&mut buf[..]], &mut sizes)?;
        if sizes[0] == 0 {
            break;
        }
        println!("    {:?}  overflow={}", decode(&buf[..sizes[0]]), frag.overflow(0));
    }
    frag.finalize()?;
    println!();

    // =========================================================================
    // 3. Sparse 写入与位置段
    // =========================================================================
    println!("【3】写入 sparse fragment `s1`（capacity = 3）...");
    let sparse = ArraySchema::sparse(
        "points", &["x", "y"],
        CoordBuffer::Int32(vec![0, 99, 0, 99]), 3,
        vec![Attribute::new("v", 4)],
    );
    let sparse_dir = root.join("points");
    let writer = Array::new(sparse.clone(), &sparse_dir, LocalStorage, QueryMode::Write)?;
    let mut frag = Fragment::new(&writer);
    frag.init("s1", writer.range())?;
    let points: [i32; 14] = [1, 1, 1, 8, 2, 3, 3, 3, 4, 7, 6, 2, 9, 9];
    let coords = coords_to_bytes(&points);
    let vals: Vec<u8> = (1..=7u32).flat_map(|v| v.to_le_bytes()).collect();
    frag.write(&[&vals, &coords], &[vals.len(), coords.len()])?;
    frag.finalize()?;

    let reader = Array::new(sparse, &sparse_dir, LocalStorage, QueryMode::Read)?;
    let mut frag = Fragment::new(&reader);
    frag.init("s1", reader.range())?;
    let mut ranges = Vec::new();
    frag.get_cell_pos_ranges_sparse::<i32>(0, &[0, 99, 0, 99], &[1, 4, 0, 5], &mut ranges)?;
    for r in &ranges {
        println!("    fragment {} → 位置 {}", r.fragment_id, r.range);
    }
    println!("    (3,3) 存在: {}", frag.coords_exist::<i32>(&[3, 3])?);
    println!("    (3,4) 存在: {}", frag.coords_exist::<i32>(&[3, 4])?);
    let (a, b) = frag.get_first_two_coords::<i32>(&[2, 0])?;
    println!("    (2,0) 之后的两个坐标: {a:?} {b:?}\n");

    // =========================================================================
    // 4. 多 fragment 归并
    // =========================================================================
    println!("【4】归并两个 fragment 的位置段 ...");
    let mut other = ranges.clone();
    for r in &mut other {
        r.fragment_id = 1;
        r.range.start += 100;
        r.range.end += 100;
    }
    for r in merge_by_position(vec![ranges, other])? {
        println!("    fragment {} → {}", r.fragment_id, r.range);
    }

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
