//! 端到端演示: 在合成体数据上完成涂鸦、起始分割与双向传播.
//!
//! ```bash
//! cargo run --example propagate_demo
//! ```

use ct_propseg::prelude::*;
use ndarray::{s, Array2, Array3};

/// 60 张 128x128 切片, 第 10..=49 张带一个中心亮椭球 (近似目标器官).
fn synthetic_volume() -> Array3<f32> {
    let mut scan = Array3::<f32>::zeros((60, 128, 128));
    for ((z, h, w), v) in scan.indexed_iter_mut() {
        let dz = (z as f64 - 30.0) / 20.0;
        let dh = (h as f64 - 64.0) / 30.0;
        let dw = (w as f64 - 64.0) / 36.0;
        if dz * dz + dh * dh + dw * dw <= 1.0 {
            *v = 120.0;
        }
    }
    scan
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()
        .unwrap();

    let mut engine = PropagationEngine::new();
    engine.set_volume(synthetic_volume());
    engine.set_start_index(30);

    // 中心 12x12 前景涂鸦 + 图像边框一圈背景涂鸦.
    let mut labels = Array2::<u8>::zeros((128, 128));
    labels.slice_mut(s![58..70, 58..70]).fill(SEED_FOREGROUND);
    labels.row_mut(0).fill(SEED_BACKGROUND);
    labels.row_mut(127).fill(SEED_BACKGROUND);
    labels.column_mut(0).fill(SEED_BACKGROUND);
    labels.column_mut(127).fill(SEED_BACKGROUND);
    engine.set_seed_slice(30, &labels).unwrap();

    engine.on_progress(|index| println!("切片 {index} 完成"));
    engine.run_segmentation().unwrap();

    let seg = engine.seg_image().unwrap();
    let total: usize = seg.iter().map(|&p| p as usize).sum();
    println!("前景体素总数: {total}");
}
