//! 由先验分割掩码派生硬约束标签与训练标签.

use itertools::izip;
use ndarray::{Array2, ArrayView2};

use crate::consts::{mask, seed, MIN_ERODED_SEED};
use crate::morph;

/// 一次派生同时产出的两张三值标签图.
#[derive(Clone, Debug)]
pub struct DerivedLabels {
    /// 稠密硬约束标签: 前景 = 骨架, 背景 = 近膨胀之外的全部区域.
    /// 供能量最小化器作硬约束使用.
    pub seed: Array2<u8>,

    /// 稀疏训练标签: 前景 = 骨架, 背景 = 两次膨胀之间的细环带.
    /// 供分类器增量训练使用.
    pub train: Array2<u8>,
}

/// 由先验二值掩码派生标签.
///
/// - 前景: 先以半径 `fgr` 腐蚀掩码; 若腐蚀后存活像素过少
///   (细长结构会被腐蚀殆尽), 回退为对完整掩码取骨架;
///   否则取腐蚀结果的骨架 (细化种子, 避免过度约束优化器).
/// - 背景: 分别以 `bgr` 和 `bgr + 1` 膨胀掩码. 稠密标签的背景为
///   `bgr`-膨胀之外的全部区域; 稀疏标签的背景为两次膨胀的差集环带
///   (紧贴目标外侧的一圈).
///
/// 输出像素值只会是 `{0, 127, 255}` 三种.
pub fn derive_labels(prior: ArrayView2<u8>, fgr: usize, bgr: usize) -> DerivedLabels {
    let eroded = morph::erode(prior, fgr);
    let skeleton = if morph::count_foreground(eroded.view()) < MIN_ERODED_SEED {
        morph::skeletonize(prior)
    } else {
        morph::skeletonize(eroded.view())
    };

    let near = morph::dilate(prior, bgr);
    let far = morph::dilate(prior, bgr + 1);

    let dim = prior.dim();
    let mut seed_label = Array2::<u8>::zeros(dim);
    let mut train_label = Array2::<u8>::zeros(dim);

    for ((pos, s), t, &n, &f) in izip!(
        seed_label.indexed_iter_mut(),
        train_label.iter_mut(),
        near.iter(),
        far.iter()
    ) {
        if mask::is_foreground(skeleton[pos]) {
            *s = seed::SEED_FOREGROUND;
            *t = seed::SEED_FOREGROUND;
            continue;
        }
        if mask::is_background(n) {
            // 近膨胀之外: 稠密背景; 其中落在远膨胀之内的是环带.
            *s = seed::SEED_BACKGROUND;
            if mask::is_foreground(f) {
                *t = seed::SEED_BACKGROUND;
            }
        }
    }

    DerivedLabels {
        seed: seed_label,
        train: train_label,
    }
}
