//! 概率图精化: 形状先验调整与连通性调整.
//!
//! 两种调整相互独立, 作用时机不同: 形状先验调整用于传播阶段
//! (参照相邻切片已有的分割), 连通性调整仅用于起始切片
//! (参照用户的显式前景涂鸦).

use std::collections::VecDeque;

use itertools::izip;
use ndarray::{Array2, ArrayView2};
use num::Float;

use crate::consts::{
    mask, seed, CONNECT_STD_LOWER, CONNECT_STD_UPPER, INSIDE_BOOST, INSIDE_PROB_THRESHOLD,
    OUTSIDE_DAMP, OUTSIDE_PROB_THRESHOLD,
};
use crate::morph;

/// 形状先验调整.
///
/// 以迭代腐蚀深度图量化 "深入先验掩码内部的程度":
///
/// - 掩码之外 (`depth == 0`) 且概率超过 0.5 的像素乘以 0.4,
///   抑制越出已知先验形状的过度外推;
/// - 掩码之内 (`depth > 0`) 且概率低于 0.8 的像素加上
///   `0.2 * depth / maxdepth`, 按深度比例偏向先验内部.
///
/// 输入概率在 `[0, 1]` 时, 输出仍保证在 `[0, 1]`.
pub fn shape_prior_adjust(prob: &mut Array2<f64>, prior: ArrayView2<u8>) {
    debug_assert_eq!(prob.dim(), prior.dim());

    let (depth, maxdis) = morph::erosion_depth(prior);
    if maxdis == 0 {
        return;
    }

    for (p, &dis) in izip!(prob.iter_mut(), depth.iter()) {
        if dis == 0 {
            if *p > OUTSIDE_PROB_THRESHOLD {
                *p *= OUTSIDE_DAMP;
            }
        } else if *p < INSIDE_PROB_THRESHOLD {
            *p = (*p + INSIDE_BOOST * dis as f64 / maxdis as f64).min(1.0);
        }
    }
}

/// 连通性调整 (仅起始切片).
///
/// 先将原始概率在 0.5 处阈值化并闭运算得到宽容掩码, 然后从前景硬约束
/// 像素出发做 8-连通 BFS; 只有落在宽容掩码内、且强度处于种子强度分布的
/// 非对称容忍带 `[mean - 3 std, mean + 2 std]` 内的邻居才会被接纳.
/// 所有从未被触达的像素概率乘以 0.4: 高概率区域必须能经由
/// "强度合理、掩码一致" 的通路连接到显式前景证据, 以抑制空间上
/// 断开的假阳性.
pub fn connectivity_adjust(prob: &mut Array2<f64>, slice: ArrayView2<f32>, seeds: ArrayView2<u8>) {
    debug_assert_eq!(prob.dim(), slice.dim());
    debug_assert_eq!(prob.dim(), seeds.dim());

    let fg_seeds: Vec<_> = seeds
        .indexed_iter()
        .filter_map(|(pos, &p)| seed::is_foreground(p).then_some(pos))
        .collect();
    if fg_seeds.is_empty() {
        return;
    }

    let (mean, std) = mean_std(fg_seeds.iter().map(|&pos| slice[pos] as f64));
    let band = (mean - CONNECT_STD_LOWER * std)..=(mean + CONNECT_STD_UPPER * std);

    // 宽容掩码: 阈值化 + 闭运算.
    let thresholded = prob.mapv(|p| u8::from(p >= OUTSIDE_PROB_THRESHOLD));
    let permissive = morph::close(thresholded.view(), 2);

    let mut reached = Array2::<u8>::zeros(prob.dim());
    let mut queue: VecDeque<_> = fg_seeds.into_iter().collect();
    for &pos in queue.iter() {
        reached[pos] = 1;
    }
    while let Some(cur) = queue.pop_front() {
        for neigh in morph::neighbour8(cur) {
            let Some(&r) = reached.get(neigh) else {
                continue;
            };
            if r != 0 || mask::is_background(permissive[neigh]) {
                continue;
            }
            if !band.contains(&(slice[neigh] as f64)) {
                continue;
            }
            reached[neigh] = 1;
            queue.push_back(neigh);
        }
    }

    for (p, &r) in izip!(prob.iter_mut(), reached.iter()) {
        if r == 0 {
            *p *= OUTSIDE_DAMP;
        }
    }
}

/// 均值与总体标准差.
fn mean_std<F: Float, I: IntoIterator<Item = F>>(vals: I) -> (F, F) {
    let mut n = F::zero();
    let mut sum = F::zero();
    let mut sum2 = F::zero();
    for v in vals {
        n = n + F::one();
        sum = sum + v;
        sum2 = sum2 + v * v;
    }
    if n.is_zero() {
        return (F::zero(), F::zero());
    }
    let mean = sum / n;
    let var = (sum2 / n - mean * mean).max(F::zero());
    (mean, var.sqrt())
}
