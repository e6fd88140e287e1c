//! 带硬约束的能量最小化 (一元项 + 成对项).

use ndarray::{Array2, ArrayView2};

use crate::consts::{mask, seed};
use crate::error::CollabError;

/// 能量最小化器契约.
///
/// 给定强度切片、三值硬约束标签 (`{0, 127, 255}`)、前景概率先验
/// 以及两个标量权重, 返回最小化 "一元 + 成对" 能量的二值掩码.
/// 对相同输入必须产生相同输出 (确定性).
pub trait MinimizeEnergy {
    /// 求解二值分割掩码.
    ///
    /// - `lambda`: 一元项 / 成对项的权衡系数 (成对项权重).
    /// - `sigma`: 相邻像素强度差的敏感度.
    ///
    /// 硬约束像素在输出中必须保持其约束值.
    fn minimize(
        &self,
        image: ArrayView2<f32>,
        hard: ArrayView2<u8>,
        prior: ArrayView2<f64>,
        lambda: f64,
        sigma: f64,
    ) -> Result<Array2<u8>, CollabError>;
}

/// 内置最小化器: 迭代条件模式 (ICM).
///
/// 能量定义为 `E = sum_p U(p, l_p) + lambda * sum_{pq} w(p, q) * [l_p != l_q]`,
/// 其中一元项 `U` 取先验概率的负对数, 成对项权重
/// `w = exp(-(I_p - I_q)^2 / (2 sigma^2))` 取 4-邻接.
/// 以栅格顺序做固定轮数的坐标下降, 硬约束像素始终钉死, 结果确定.
#[derive(Copy, Clone, Debug)]
pub struct IcmMinimizer {
    /// 扫描轮数.
    pub sweeps: usize,
}

impl Default for IcmMinimizer {
    #[inline]
    fn default() -> Self {
        Self { sweeps: 8 }
    }
}

impl IcmMinimizer {
    /// 某像素取给定标签时的一元代价.
    #[inline]
    fn unary(prior: f64, label: u8) -> f64 {
        const EPS: f64 = 1e-6;
        let p = prior.clamp(EPS, 1.0 - EPS);
        if mask::is_foreground(label) {
            -p.ln()
        } else {
            -(1.0 - p).ln()
        }
    }
}

impl MinimizeEnergy for IcmMinimizer {
    fn minimize(
        &self,
        image: ArrayView2<f32>,
        hard: ArrayView2<u8>,
        prior: ArrayView2<f64>,
        lambda: f64,
        sigma: f64,
    ) -> Result<Array2<u8>, CollabError> {
        assert_eq!(image.dim(), hard.dim());
        assert_eq!(image.dim(), prior.dim());
        let (h, w) = image.dim();

        // 初始标签: 硬约束优先, 其余按先验概率阈值.
        let mut labels = Array2::<u8>::zeros((h, w));
        for (pos, l) in labels.indexed_iter_mut() {
            *l = if seed::is_foreground(hard[pos]) {
                mask::MASK_FOREGROUND
            } else if seed::is_background(hard[pos]) {
                mask::MASK_BACKGROUND
            } else if prior[pos] >= 0.5 {
                mask::MASK_FOREGROUND
            } else {
                mask::MASK_BACKGROUND
            };
        }

        let two_sigma2 = 2.0 * sigma * sigma;
        let weight = |a: f64, b: f64| -> f64 {
            let d = a - b;
            (-d * d / two_sigma2).exp()
        };

        for _ in 0..self.sweeps {
            let mut changed = false;
            for ph in 0..h {
                for pw in 0..w {
                    if seed::is_labeled(hard[(ph, pw)]) {
                        continue;
                    }
                    let ip = image[(ph, pw)] as f64;

                    // 两种标签下的局部能量.
                    let mut cost_fg = Self::unary(prior[(ph, pw)], mask::MASK_FOREGROUND);
                    let mut cost_bg = Self::unary(prior[(ph, pw)], mask::MASK_BACKGROUND);
                    for (nh, nw) in [
                        (ph.wrapping_sub(1), pw),
                        (ph + 1, pw),
                        (ph, pw.wrapping_sub(1)),
                        (ph, pw + 1),
                    ] {
                        let Some(&nl) = labels.get((nh, nw)) else {
                            continue;
                        };
                        let pen = lambda * weight(ip, image[(nh, nw)] as f64);
                        if mask::is_foreground(nl) {
                            cost_bg += pen;
                        } else {
                            cost_fg += pen;
                        }
                    }

                    let new_label = if cost_fg <= cost_bg {
                        mask::MASK_FOREGROUND
                    } else {
                        mask::MASK_BACKGROUND
                    };
                    if new_label != labels[(ph, pw)] {
                        labels[(ph, pw)] = new_label;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok(labels)
    }
}
