//! 二值掩码上的 2D 形态学原语.
//!
//! 所有操作均以圆盘 (半径 `radius`, 含中心) 为结构元, 输入输出均为
//! `{0, 1}` 掩码. 图像边界之外一律视为背景.

use ndarray::{Array2, ArrayView2};

use crate::consts::mask::*;
use crate::Idx2d;

/// 获得 `(h, w)` 的 8-邻居索引. 不检查越界.
#[inline]
pub(crate) fn neighbour8((h, w): Idx2d) -> [Idx2d; 8] {
    [
        (h.wrapping_sub(1), w.wrapping_sub(1)),
        (h.wrapping_sub(1), w),
        (h.wrapping_sub(1), w.saturating_add(1)),
        (h, w.wrapping_sub(1)),
        (h, w.saturating_add(1)),
        (h.saturating_add(1), w.wrapping_sub(1)),
        (h.saturating_add(1), w),
        (h.saturating_add(1), w.saturating_add(1)),
    ]
}

/// 生成半径为 `radius` 的圆盘结构元的偏移集合 (包含圆心).
fn disk_offsets(radius: usize) -> Vec<(isize, isize)> {
    let r = radius as isize;
    let r2 = r * r;
    let mut ans = Vec::with_capacity((2 * radius + 1).pow(2));
    for dh in -r..=r {
        for dw in -r..=r {
            if dh * dh + dw * dw <= r2 {
                ans.push((dh, dw));
            }
        }
    }
    ans
}

/// 统计掩码中的前景像素个数.
#[inline]
pub fn count_foreground(mask: ArrayView2<u8>) -> usize {
    mask.iter().filter(|&&p| is_foreground(p)).count()
}

/// 圆盘腐蚀. 边界之外视为背景, 因此贴边的前景会被腐蚀掉.
pub fn erode(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    let (h, w) = mask.dim();
    let offsets = disk_offsets(radius);
    let mut ans = Array2::<u8>::zeros((h, w));

    for ((ph, pw), &pix) in mask.indexed_iter() {
        if is_background(pix) {
            continue;
        }
        let all_inside = offsets.iter().all(|&(dh, dw)| {
            let (nh, nw) = (ph as isize + dh, pw as isize + dw);
            nh >= 0
                && nw >= 0
                && (nh as usize) < h
                && (nw as usize) < w
                && is_foreground(mask[(nh as usize, nw as usize)])
        });
        if all_inside {
            ans[(ph, pw)] = MASK_FOREGROUND;
        }
    }
    ans
}

/// 圆盘膨胀.
pub fn dilate(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    let (h, w) = mask.dim();
    let offsets = disk_offsets(radius);
    let mut ans = Array2::<u8>::zeros((h, w));

    for ((ph, pw), &pix) in mask.indexed_iter() {
        if is_background(pix) {
            continue;
        }
        for &(dh, dw) in offsets.iter() {
            let (nh, nw) = (ph as isize + dh, pw as isize + dw);
            if nh >= 0 && nw >= 0 && (nh as usize) < h && (nw as usize) < w {
                ans[(nh as usize, nw as usize)] = MASK_FOREGROUND;
            }
        }
    }
    ans
}

/// 开运算 (先腐蚀后膨胀).
#[inline]
pub fn open(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    dilate(erode(mask, radius).view(), radius)
}

/// 闭运算 (先膨胀后腐蚀).
#[inline]
pub fn close(mask: ArrayView2<u8>, radius: usize) -> Array2<u8> {
    erode(dilate(mask, radius).view(), radius)
}

/// Zhang-Suen 细化骨架.
///
/// 迭代删除满足细化条件的边界像素, 直至不动点. 保证前景连通性;
/// 非空输入的骨架非空.
pub fn skeletonize(mask: ArrayView2<u8>) -> Array2<u8> {
    let mut cur = mask.to_owned();

    // p 的 8-邻域像素值, 按 p2..p9 顺时针排列 (北起).
    let at = |m: &Array2<u8>, h: isize, w: isize| -> u8 {
        if h < 0 || w < 0 {
            return MASK_BACKGROUND;
        }
        m.get((h as usize, w as usize)).copied().unwrap_or(MASK_BACKGROUND)
    };
    let ring = |m: &Array2<u8>, (ph, pw): Idx2d| -> [u8; 8] {
        let (h, w) = (ph as isize, pw as isize);
        [
            at(m, h - 1, w),
            at(m, h - 1, w + 1),
            at(m, h, w + 1),
            at(m, h + 1, w + 1),
            at(m, h + 1, w),
            at(m, h + 1, w - 1),
            at(m, h, w - 1),
            at(m, h - 1, w - 1),
        ]
    };

    loop {
        let mut changed = false;
        for step in 0..2u8 {
            let mut to_delete = Vec::new();
            for (pos, &pix) in cur.indexed_iter() {
                if is_background(pix) {
                    continue;
                }
                let p = ring(&cur, pos);
                let b: u8 = p.iter().sum();
                if !(2..=6).contains(&b) {
                    continue;
                }
                // 0 -> 1 跳变次数.
                let a = (0..8)
                    .filter(|&i| p[i] == 0 && p[(i + 1) % 8] == 1)
                    .count();
                if a != 1 {
                    continue;
                }
                // p2, p4, p6, p8 分别为 p[0], p[2], p[4], p[6].
                let ok = if step == 0 {
                    p[0] * p[2] * p[4] == 0 && p[2] * p[4] * p[6] == 0
                } else {
                    p[0] * p[2] * p[6] == 0 && p[0] * p[4] * p[6] == 0
                };
                if ok {
                    to_delete.push(pos);
                }
            }
            changed |= !to_delete.is_empty();
            for pos in to_delete {
                cur[pos] = MASK_BACKGROUND;
            }
        }
        if !changed {
            break cur;
        }
    }
}

/// 迭代腐蚀深度图.
///
/// 以半径 1 圆盘反复腐蚀掩码, 给每个前景像素盖上它消失时的迭代轮数
/// (边界像素为 1, 越靠内越大); 掩码外的像素为 0.
///
/// # 返回值
///
/// `(深度图, 最大深度)`. 全背景输入的最大深度为 0.
pub fn erosion_depth(mask: ArrayView2<u8>) -> (Array2<u32>, u32) {
    let mut depth = Array2::<u32>::zeros(mask.dim());
    let mut cur = mask.to_owned();
    let mut iter = 0u32;

    while count_foreground(cur.view()) > 0 {
        let next = erode(cur.view(), 1);
        iter += 1;
        for (pos, &pix) in cur.indexed_iter() {
            if is_foreground(pix) && is_background(next[pos]) {
                depth[pos] = iter;
            }
        }
        cur = next;
    }
    (depth, iter)
}

/// 精确欧氏距离变换: 每个像素到最近前景像素的距离.
///
/// 采用 Felzenszwalb-Huttenlocher 逐维抛物线下包络算法.
/// 前景像素的距离为 0; 全背景输入的所有距离为无穷.
pub fn distance_from(mask: ArrayView2<u8>) -> Array2<f64> {
    let (h, w) = mask.dim();
    let mut sq = Array2::<f64>::from_elem((h, w), f64::INFINITY);
    for (pos, &pix) in mask.indexed_iter() {
        if is_foreground(pix) {
            sq[pos] = 0.0;
        }
    }

    let mut f = vec![0.0f64; h.max(w)];
    let mut d = vec![0.0f64; h.max(w)];

    // 先沿列, 再沿行, 各做一次一维平方距离变换.
    for wi in 0..w {
        for hi in 0..h {
            f[hi] = sq[(hi, wi)];
        }
        edt_1d(&f[..h], &mut d[..h]);
        for hi in 0..h {
            sq[(hi, wi)] = d[hi];
        }
    }
    for hi in 0..h {
        for wi in 0..w {
            f[wi] = sq[(hi, wi)];
        }
        edt_1d(&f[..w], &mut d[..w]);
        for wi in 0..w {
            sq[(hi, wi)] = d[wi];
        }
    }
    sq.mapv_into(f64::sqrt)
}

/// 一维平方欧氏距离变换 (抛物线下包络).
///
/// `f` 为每个格点的初始平方距离 (无站点处为无穷), 结果写入 `d`.
fn edt_1d(f: &[f64], d: &mut [f64]) {
    let n = f.len();
    debug_assert!(d.len() >= n);

    // v: 包络中抛物线的顶点; z: 相邻抛物线的分界点.
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;
    let mut has_site = false;

    for q in 0..n {
        if f[q].is_infinite() {
            continue;
        }
        if !has_site {
            has_site = true;
            v[0] = q;
            z[0] = f64::NEG_INFINITY;
            z[1] = f64::INFINITY;
            continue;
        }
        loop {
            let p = v[k];
            let s = ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64))
                / ((2 * q - 2 * p) as f64);
            if s <= z[k] {
                debug_assert!(k > 0);
                k -= 1;
            } else {
                k += 1;
                v[k] = q;
                z[k] = s;
                z[k + 1] = f64::INFINITY;
                break;
            }
        }
    }

    if !has_site {
        d[..n].fill(f64::INFINITY);
        return;
    }
    k = 0;
    for (q, dq) in d.iter_mut().enumerate().take(n) {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let p = v[k];
        *dq = (q as f64 - p as f64).powi(2) + f[p];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// 在 `(h, w)` 掩码上填充一个矩形前景.
    fn rect_mask((h, w): (usize, usize), (h0, h1): (usize, usize), (w0, w1): (usize, usize)) -> Array2<u8> {
        let mut m = Array2::<u8>::zeros((h, w));
        for hi in h0..=h1 {
            for wi in w0..=w1 {
                m[(hi, wi)] = MASK_FOREGROUND;
            }
        }
        m
    }

    #[test]
    fn test_erode_dilate_square() {
        let m = rect_mask((20, 20), (5, 14), (5, 14));
        let e = erode(m.view(), 2);
        // 腐蚀后仍为矩形, 每边收缩 2.
        assert_eq!(count_foreground(e.view()), 6 * 6);
        assert_eq!(e[(7, 7)], MASK_FOREGROUND);
        assert_eq!(e[(6, 7)], MASK_BACKGROUND);

        let d = dilate(m.view(), 1);
        assert!(count_foreground(d.view()) > count_foreground(m.view()));
        assert_eq!(d[(4, 7)], MASK_FOREGROUND);
        assert_eq!(d[(3, 7)], MASK_BACKGROUND);
    }

    #[test]
    fn test_erode_border_foreground() {
        // 贴边前景: 边界外视为背景, 腐蚀应去掉贴边的一圈.
        let m = rect_mask((10, 10), (0, 9), (0, 9));
        let e = erode(m.view(), 1);
        assert_eq!(e[(0, 5)], MASK_BACKGROUND);
        assert_eq!(e[(5, 5)], MASK_FOREGROUND);
    }

    #[test]
    fn test_open_close() {
        // 单像素噪声被开运算清除.
        let mut m = rect_mask((20, 20), (5, 14), (5, 14));
        m[(1, 1)] = MASK_FOREGROUND;
        let o = open(m.view(), 1);
        assert_eq!(o[(1, 1)], MASK_BACKGROUND);
        assert_eq!(o[(10, 10)], MASK_FOREGROUND);

        // 内部孔洞被闭运算填补.
        let mut m2 = rect_mask((20, 20), (5, 14), (5, 14));
        m2[(10, 10)] = MASK_BACKGROUND;
        let c = close(m2.view(), 1);
        assert_eq!(c[(10, 10)], MASK_FOREGROUND);
    }

    #[test]
    fn test_skeleton_thin_and_nonempty() {
        let m = rect_mask((30, 30), (10, 19), (5, 24));
        let sk = skeletonize(m.view());
        let cnt = count_foreground(sk.view());
        assert!(cnt > 0);
        assert!(cnt < count_foreground(m.view()));
        // 骨架不会跑出原掩码.
        for (pos, &pix) in sk.indexed_iter() {
            if is_foreground(pix) {
                assert_eq!(m[pos], MASK_FOREGROUND);
            }
        }

        // 单像素是自己的骨架.
        let dot = rect_mask((5, 5), (2, 2), (2, 2));
        assert_eq!(skeletonize(dot.view()), dot);
    }

    #[test]
    fn test_erosion_depth() {
        let m = rect_mask((11, 11), (3, 7), (3, 7));
        let (depth, maxdis) = erosion_depth(m.view());
        // 5x5 矩形: 边界一圈深度 1, 中心深度 3.
        assert_eq!(maxdis, 3);
        assert_eq!(depth[(3, 3)], 1);
        assert_eq!(depth[(4, 4)], 2);
        assert_eq!(depth[(5, 5)], 3);
        assert_eq!(depth[(0, 0)], 0);

        let empty = Array2::<u8>::zeros((4, 4));
        assert_eq!(erosion_depth(empty.view()).1, 0);
    }

    #[test]
    fn test_distance_from() {
        let mut m = Array2::<u8>::zeros((9, 9));
        m[(4, 4)] = MASK_FOREGROUND;
        let d = distance_from(m.view());
        assert_eq!(d[(4, 4)], 0.0);
        assert!((d[(4, 7)] - 3.0).abs() < 1e-9);
        assert!((d[(1, 0)] - 25.0f64.sqrt()).abs() < 1e-9);

        let empty = Array2::<u8>::zeros((3, 3));
        assert!(distance_from(empty.view()).iter().all(|d| d.is_infinite()));
    }
}
