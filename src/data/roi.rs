//! 先验分割的 ROI (感兴趣区域) 包围盒.

use ndarray::{s, Array2, ArrayView2};
use num::Zero;

use crate::consts::mask;
use crate::Idx2d;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 轴对齐矩形裁剪区域, 边界闭区间 `[h0, h1] x [w0, w1]`.
///
/// 由先验分割掩码的非零包围盒向四周扩张固定边距、再钳制到切片边界得到.
/// 非空掩码保证 `h0 <= h1 < H` 且 `w0 <= w1 < W`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Roi {
    /// 行下界 (含).
    pub h0: usize,

    /// 行上界 (含).
    pub h1: usize,

    /// 列下界 (含).
    pub w0: usize,

    /// 列上界 (含).
    pub w1: usize,
}

impl Roi {
    /// 计算掩码非零区域的包围盒, 向四周扩张 `margin` 并钳制到掩码边界.
    ///
    /// 全背景掩码返回 `None`.
    pub fn from_mask(mask: ArrayView2<u8>, margin: usize) -> Option<Self> {
        let (height, width) = mask.dim();
        let (mut h0, mut h1, mut w0, mut w1) = (usize::MAX, 0usize, usize::MAX, 0usize);

        for ((h, w), &pix) in mask.indexed_iter() {
            if mask::is_foreground(pix) {
                h0 = h0.min(h);
                h1 = h1.max(h);
                w0 = w0.min(w);
                w1 = w1.max(w);
            }
        }
        if h0 == usize::MAX {
            return None;
        }
        Some(Self {
            h0: h0.saturating_sub(margin),
            h1: (h1 + margin).min(height - 1),
            w0: w0.saturating_sub(margin),
            w1: (w1 + margin).min(width - 1),
        })
    }

    /// ROI 的高.
    #[inline]
    pub fn height(&self) -> usize {
        self.h1 - self.h0 + 1
    }

    /// ROI 的宽.
    #[inline]
    pub fn width(&self) -> usize {
        self.w1 - self.w0 + 1
    }

    /// ROI 的形状 (高, 宽).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        (self.height(), self.width())
    }

    /// 从完整切片中裁剪出 ROI 部分 (deepcopy).
    ///
    /// 当 ROI 超出 `full` 的边界时 panic.
    #[inline]
    pub fn crop<T: Copy>(&self, full: ArrayView2<T>) -> Array2<T> {
        full.slice(s![self.h0..=self.h1, self.w0..=self.w1])
            .to_owned()
    }

    /// 将 ROI 大小的补丁粘贴回一张全零的完整切片中.
    ///
    /// 当 `patch` 形状与 ROI 不符时 panic.
    pub fn paste<T: Copy + Zero>(&self, full_shape: Idx2d, patch: &Array2<T>) -> Array2<T> {
        assert_eq!(patch.dim(), self.shape(), "补丁形状与 ROI 不符");
        let mut full = Array2::<T>::zeros(full_shape);
        full.slice_mut(s![self.h0..=self.h1, self.w0..=self.w1])
            .assign(patch);
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_roi_bounds_clamped() {
        let mut m = Array2::<u8>::zeros((100, 100));
        m[(10, 10)] = 1;
        m[(40, 60)] = 1;

        let roi = Roi::from_mask(m.view(), 25).unwrap();
        assert_eq!((roi.h0, roi.h1, roi.w0, roi.w1), (0, 65, 0, 85));
        assert!(roi.h0 <= roi.h1 && roi.h1 < 100);
        assert!(roi.w0 <= roi.w1 && roi.w1 < 100);

        // 靠近右下边界时钳制到切片边界.
        let mut m2 = Array2::<u8>::zeros((50, 50));
        m2[(48, 48)] = 1;
        let roi2 = Roi::from_mask(m2.view(), 25).unwrap();
        assert_eq!((roi2.h0, roi2.h1, roi2.w0, roi2.w1), (23, 49, 23, 49));
    }

    #[test]
    fn test_roi_empty_mask() {
        let m = Array2::<u8>::zeros((10, 10));
        assert!(Roi::from_mask(m.view(), 25).is_none());
    }

    #[test]
    fn test_crop_paste_roundtrip() {
        let mut m = Array2::<u8>::zeros((20, 20));
        m[(8, 9)] = 1;
        m[(10, 11)] = 1;
        let roi = Roi::from_mask(m.view(), 2).unwrap();

        let patch = roi.crop(m.view());
        assert_eq!(patch.dim(), roi.shape());

        let restored = roi.paste((20, 20), &patch);
        assert_eq!(restored, m);
    }
}
