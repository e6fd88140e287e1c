//! 体数据容器: 3D 扫描、涂鸦体、分割输出体与概率输出体.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::consts::seed;
use crate::{Idx2d, Idx3d};

mod roi;

pub use roi::Roi;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 传播方向轴. 决定切片沿 3D 体的哪个维度寻址.
///
/// 体数据按 `(z, h, w)` 组织; `Axial` 沿第 0 维,
/// `Coronal` 沿第 1 维, `Sagittal` 沿第 2 维.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Orientation {
    /// 水平 (轴状) 方向, 第 0 维.
    #[default]
    Axial,

    /// 冠状方向, 第 1 维.
    Coronal,

    /// 矢状方向, 第 2 维.
    Sagittal,
}

impl Orientation {
    /// 切片寻址所沿的 `ndarray` 轴.
    #[inline]
    pub fn axis(&self) -> Axis {
        match self {
            Orientation::Axial => Axis(0),
            Orientation::Coronal => Axis(1),
            Orientation::Sagittal => Axis(2),
        }
    }
}

/// 分割引擎的体数据存储.
///
/// 持有四个同形状的 3D 数组: 原始扫描 (强度, `f32`)、涂鸦体
/// (`{0, 127, 255}` 标签, `u8`)、分割输出体 (`{0, 1}`, `u8`)
/// 和前景概率输出体 (`[0, 1]`, `f32`). 所有切片寻址均沿
/// [`Orientation`] 给定的轴进行.
///
/// 扫描数据在构造后不可变; 替换扫描即替换整个存储.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    scan: Array3<f32>,
    seed: Array3<u8>,
    seg: Array3<u8>,
    prob: Array3<f32>,
    orientation: Orientation,
}

impl VolumeStore {
    /// 以扫描体和切片方向初始化. 涂鸦体与两个输出体全零.
    pub fn new(scan: Array3<f32>, orientation: Orientation) -> Self {
        let dim = scan.raw_dim();
        Self {
            scan,
            seed: Array3::zeros(dim),
            seg: Array3::zeros(dim),
            prob: Array3::zeros(dim),
            orientation,
        }
    }

    /// 体数据形状 `(z, h, w)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let &[z, h, w] = self.scan.shape() else {
            unreachable!()
        };
        (z, h, w)
    }

    /// 当前方向.
    #[inline]
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// 当前方向上的切片个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.scan.len_of(self.orientation.axis())
    }

    /// 存储是否不含任何体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scan.is_empty()
    }

    /// 当前方向上单个切片的形状 (高, 宽).
    #[inline]
    pub fn slice_shape(&self) -> Idx2d {
        let (z, h, w) = self.shape();
        match self.orientation {
            Orientation::Axial => (h, w),
            Orientation::Coronal => (z, w),
            Orientation::Sagittal => (z, h),
        }
    }

    /// 更换切片方向. 同时清空涂鸦体和两个输出体
    /// (跨方向的派生状态全部失效).
    pub fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
        self.clear_seed();
        self.clear_outputs();
    }

    /// 获取第 `index` 个扫描切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn scan_slice(&self, index: usize) -> ArrayView2<'_, f32> {
        self.scan.index_axis(self.orientation.axis(), index)
    }

    /// 获取第 `index` 个涂鸦切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn seed_slice(&self, index: usize) -> ArrayView2<'_, u8> {
        self.seed.index_axis(self.orientation.axis(), index)
    }

    /// 获取第 `index` 个分割输出切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn seg_slice(&self, index: usize) -> ArrayView2<'_, u8> {
        self.seg.index_axis(self.orientation.axis(), index)
    }

    /// 获取第 `index` 个概率输出切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn prob_slice(&self, index: usize) -> ArrayView2<'_, f32> {
        self.prob.index_axis(self.orientation.axis(), index)
    }

    /// 覆写第 `index` 个涂鸦切片.
    ///
    /// 当 `index` 越界、形状不符或标签值非法时 panic.
    pub fn write_seed(&mut self, index: usize, labels: &Array2<u8>) {
        assert!(
            labels.iter().all(|&p| matches!(
                p,
                seed::SEED_NONE | seed::SEED_FOREGROUND | seed::SEED_BACKGROUND
            )),
            "涂鸦标签值必须为 0 / 127 / 255"
        );
        self.seed
            .index_axis_mut(self.orientation.axis(), index)
            .assign(labels);
    }

    /// 在第 `index` 个涂鸦切片上为 `points` 中的所有位置打上硬约束标签.
    ///
    /// 当 `index` 或任一 `points` 元素越界时 panic.
    pub fn paint_seeds(&mut self, index: usize, points: &[Idx2d], is_foreground: bool) {
        let value = if is_foreground {
            seed::SEED_FOREGROUND
        } else {
            seed::SEED_BACKGROUND
        };
        let mut sli = self.seed.index_axis_mut(self.orientation.axis(), index);
        for &pos in points {
            sli[pos] = value;
        }
    }

    /// 覆写第 `index` 个分割输出切片.
    ///
    /// 当 `index` 越界或形状不符时 panic.
    #[inline]
    pub fn write_seg(&mut self, index: usize, mask: &Array2<u8>) {
        self.seg
            .index_axis_mut(self.orientation.axis(), index)
            .assign(mask);
    }

    /// 覆写第 `index` 个概率输出切片. 输入以 `f64` 计算, 存储降为 `f32`.
    ///
    /// 当 `index` 越界或形状不符时 panic.
    pub fn write_prob(&mut self, index: usize, prob: &Array2<f64>) {
        let mut sli = self.prob.index_axis_mut(self.orientation.axis(), index);
        for (dst, src) in sli.iter_mut().zip(prob.iter()) {
            *dst = *src as f32;
        }
    }

    /// 清空涂鸦体.
    #[inline]
    pub fn clear_seed(&mut self) {
        self.seed.fill(0);
    }

    /// 清空分割输出体和概率输出体.
    #[inline]
    pub fn clear_outputs(&mut self) {
        self.seg.fill(0);
        self.prob.fill(0.0);
    }

    /// 获得分割输出体的一份不可变 shallow copy.
    #[inline]
    pub fn seg(&self) -> ArrayView3<'_, u8> {
        self.seg.view()
    }

    /// 获得概率输出体的一份不可变 shallow copy.
    #[inline]
    pub fn prob(&self) -> ArrayView3<'_, f32> {
        self.prob.view()
    }

    /// 获得扫描体的一份不可变 shallow copy.
    #[inline]
    pub fn scan(&self) -> ArrayView3<'_, f32> {
        self.scan.view()
    }
}
