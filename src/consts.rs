//! 通用常量.

/// 涂鸦 / 硬约束标签值.
pub mod seed {
    /// 未标注像素.
    pub const SEED_NONE: u8 = 0;

    /// 前景硬约束像素.
    pub const SEED_FOREGROUND: u8 = 127;

    /// 背景硬约束像素.
    pub const SEED_BACKGROUND: u8 = 255;

    /// 像素是否未被标注?
    #[inline]
    pub const fn is_none(p: u8) -> bool {
        matches!(p, SEED_NONE)
    }

    /// 像素是否是前景硬约束?
    #[inline]
    pub const fn is_foreground(p: u8) -> bool {
        matches!(p, SEED_FOREGROUND)
    }

    /// 像素是否是背景硬约束?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, SEED_BACKGROUND)
    }

    /// 像素是否是某种硬约束 (前景或背景)?
    #[inline]
    pub const fn is_labeled(p: u8) -> bool {
        !is_none(p)
    }
}

/// 二值分割掩码值.
pub mod mask {
    /// 分割背景.
    pub const MASK_BACKGROUND: u8 = 0;

    /// 分割前景.
    pub const MASK_FOREGROUND: u8 = 1;

    /// 像素是否是分割前景?
    #[inline]
    pub const fn is_foreground(p: u8) -> bool {
        matches!(p, MASK_FOREGROUND)
    }

    /// 像素是否是分割背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        !is_foreground(p)
    }
}

/// ROI 包围盒在先验掩码四周扩张的固定边距 (像素).
pub const ROI_MARGIN: usize = 25;

/// 先验分割的前景像素数低于该阈值时, 视为退化先验,
/// 当前切片不做分割 (保持全零) 且不做增量训练.
pub const MIN_PRIOR_FOREGROUND: usize = 10;

/// 腐蚀后前景像素数低于该阈值时, 回退为对完整掩码取骨架.
pub const MIN_ERODED_SEED: usize = 100;

/// 单切片 refine 操作中, 显式涂鸦周围保留原始标签的半径 (像素).
pub const REFINE_SEED_RADIUS: f64 = 15.0;

/// 概率精化: 先验掩码之外的过度自信概率的衰减系数.
pub const OUTSIDE_DAMP: f64 = 0.4;

/// 概率精化: 先验掩码内部概率提升的最大幅度.
pub const INSIDE_BOOST: f64 = 0.2;

/// 概率精化: 掩码外需要衰减的概率下限.
pub const OUTSIDE_PROB_THRESHOLD: f64 = 0.5;

/// 概率精化: 掩码内需要提升的概率上限.
pub const INSIDE_PROB_THRESHOLD: f64 = 0.8;

/// 连通性精化: 种子强度分布允许的下偏差倍数 (均值减 3 倍标准差).
pub const CONNECT_STD_LOWER: f64 = 3.0;

/// 连通性精化: 种子强度分布允许的上偏差倍数 (均值加 2 倍标准差).
pub const CONNECT_STD_UPPER: f64 = 2.0;
