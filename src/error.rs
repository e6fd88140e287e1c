//! 运行时错误.

use std::error::Error;
use std::fmt;

/// 协作者 (特征提取器 / 分类器 / 能量最小化器) 返回的不透明错误.
pub type CollabError = Box<dyn Error + Send + Sync>;

/// 分割流水线中发生协作者错误的阶段.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    /// 特征提取.
    Features,

    /// 分类器预测.
    Predict,

    /// 分类器 (增量) 训练.
    Train,

    /// 能量最小化.
    Minimize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Features => "features",
            Stage::Predict => "predict",
            Stage::Train => "train",
            Stage::Minimize => "minimize",
        };
        f.write_str(name)
    }
}

/// 分割引擎的运行时错误.
///
/// 注意: 退化先验 (先验分割前景像素过少) **不是** 错误;
/// 引擎以全零输出静默吸收该情况并继续传播.
#[derive(Debug)]
pub enum SegError {
    /// 尚未设置 3D 扫描体数据.
    MissingVolume,

    /// 尚未设置起始切片索引.
    MissingStartIndex,

    /// 起始切片索引越界. `(start_index, 切片总数)`
    StartIndexOutOfBound(usize, usize),

    /// 传播范围越界或未包含起始切片. `(lo, hi, 切片总数)`
    SliceRangeOutOfBound(usize, usize, usize),

    /// 单切片操作的切片索引越界. `(index, 切片总数)`
    SliceIndexOutOfBound(usize, usize),

    /// 起始切片上没有任何前景涂鸦.
    MissingSeed,

    /// 前景与背景标签集合均为空, 无法训练分类器.
    InsufficientTrainingData,

    /// 尚未完成起始切片分割, 不能开始传播.
    StartSliceNotSegmented,

    /// 协作者在处理某切片时失败. 携带切片索引、发生阶段与原始错误.
    Collaborator {
        /// 发生错误的切片索引.
        slice: usize,

        /// 发生错误的流水线阶段.
        stage: Stage,

        /// 协作者返回的原始错误.
        source: CollabError,
    },
}

impl fmt::Display for SegError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegError::MissingVolume => write!(f, "尚未设置 3D 体数据"),
            SegError::MissingStartIndex => write!(f, "尚未设置起始切片索引"),
            SegError::StartIndexOutOfBound(start, len) => {
                write!(f, "起始切片索引 {start} 越界 (切片总数 {len})")
            }
            SegError::SliceRangeOutOfBound(lo, hi, len) => {
                write!(f, "传播范围 [{lo}, {hi}] 非法 (切片总数 {len})")
            }
            SegError::SliceIndexOutOfBound(index, len) => {
                write!(f, "切片索引 {index} 越界 (切片总数 {len})")
            }
            SegError::MissingSeed => write!(f, "起始切片缺少前景涂鸦"),
            SegError::InsufficientTrainingData => {
                write!(f, "前景与背景标签均为空, 无法训练分类器")
            }
            SegError::StartSliceNotSegmented => {
                write!(f, "起始切片尚未分割, 不能开始传播")
            }
            SegError::Collaborator { slice, stage, source } => {
                write!(f, "切片 {slice} 在 {stage} 阶段失败: {source}")
            }
        }
    }
}

impl Error for SegError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SegError::Collaborator { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl SegError {
    /// 将协作者错误包装为携带切片索引和阶段信息的 [`SegError`].
    #[inline]
    pub(crate) fn at(slice: usize, stage: Stage) -> impl FnOnce(CollabError) -> Self {
        move |source| SegError::Collaborator { slice, stage, source }
    }
}
