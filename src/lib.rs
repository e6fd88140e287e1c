#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供基于单切片涂鸦交互的 3D 医学图像逐切片传播分割引擎.
//!
//! 使用方式: 用户在体数据的某一张切片上涂抹前景 / 背景涂鸦,
//! 引擎在该切片上训练分类器并以能量最小化求得初始分割, 然后以它为先验
//! 沿切片序列向两侧逐切片传播, 每个切片都做 ROI 裁剪、概率精化与
//! 分类器增量重训练. 入口为 [`propagate::PropagationEngine`].
//!
//! 该 crate 目前仅提供 `safe` 接口. 将来可能为部分高性能场景关键路径提供 `unsafe` 接口.
//!
//! # 注意
//!
//! 1. 分类器、特征提取器与能量最小化器都是可替换的契约
//!   ([`classify::Classify`] / [`features::FeatureExtract`] /
//!   [`energy::MinimizeEnergy`]), 内置实现满足确定性要求.
//! 2. 在非期望情况下 (切片越界、形状不符、非法标签值),
//!   程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//!   可恢复的使用错误则以 [`error::SegError`] 返回.

pub mod classify;
pub mod consts;
pub mod data;
pub mod energy;
pub mod error;
pub mod features;
pub mod labels;
pub mod morph;
pub mod prelude;
pub mod propagate;
pub mod refine;

/// 2D 索引 (高, 宽).
pub type Idx2d = (usize, usize);

/// 3D 索引 (深, 高, 宽).
pub type Idx3d = (usize, usize, usize);
