//! 传播控制器: 把 "先验分割 + 原始切片 -> 新分割" 的单切片流水线
//! 沿切片序列双向推进.
//!
//! 控制流: 起始切片由用户涂鸦训练并分割; 随后以起始结果为先验,
//! 从 `start_index` 向两侧逐切片传播. 每个方向持有自己独立的分类器,
//! 方向内部严格串行 (每一步的先验是上一步的输出), 两个方向互不共享
//! 可变状态, 可以并行执行.

use either::Either;
use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView3, Axis};

use crate::classify::{Classify, OnlineBayes};
use crate::consts::{mask, seed, MIN_PRIOR_FOREGROUND, REFINE_SEED_RADIUS, ROI_MARGIN};
use crate::data::{Orientation, Roi, VolumeStore};
use crate::energy::{IcmMinimizer, MinimizeEnergy};
use crate::error::{SegError, Stage};
use crate::features::{FeatureExtract, IntensityFeatures};
use crate::labels::derive_labels;
use crate::refine;
use crate::{morph, Idx2d};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 传播方向.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    /// 从 `start_index - 1` 向切片下界递减.
    Backward,

    /// 从 `start_index + 1` 向切片上界递增.
    Forward,
}

/// 能量最小化与标签派生的标量参数.
///
/// 修改任一参数会使两个输出体失效, 但保留涂鸦与已训练的分类器.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Params {
    /// 能量最小化器的一元项 / 成对项权衡系数.
    pub lambda: f64,

    /// 相邻像素强度差的敏感度.
    pub sigma: f64,

    /// 派生前景种子时的腐蚀半径.
    pub inner_dis: usize,

    /// 派生背景种子带时的膨胀半径.
    pub outer_dis: usize,
}

impl Default for Params {
    #[inline]
    fn default() -> Self {
        Self {
            lambda: 0.5,
            sigma: 30.0,
            inner_dis: 3,
            outer_dis: 6,
        }
    }
}

/// 单个传播方向的私有状态. 每个方向恰好拥有一个分类器实例,
/// 两个方向之间从不共享.
#[derive(Clone, Debug)]
struct DirectionState<C> {
    classifier: C,
}

/// 单切片流水线的产物: 完整切片尺寸的分割掩码与概率图.
type SliceOutput = (Array2<u8>, Array2<f64>);

/// 传播控制器.
///
/// 泛型参数为三个协作者契约: 特征提取器 `F`、分类器 `C`
/// 与能量最小化器 `M`; 默认使用内置实现.
pub struct PropagationEngine<F = IntensityFeatures, C = OnlineBayes, M = IcmMinimizer> {
    store: Option<VolumeStore>,
    params: Params,
    start_index: Option<usize>,
    slice_range: Option<(usize, usize)>,
    extractor: F,
    minimizer: M,
    /// 分类器原型. 重置方向状态时从它克隆出全新实例.
    proto: C,
    backward: DirectionState<C>,
    forward: DirectionState<C>,
    start_done: bool,
    progress: Option<Box<dyn FnMut(usize)>>,
}

impl PropagationEngine {
    /// 以内置协作者初始化.
    #[inline]
    pub fn new() -> Self {
        Self::with_collaborators(IntensityFeatures, OnlineBayes::default(), IcmMinimizer::default())
    }
}

impl Default for PropagationEngine {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<F, C, M> PropagationEngine<F, C, M>
where
    F: FeatureExtract,
    C: Classify + Clone,
    M: MinimizeEnergy,
{
    /// 以自定义协作者初始化. `classifier` 作为原型,
    /// 两个方向的实例均由它克隆而来.
    pub fn with_collaborators(extractor: F, classifier: C, minimizer: M) -> Self {
        Self {
            store: None,
            params: Params::default(),
            start_index: None,
            slice_range: None,
            extractor,
            minimizer,
            backward: DirectionState {
                classifier: classifier.clone(),
            },
            forward: DirectionState {
                classifier: classifier.clone(),
            },
            proto: classifier,
            start_done: false,
            progress: None,
        }
    }

    /// 注册进度回调. 每写回一个切片后同步调用一次, 携带该切片索引.
    /// 回调缺席不影响任何正确性.
    #[inline]
    pub fn on_progress(&mut self, callback: impl FnMut(usize) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// 当前参数.
    #[inline]
    pub fn params(&self) -> Params {
        self.params
    }

    /// 设置 3D 扫描体. 替换体数据使所有派生状态失效:
    /// 涂鸦、两个输出体以及两个方向的分类器全部重置.
    pub fn set_volume(&mut self, scan: Array3<f32>) {
        let orientation = self
            .store
            .as_ref()
            .map_or(Orientation::default(), VolumeStore::orientation);
        self.store = Some(VolumeStore::new(scan, orientation));
        self.reset_derived();
    }

    /// 更换切片方向. 与替换体数据同样使所有派生状态失效.
    pub fn set_orientation(&mut self, orientation: Orientation) {
        if let Some(store) = self.store.as_mut() {
            store.set_orientation(orientation);
        }
        self.reset_derived();
    }

    /// 设置起始切片索引. 越界检查推迟到分割操作执行时.
    #[inline]
    pub fn set_start_index(&mut self, index: usize) {
        self.start_index = Some(index);
    }

    /// 设置传播范围 (闭区间). 未设置时使用全部切片.
    #[inline]
    pub fn set_slice_range(&mut self, lo: usize, hi: usize) {
        self.slice_range = Some((lo, hi));
    }

    /// 覆写第 `index` 个涂鸦切片.
    pub fn set_seed_slice(&mut self, index: usize, labels: &Array2<u8>) -> Result<(), SegError> {
        let store = self.store.as_mut().ok_or(SegError::MissingVolume)?;
        if index >= store.len() {
            return Err(SegError::SliceIndexOutOfBound(index, store.len()));
        }
        store.write_seed(index, labels);
        Ok(())
    }

    /// 在起始切片上追加涂鸦点.
    pub fn add_seeds(&mut self, points: &[Idx2d], is_foreground: bool) -> Result<(), SegError> {
        let start = self.start_index.ok_or(SegError::MissingStartIndex)?;
        let store = self.store.as_mut().ok_or(SegError::MissingVolume)?;
        if start >= store.len() {
            return Err(SegError::StartIndexOutOfBound(start, store.len()));
        }
        store.paint_seeds(start, points, is_foreground);
        Ok(())
    }

    /// 设置 `lambda`. 两个输出体失效, 涂鸦与分类器保留.
    pub fn set_lambda(&mut self, lambda: f64) {
        self.params.lambda = lambda;
        self.invalidate_outputs();
    }

    /// 设置 `sigma`. 两个输出体失效, 涂鸦与分类器保留.
    pub fn set_sigma(&mut self, sigma: f64) {
        self.params.sigma = sigma;
        self.invalidate_outputs();
    }

    /// 设置前景种子腐蚀半径. 两个输出体失效, 涂鸦与分类器保留.
    pub fn set_inner_dis(&mut self, inner_dis: usize) {
        self.params.inner_dis = inner_dis;
        self.invalidate_outputs();
    }

    /// 设置背景种子膨胀半径. 两个输出体失效, 涂鸦与分类器保留.
    pub fn set_outer_dis(&mut self, outer_dis: usize) {
        self.params.outer_dis = outer_dis;
        self.invalidate_outputs();
    }

    /// 重置所有派生状态 (涂鸦、输出体、分类器), 保留体数据与参数.
    pub fn reset(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.clear_seed();
            store.clear_outputs();
        }
        self.reset_derived_classifiers();
        self.start_done = false;
    }

    /// 获得分割输出体的只读视图.
    pub fn seg_image(&self) -> Result<ArrayView3<'_, u8>, SegError> {
        Ok(self.store.as_ref().ok_or(SegError::MissingVolume)?.seg())
    }

    /// 获得概率输出体的只读视图.
    pub fn probability_image(&self) -> Result<ArrayView3<'_, f32>, SegError> {
        Ok(self.store.as_ref().ok_or(SegError::MissingVolume)?.prob())
    }

    /// 起始切片分割.
    ///
    /// 要求已设置体数据、起始索引, 且起始切片上至少有一个前景涂鸦.
    /// 两个方向的分类器在 **同一份** 起始数据上重新训练
    /// (实例各自独立, 此后随传播各自分化). 对确定性协作者,
    /// 重复调用产生完全相同的输出.
    pub fn start_slice_segmentation(&mut self) -> Result<(), SegError> {
        let store = self.store.as_ref().ok_or(SegError::MissingVolume)?;
        let len = store.len();
        let start = self.start_index.ok_or(SegError::MissingStartIndex)?;
        if start >= len {
            return Err(SegError::StartIndexOutOfBound(start, len));
        }

        let seeds = store.seed_slice(start).to_owned();
        if !seeds.iter().any(|&p| seed::is_foreground(p)) {
            return Err(SegError::MissingSeed);
        }
        let scan = store.scan_slice(start).to_owned();

        let feats = self
            .extractor
            .features(scan.view())
            .map_err(SegError::at(start, Stage::Features))?;
        let (rows, flags) = labeled_rows(&seeds);
        if rows.is_empty() {
            return Err(SegError::InsufficientTrainingData);
        }
        let training = feats.select(Axis(0), &rows);

        // 每次都从原型克隆全新实例, 保证重复调用幂等.
        self.backward.classifier = self.proto.clone();
        self.forward.classifier = self.proto.clone();
        self.backward
            .classifier
            .train(training.view(), &flags)
            .map_err(SegError::at(start, Stage::Train))?;
        self.forward
            .classifier
            .train(training.view(), &flags)
            .map_err(SegError::at(start, Stage::Train))?;

        let raw = self
            .forward
            .classifier
            .predict(feats.view())
            .map_err(SegError::at(start, Stage::Predict))?;
        let mut prob = Array2::from_shape_vec(scan.dim(), raw)
            .map_err(|e| SegError::at(start, Stage::Predict)(Box::new(e)))?;

        refine::connectivity_adjust(&mut prob, scan.view(), seeds.view());

        let seg = self
            .minimizer
            .minimize(
                scan.view(),
                seeds.view(),
                prob.view(),
                self.params.lambda,
                self.params.sigma,
            )
            .map_err(SegError::at(start, Stage::Minimize))?;

        let store = self.store.as_mut().expect("体数据刚刚校验过");
        store.write_seg(start, &seg);
        store.write_prob(start, &prob);
        self.start_done = true;
        info!("起始切片 {start} 分割完成");
        if let Some(cb) = self.progress.as_mut() {
            cb(start);
        }
        Ok(())
    }

    /// 双向传播.
    ///
    /// 要求起始切片分割已完成. 两个方向各自从起始切片的结果出发,
    /// 分别沿递减 / 递增的切片序列依次执行单切片流水线; 范围之外的
    /// 切片不会被触碰. 范围非法时在处理任何切片之前报错.
    pub fn segmentation_propagate(&mut self) -> Result<(), SegError> {
        let (start, lo, hi) = self.validate_range()?;
        // 把存储整体取出, 传播期间按切片独占可变访问; 无论成败都放回.
        let mut store = self.store.take().expect("validate_range 已校验");
        let prior = store.seg_slice(start).to_owned();

        let mut result = Ok(());
        for direction in [Direction::Backward, Direction::Forward] {
            let classifier = match direction {
                Direction::Backward => &mut self.backward.classifier,
                Direction::Forward => &mut self.forward.classifier,
            };
            result = run_direction(
                &self.extractor,
                &self.minimizer,
                classifier,
                &mut store,
                &mut self.progress,
                &self.params,
                direction_indices(direction, start, lo, hi),
                prior.clone(),
            );
            if result.is_err() {
                break;
            }
        }
        self.store = Some(store);
        result?;
        info!("传播完成: 范围 [{lo}, {hi}], 起始 {start}");
        Ok(())
    }

    /// 起始切片分割与双向传播的组合操作.
    #[inline]
    pub fn run_segmentation(&mut self) -> Result<(), SegError> {
        self.start_slice_segmentation()?;
        self.segmentation_propagate()
    }

    /// 对单个已处理切片做临时精修.
    ///
    /// 将该切片当前的涂鸦与现有分割混合: 距任何显式涂鸦超过
    /// 15 像素的位置, 其标签由现有分割改写 (前景变硬前景, 背景变未标注),
    /// 然后带着现有概率图直接重跑能量最小化 (不重训练、不裁剪 ROI、
    /// 不做概率精化), 最后写回开-闭运算清理后的掩码.
    pub fn refine_slice(&mut self, index: usize) -> Result<(), SegError> {
        let store = self.store.as_ref().ok_or(SegError::MissingVolume)?;
        if index >= store.len() {
            return Err(SegError::SliceIndexOutOfBound(index, store.len()));
        }

        let scan = store.scan_slice(index).to_owned();
        let seg = store.seg_slice(index).to_owned();
        let prob = store.prob_slice(index).mapv(f64::from);
        let mut hard = store.seed_slice(index).to_owned();

        let explicit = hard.mapv(|p| u8::from(seed::is_labeled(p)));
        let dist = morph::distance_from(explicit.view());
        for ((pos, h), &d) in hard.indexed_iter_mut().zip(dist.iter()) {
            if d > REFINE_SEED_RADIUS {
                *h = if mask::is_foreground(seg[pos]) {
                    seed::SEED_FOREGROUND
                } else {
                    seed::SEED_NONE
                };
            }
        }

        let new_seg = self
            .minimizer
            .minimize(
                scan.view(),
                hard.view(),
                prob.view(),
                self.params.lambda,
                self.params.sigma,
            )
            .map_err(SegError::at(index, Stage::Minimize))?;
        let cleaned = morph::close(morph::open(new_seg.view(), 1).view(), 1);

        let store = self.store.as_mut().expect("体数据刚刚校验过");
        store.write_seg(index, &cleaned);
        debug!("切片 {index} 精修完成");
        Ok(())
    }

    /// 校验起始索引与传播范围, 返回 `(start, lo, hi)`.
    fn validate_range(&self) -> Result<(usize, usize, usize), SegError> {
        if !self.start_done {
            return Err(SegError::StartSliceNotSegmented);
        }
        let store = self.store.as_ref().ok_or(SegError::MissingVolume)?;
        let len = store.len();
        let start = self.start_index.ok_or(SegError::MissingStartIndex)?;
        let (lo, hi) = self.slice_range.unwrap_or((0, len - 1));
        if lo > hi || hi >= len || !(lo..=hi).contains(&start) {
            return Err(SegError::SliceRangeOutOfBound(lo, hi, len));
        }
        Ok((start, lo, hi))
    }

    /// 重置分类器与起始标记 (体数据替换 / 方向变更时).
    fn reset_derived(&mut self) {
        self.reset_derived_classifiers();
        self.start_done = false;
    }

    #[inline]
    fn reset_derived_classifiers(&mut self) {
        self.backward.classifier = self.proto.clone();
        self.forward.classifier = self.proto.clone();
    }

    /// 输出体失效 (参数变更时): 涂鸦与分类器保留.
    fn invalidate_outputs(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.clear_outputs();
        }
        self.start_done = false;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        /// 并发操作部分.
        impl<F, C, M> PropagationEngine<F, C, M>
        where
            F: FeatureExtract + Sync,
            C: Classify + Clone + Send,
            M: MinimizeEnergy + Sync,
        {
            /// 借助 `rayon`, 并行执行两个方向的传播.
            ///
            /// 两个方向互不共享可变状态, 且写回的切片索引集合不相交
            /// (递减与递增序列越过起始切片后永不重叠), 因此可以安全并行.
            /// 并行期间输出体被两个方向共享只读, 结果只能在两个方向
            /// 都完成后统一写回, 进度通知也随之统一发出; 顺序版
            /// [`Self::segmentation_propagate`] 则是逐切片写回.
            pub fn par_segmentation_propagate(&mut self) -> Result<(), SegError> {
                let (start, lo, hi) = self.validate_range()?;
                let store = self.store.as_ref().expect("validate_range 已校验");
                let prior = store.seg_slice(start).to_owned();

                let (extractor, minimizer, params) =
                    (&self.extractor, &self.minimizer, &self.params);
                let (back, fwd) = rayon::join(
                    {
                        let classifier = &mut self.backward.classifier;
                        let prior = prior.clone();
                        move || {
                            run_direction_buffered(
                                extractor,
                                minimizer,
                                classifier,
                                store,
                                params,
                                direction_indices(Direction::Backward, start, lo, hi),
                                prior,
                            )
                        }
                    },
                    {
                        let classifier = &mut self.forward.classifier;
                        move || {
                            run_direction_buffered(
                                extractor,
                                minimizer,
                                classifier,
                                store,
                                params,
                                direction_indices(Direction::Forward, start, lo, hi),
                                prior,
                            )
                        }
                    },
                );

                // 先写回成功方向的结果, 再上报首个错误.
                let (back, fwd) = match (back, fwd) {
                    (Ok(b), Ok(f)) => (b, f),
                    (Err(e), Ok(f)) => {
                        self.write_results(f);
                        return Err(e);
                    }
                    (Ok(b), Err(e)) => {
                        self.write_results(b);
                        return Err(e);
                    }
                    (Err(e), Err(_)) => return Err(e),
                };
                self.write_results(back);
                self.write_results(fwd);
                info!("并行传播完成: 范围 [{lo}, {hi}], 起始 {start}");
                Ok(())
            }

            /// 将一个方向缓存的结果依序写回输出体并逐一发出进度通知.
            fn write_results(&mut self, results: Vec<(usize, SliceOutput)>) {
                let store = self.store.as_mut().expect("调用方保证体数据存在");
                for (index, (seg, prob)) in results.iter() {
                    store.write_seg(*index, seg);
                    store.write_prob(*index, prob);
                    debug!("切片 {index} 写回完成");
                }
                if let Some(cb) = self.progress.as_mut() {
                    for (index, _) in results.iter() {
                        cb(*index);
                    }
                }
            }
        }

        /// [`run_direction`] 的缓存变体, 供并行传播使用: 输出体在
        /// 并行期间只读, 结果按处理顺序缓存, 写回由调用方负责.
        fn run_direction_buffered<F, C, M>(
            extractor: &F,
            minimizer: &M,
            classifier: &mut C,
            store: &VolumeStore,
            params: &Params,
            indices: impl Iterator<Item = usize>,
            mut prior: Array2<u8>,
        ) -> Result<Vec<(usize, SliceOutput)>, SegError>
        where
            F: FeatureExtract,
            C: Classify,
            M: MinimizeEnergy,
        {
            let mut ans = Vec::new();
            for index in indices {
                let (seg, prob) =
                    propagate_step(extractor, minimizer, classifier, store, params, index, &prior)?;
                prior = seg.clone();
                ans.push((index, (seg, prob)));
            }
            Ok(ans)
        }
    }
}

/// 某方向要依次处理的切片索引序列.
#[inline]
fn direction_indices(
    direction: Direction,
    start: usize,
    lo: usize,
    hi: usize,
) -> impl Iterator<Item = usize> {
    match direction {
        Direction::Backward => Either::Left((lo..start).rev()),
        Direction::Forward => Either::Right((start + 1)..=hi),
    }
}

/// 沿一个方向依次执行单切片流水线.
///
/// 方向内严格串行: 每一步以上一步的输出为先验. 每个切片在推进到
/// 下一个切片之前就写回输出体并发出进度通知, 因此中途失败时,
/// 已完成切片的结果保留, 错误携带失败切片的索引与阶段.
fn run_direction<F, C, M>(
    extractor: &F,
    minimizer: &M,
    classifier: &mut C,
    store: &mut VolumeStore,
    progress: &mut Option<Box<dyn FnMut(usize)>>,
    params: &Params,
    indices: impl Iterator<Item = usize>,
    mut prior: Array2<u8>,
) -> Result<(), SegError>
where
    F: FeatureExtract,
    C: Classify,
    M: MinimizeEnergy,
{
    for index in indices {
        let (seg, prob) = propagate_step(extractor, minimizer, classifier, store, params, index, &prior)?;
        store.write_seg(index, &seg);
        store.write_prob(index, &prob);
        debug!("切片 {index} 写回完成");
        if let Some(cb) = progress.as_mut() {
            cb(index);
        }
        prior = seg;
    }
    Ok(())
}

/// 单切片传播流水线.
///
/// 1. 先验退化守卫: 先验前景不足 10 像素时输出全零, 不训练, 继续传播.
/// 2. 由先验掩码计算 ROI 并裁剪强度切片与先验.
/// 3. 当前方向的分类器在裁剪区上预测原始概率.
/// 4. 以裁剪后的先验做形状先验调整.
/// 5. 由裁剪后的先验派生硬约束标签 (`inner_dis` / `outer_dis`).
/// 6. 能量最小化得到裁剪区分割.
/// 7. 由 **新产生的** 分割派生训练标签, 增量重训练该方向分类器.
///    这是分类器随切片间解剖变化自适应的关键.
/// 8. 把裁剪区结果粘贴回全零的完整切片.
fn propagate_step<F, C, M>(
    extractor: &F,
    minimizer: &M,
    classifier: &mut C,
    store: &VolumeStore,
    params: &Params,
    index: usize,
    prior: &Array2<u8>,
) -> Result<SliceOutput, SegError>
where
    F: FeatureExtract,
    C: Classify,
    M: MinimizeEnergy,
{
    let full_shape = store.slice_shape();
    if morph::count_foreground(prior.view()) < MIN_PRIOR_FOREGROUND {
        debug!("切片 {index}: 先验退化, 保持全零且不训练");
        return Ok((Array2::zeros(full_shape), Array2::zeros(full_shape)));
    }

    // 守卫已保证先验非空.
    let roi = Roi::from_mask(prior.view(), ROI_MARGIN).expect("先验非空");
    let scan = roi.crop(store.scan_slice(index));
    let prior_cropped = roi.crop(prior.view());

    let feats = extractor
        .features(scan.view())
        .map_err(SegError::at(index, Stage::Features))?;
    let raw = classifier
        .predict(feats.view())
        .map_err(SegError::at(index, Stage::Predict))?;
    let mut prob = Array2::from_shape_vec(roi.shape(), raw)
        .map_err(|e| SegError::at(index, Stage::Predict)(Box::new(e)))?;

    refine::shape_prior_adjust(&mut prob, prior_cropped.view());

    let labels = derive_labels(prior_cropped.view(), params.inner_dis, params.outer_dis);
    let seg = minimizer
        .minimize(
            scan.view(),
            labels.seed.view(),
            prob.view(),
            params.lambda,
            params.sigma,
        )
        .map_err(SegError::at(index, Stage::Minimize))?;

    // 训练标签派生自新分割, 而非先验.
    let train = derive_labels(seg.view(), params.inner_dis, params.outer_dis).train;
    let (rows, flags) = labeled_rows(&train);
    if !rows.is_empty() {
        let training = feats.select(Axis(0), &rows);
        classifier
            .train(training.view(), &flags)
            .map_err(SegError::at(index, Stage::Train))?;
    }

    Ok((roi.paste(full_shape, &seg), roi.paste(full_shape, &prob)))
}

/// 收集三值标签图中被标注像素的行号 (行优先) 与前景标志.
fn labeled_rows(labels: &Array2<u8>) -> (Vec<usize>, Vec<bool>) {
    let mut rows = Vec::new();
    let mut flags = Vec::new();
    for (i, &p) in labels.iter().enumerate() {
        if seed::is_labeled(p) {
            rows.push(i);
            flags.push(seed::is_foreground(p));
        }
    }
    (rows, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::seed::{SEED_BACKGROUND, SEED_FOREGROUND};
    use crate::error::CollabError;
    use ndarray::{s, Array2, Array3, ArrayView2};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// 在第 `fail_at` 次调用时失败的最小化器, 其余调用委托给内置实现.
    #[derive(Clone)]
    struct FlakyMinimizer {
        inner: IcmMinimizer,
        calls: Cell<usize>,
        fail_at: usize,
    }

    impl FlakyMinimizer {
        fn new(fail_at: usize) -> Self {
            Self {
                inner: IcmMinimizer::default(),
                calls: Cell::new(0),
                fail_at,
            }
        }
    }

    impl MinimizeEnergy for FlakyMinimizer {
        fn minimize(
            &self,
            image: ArrayView2<f32>,
            hard: ArrayView2<u8>,
            prior: ArrayView2<f64>,
            lambda: f64,
            sigma: f64,
        ) -> Result<Array2<u8>, CollabError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n == self.fail_at {
                return Err("求解器资源耗尽".into());
            }
            self.inner.minimize(image, hard, prior, lambda, sigma)
        }
    }

    /// 40 张 100x100 切片; 第 5..=34 张的中心带一个 30x30 亮块.
    fn bright_volume() -> Array3<f32> {
        let mut scan = Array3::<f32>::zeros((40, 100, 100));
        scan.slice_mut(s![5..35, 35..65, 35..65]).fill(100.0);
        scan
    }

    /// 起始切片涂鸦: 亮块中心 10x10 前景方块 + 图像边框一圈背景.
    fn start_seed_slice() -> Array2<u8> {
        let mut labels = Array2::<u8>::zeros((100, 100));
        labels.slice_mut(s![45..55, 45..55]).fill(SEED_FOREGROUND);
        labels.row_mut(0).fill(SEED_BACKGROUND);
        labels.row_mut(99).fill(SEED_BACKGROUND);
        labels.column_mut(0).fill(SEED_BACKGROUND);
        labels.column_mut(99).fill(SEED_BACKGROUND);
        labels
    }

    fn prepared_engine() -> PropagationEngine {
        let mut engine = PropagationEngine::new();
        engine.set_volume(bright_volume());
        engine.set_start_index(20);
        engine.set_seed_slice(20, &start_seed_slice()).unwrap();
        engine
    }

    #[test]
    fn test_start_requires_volume_and_seed() {
        let mut engine = PropagationEngine::new();
        assert!(matches!(
            engine.start_slice_segmentation(),
            Err(SegError::MissingVolume)
        ));

        engine.set_volume(bright_volume());
        assert!(matches!(
            engine.start_slice_segmentation(),
            Err(SegError::MissingStartIndex)
        ));

        engine.set_start_index(20);
        assert!(matches!(
            engine.start_slice_segmentation(),
            Err(SegError::MissingSeed)
        ));

        engine.set_start_index(100);
        assert!(matches!(
            engine.start_slice_segmentation(),
            Err(SegError::StartIndexOutOfBound(100, 40))
        ));
    }

    #[test]
    fn test_start_slice_contains_seeded_square() {
        let mut engine = prepared_engine();
        engine.start_slice_segmentation().unwrap();

        let seg = engine.seg_image().unwrap();
        // 涂鸦方块必须整体落入前景.
        for h in 45..55 {
            for w in 45..55 {
                assert_eq!(seg[(20, h, w)], 1);
            }
        }
        // 远离亮块处是背景.
        assert_eq!(seg[(20, 5, 5)], 0);
        // 其余切片未被触碰.
        assert_eq!(seg.slice(s![..20, .., ..]).iter().map(|&p| p as usize).sum::<usize>(), 0);

        let prob = engine.probability_image().unwrap();
        assert!(prob.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_start_slice_idempotent() {
        let mut engine = prepared_engine();
        engine.start_slice_segmentation().unwrap();
        let seg1 = engine.seg_image().unwrap().to_owned();
        let prob1 = engine.probability_image().unwrap().to_owned();

        engine.start_slice_segmentation().unwrap();
        assert_eq!(engine.seg_image().unwrap(), seg1.view());
        assert_eq!(engine.probability_image().unwrap(), prob1.view());
    }

    #[test]
    fn test_propagate_populates_range_only() {
        let mut engine = prepared_engine();
        engine.set_slice_range(10, 30);
        engine.run_segmentation().unwrap();

        let seg = engine.seg_image().unwrap();
        for z in 10..=30 {
            let cnt = seg
                .slice(s![z, .., ..])
                .iter()
                .filter(|&&p| p == 1)
                .count();
            assert!(cnt > 0, "切片 {z} 应当非空");
        }
        for z in (0..10).chain(31..40) {
            assert_eq!(
                seg.slice(s![z, .., ..]).iter().map(|&p| p as usize).sum::<usize>(),
                0,
                "切片 {z} 应当全零"
            );
        }
    }

    #[test]
    fn test_progress_order_monotonic() {
        let order = Rc::new(RefCell::new(Vec::<usize>::new()));
        let sink = Rc::clone(&order);

        let mut engine = prepared_engine();
        engine.set_slice_range(15, 25);
        engine.on_progress(move |i| sink.borrow_mut().push(i));
        engine.run_segmentation().unwrap();

        let order = order.borrow();
        assert_eq!(order[0], 20);
        // 向后: 19, 18, ..., 15; 向前: 21, ..., 25.
        let backward = &order[1..6];
        let forward = &order[6..];
        assert!(backward.windows(2).all(|w| w[0] == w[1] + 1));
        assert_eq!(backward.first(), Some(&19));
        assert_eq!(backward.last(), Some(&15));
        assert!(forward.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(forward.first(), Some(&21));
        assert_eq!(forward.last(), Some(&25));
    }

    #[test]
    fn test_range_error_before_any_slice() {
        let mut engine = prepared_engine();
        engine.start_slice_segmentation().unwrap();
        engine.set_slice_range(0, 41);

        assert!(matches!(
            engine.segmentation_propagate(),
            Err(SegError::SliceRangeOutOfBound(0, 41, 40))
        ));
        // 除起始切片外没有任何切片被写过.
        let seg = engine.seg_image().unwrap();
        for z in (0..20).chain(21..40) {
            assert_eq!(seg.slice(s![z, .., ..]).iter().map(|&p| p as usize).sum::<usize>(), 0);
        }
    }

    #[test]
    fn test_propagate_requires_start() {
        let mut engine = prepared_engine();
        assert!(matches!(
            engine.segmentation_propagate(),
            Err(SegError::StartSliceNotSegmented)
        ));
    }

    #[test]
    fn test_degenerate_prior_keeps_zero_and_skips_training() {
        let engine = prepared_engine();
        let store = engine.store.as_ref().unwrap();

        // 9 像素先验: 低于 10 像素阈值.
        let mut prior = Array2::<u8>::zeros((100, 100));
        prior.slice_mut(s![48..51, 48..51]).fill(1);

        let mut classifier = OnlineBayes::default();
        let probe = IntensityFeatures
            .features(store.scan_slice(19).slice(s![40..60, 40..60]))
            .unwrap();
        let before = classifier.predict(probe.view()).unwrap();

        let (seg, prob) = propagate_step(
            &IntensityFeatures,
            &IcmMinimizer::default(),
            &mut classifier,
            store,
            &Params::default(),
            19,
            &prior,
        )
        .unwrap();

        assert!(seg.iter().all(|&p| p == 0));
        assert!(prob.iter().all(|&p| p == 0.0));
        // 分类器未被触碰.
        let after = classifier.predict(probe.view()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_failure_mid_direction_keeps_written_slices() {
        // 起始切片占第 1 次 minimize 调用; 向后方向依次为
        // 19 (第 2 次)、18 (第 3 次)、17 (第 4 次, 注入失败).
        let mut engine = PropagationEngine::with_collaborators(
            IntensityFeatures,
            OnlineBayes::default(),
            FlakyMinimizer::new(4),
        );
        engine.set_volume(bright_volume());
        engine.set_start_index(20);
        engine.set_seed_slice(20, &start_seed_slice()).unwrap();
        engine.set_slice_range(15, 25);

        let order = Rc::new(RefCell::new(Vec::<usize>::new()));
        let sink = Rc::clone(&order);
        engine.on_progress(move |i| sink.borrow_mut().push(i));

        let err = engine.run_segmentation().unwrap_err();
        assert!(matches!(
            err,
            SegError::Collaborator {
                slice: 17,
                stage: Stage::Minimize,
                ..
            }
        ));

        // 失败之前完成的切片已经写回, 不因中途失败而丢弃.
        let seg = engine.seg_image().unwrap();
        for z in [20, 19, 18] {
            assert!(
                seg.slice(s![z, .., ..]).iter().any(|&p| p == 1),
                "切片 {z} 在失败前已分割, 必须保留"
            );
        }
        assert_eq!(
            seg.slice(s![17, .., ..]).iter().map(|&p| p as usize).sum::<usize>(),
            0
        );
        // 进度通知逐切片同步发出, 而非方向结束后一次性补发.
        assert_eq!(*order.borrow(), vec![20, 19, 18]);
    }

    #[test]
    fn test_volume_replacement_resets_all_derived_state() {
        let mut engine = prepared_engine();
        engine.set_slice_range(19, 21);
        engine.run_segmentation().unwrap();

        engine.set_volume(bright_volume());

        // 涂鸦与两个输出体全部清空.
        let store = engine.store.as_ref().unwrap();
        assert!(store.seed_slice(20).iter().all(|&p| p == 0));
        assert_eq!(
            engine.seg_image().unwrap().iter().map(|&p| p as usize).sum::<usize>(),
            0
        );
        assert!(engine.probability_image().unwrap().iter().all(|&p| p == 0.0));

        // 两个方向的分类器回到原型状态 (未训练, 预测退化为 0.5).
        let vol = bright_volume();
        let probe = IntensityFeatures
            .features(vol.slice(s![20, 40..60, 40..60]))
            .unwrap();
        for clf in [&engine.backward.classifier, &engine.forward.classifier] {
            assert!(clf.predict(probe.view()).unwrap().iter().all(|&p| p == 0.5));
        }

        // 起始状态同样失效, 需要重新涂鸦并重跑起始分割.
        assert!(matches!(
            engine.segmentation_propagate(),
            Err(SegError::StartSliceNotSegmented)
        ));
        assert!(matches!(
            engine.start_slice_segmentation(),
            Err(SegError::MissingSeed)
        ));
    }

    #[test]
    fn test_param_change_invalidates_outputs_keeps_seeds() {
        let mut engine = prepared_engine();
        engine.set_slice_range(18, 22);
        engine.run_segmentation().unwrap();

        engine.set_lambda(1.0);
        let seg = engine.seg_image().unwrap();
        assert_eq!(seg.iter().map(|&p| p as usize).sum::<usize>(), 0);
        // 涂鸦保留, 可以直接重跑.
        assert!(matches!(
            engine.segmentation_propagate(),
            Err(SegError::StartSliceNotSegmented)
        ));
        engine.run_segmentation().unwrap();
    }

    #[test]
    fn test_add_seeds_and_refine_slice() {
        let mut engine = prepared_engine();
        engine.add_seeds(&[(50, 40), (50, 41)], true).unwrap();
        engine.add_seeds(&[(2, 2)], false).unwrap();
        engine.set_slice_range(19, 21);
        engine.run_segmentation().unwrap();

        engine.refine_slice(20).unwrap();
        let seg = engine.seg_image().unwrap();
        let cnt = seg
            .slice(s![20, .., ..])
            .iter()
            .filter(|&&p| p == 1)
            .count();
        assert!(cnt > 0);
        assert!(seg.iter().all(|&p| p <= 1));

        assert!(matches!(
            engine.refine_slice(64),
            Err(SegError::SliceIndexOutOfBound(64, 40))
        ));
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_par_propagate_matches_sequential() {
        let mut seq = prepared_engine();
        seq.set_slice_range(15, 25);
        seq.run_segmentation().unwrap();
        let expected = seq.seg_image().unwrap().to_owned();

        let mut par = prepared_engine();
        par.set_slice_range(15, 25);
        par.start_slice_segmentation().unwrap();
        par.par_segmentation_propagate().unwrap();
        assert_eq!(par.seg_image().unwrap(), expected.view());
    }
}
