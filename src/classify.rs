//! 前景概率分类器.
//!
//! 分类器是有状态、可增量重训练的对象: 传播过程中每处理一个切片,
//! 就用该切片新产生的训练标签对其追加训练, 使其随切片间的解剖变化自适应.

use ndarray::ArrayView2;

use crate::error::CollabError;

/// 分类器契约.
pub trait Classify {
    /// 以特征矩阵 (每行一个样本) 和对应二值标签做一次 (增量) 训练.
    ///
    /// `labels[i]` 为 `true` 表示第 `i` 行是前景样本.
    /// 多次调用之间必须累积, 而非覆盖.
    fn train(&mut self, features: ArrayView2<f64>, labels: &[bool]) -> Result<(), CollabError>;

    /// 预测每行样本的前景概率, 取值范围 `[0, 1]`.
    fn predict(&self, features: ArrayView2<f64>) -> Result<Vec<f64>, CollabError>;
}

/// 单个类别的在线统计量 (逐维 Welford 累积).
#[derive(Clone, Debug, Default)]
struct ClassStat {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl ClassStat {
    /// 追加一个样本.
    fn push(&mut self, sample: &[f64]) {
        if self.mean.is_empty() {
            self.mean = vec![0.0; sample.len()];
            self.m2 = vec![0.0; sample.len()];
        }
        assert_eq!(self.mean.len(), sample.len(), "特征维数不一致");

        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in sample.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    /// 第 `i` 维的总体方差 (含下限, 避免退化高斯).
    ///
    /// 取总体方差而非样本方差: 同一批样本重复训练时统计量不变,
    /// 预测因此保持确定性.
    #[inline]
    fn variance(&self, i: usize) -> f64 {
        const VAR_FLOOR: f64 = 1e-3;
        if self.count == 0 {
            return VAR_FLOOR;
        }
        (self.m2[i] / self.count as f64).max(VAR_FLOOR)
    }

    /// 样本在该类别下的对数似然 (逐维独立高斯).
    fn log_likelihood(&self, sample: &[f64]) -> f64 {
        use std::f64::consts::TAU;

        let mut ll = 0.0;
        for (i, &x) in sample.iter().enumerate() {
            let var = self.variance(i);
            let d = x - self.mean[i];
            ll += -0.5 * (TAU * var).ln() - d * d / (2.0 * var);
        }
        ll
    }
}

/// 内置分类器: 在线朴素贝叶斯 (逐维高斯).
///
/// 每个类别维护逐维均值 / 方差的在线统计量, `train` 在其上累积,
/// 因此天然支持增量重训练. 预测结果对同样的训练数据重复训练不变
/// (均值与方差在样本重复时不变), 保证确定性.
#[derive(Clone, Debug, Default)]
pub struct OnlineBayes {
    foreground: ClassStat,
    background: ClassStat,
}

impl Classify for OnlineBayes {
    fn train(&mut self, features: ArrayView2<f64>, labels: &[bool]) -> Result<(), CollabError> {
        assert_eq!(features.nrows(), labels.len(), "样本数与标签数不一致");

        let mut row = Vec::with_capacity(features.ncols());
        for (sample, &is_fg) in features.outer_iter().zip(labels.iter()) {
            row.clear();
            row.extend(sample.iter().copied());
            if is_fg {
                self.foreground.push(&row);
            } else {
                self.background.push(&row);
            }
        }
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f64>) -> Result<Vec<f64>, CollabError> {
        let n = features.nrows();

        // 某一类别从未见过样本时无从比较, 退化为无信息概率.
        if self.foreground.count == 0 || self.background.count == 0 {
            return Ok(vec![0.5; n]);
        }

        let total = (self.foreground.count + self.background.count) as f64;
        let log_prior_fg = (self.foreground.count as f64 / total).ln();
        let log_prior_bg = (self.background.count as f64 / total).ln();

        let mut ans = Vec::with_capacity(n);
        let mut row = Vec::with_capacity(features.ncols());
        for sample in features.outer_iter() {
            row.clear();
            row.extend(sample.iter().copied());

            let lf = log_prior_fg + self.foreground.log_likelihood(&row);
            let lb = log_prior_bg + self.background.log_likelihood(&row);
            // 数值稳定的 sigmoid(lf - lb).
            let p = if lf >= lb {
                1.0 / (1.0 + (lb - lf).exp())
            } else {
                let e = (lf - lb).exp();
                e / (1.0 + e)
            };
            ans.push(p);
        }
        Ok(ans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Axis};

    fn two_cluster_features() -> (Array2<f64>, Vec<bool>) {
        // 前景在 100 附近, 背景在 0 附近.
        let rows = [
            [100.0, 100.0], [101.0, 99.0], [99.0, 101.0],
            [0.0, 0.0], [1.0, -1.0], [-1.0, 1.0],
        ];
        let mut f = Array2::<f64>::zeros((rows.len(), 2));
        for (i, r) in rows.iter().enumerate() {
            f[(i, 0)] = r[0];
            f[(i, 1)] = r[1];
        }
        (f, vec![true, true, true, false, false, false])
    }

    #[test]
    fn test_online_bayes_separates_clusters() {
        let (f, labels) = two_cluster_features();
        let mut clf = OnlineBayes::default();
        clf.train(f.view(), &labels).unwrap();

        let p = clf.predict(f.view()).unwrap();
        assert!(p[0] > 0.9 && p[1] > 0.9 && p[2] > 0.9);
        assert!(p[3] < 0.1 && p[4] < 0.1 && p[5] < 0.1);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_incremental_training_accumulates() {
        let (f, labels) = two_cluster_features();
        let mut whole = OnlineBayes::default();
        whole.train(f.view(), &labels).unwrap();

        // 分两批训练与整批训练等价 (均值/方差可在线合并).
        let mut split = OnlineBayes::default();
        let first = f.view().split_at(Axis(0), 3).0;
        let second = f.view().split_at(Axis(0), 3).1;
        split.train(first, &labels[..3]).unwrap();
        split.train(second, &labels[3..]).unwrap();

        let pw = whole.predict(f.view()).unwrap();
        let ps = split.predict(f.view()).unwrap();
        for (a, b) in pw.iter().zip(ps.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_untrained_class_gives_uninformative() {
        let (f, _) = two_cluster_features();
        let mut clf = OnlineBayes::default();
        clf.train(f.view(), &[true; 6]).unwrap();
        assert!(clf.predict(f.view()).unwrap().iter().all(|&p| p == 0.5));
    }

    #[test]
    fn test_duplicate_training_is_idempotent_for_prediction() {
        let (f, labels) = two_cluster_features();
        let mut once = OnlineBayes::default();
        once.train(f.view(), &labels).unwrap();
        let p1 = once.predict(f.view()).unwrap();

        let mut twice = once.clone();
        twice.train(f.view(), &labels).unwrap();
        let p2 = twice.predict(f.view()).unwrap();
        for (a, b) in p1.iter().zip(p2.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
