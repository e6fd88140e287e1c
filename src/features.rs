//! 逐像素特征提取.

use ndarray::{Array2, ArrayView2};

use crate::error::CollabError;

/// 特征提取器契约: 将一张 2D 强度切片映射为逐像素特征矩阵.
///
/// 输出矩阵每行对应一个像素 (行优先顺序), 列数固定为 [`Self::width`].
pub trait FeatureExtract {
    /// 特征向量的维数.
    fn width(&self) -> usize;

    /// 计算 `slice` 的特征矩阵, 形状为 `(像素数, self.width())`.
    fn features(&self, slice: ArrayView2<f32>) -> Result<Array2<f64>, CollabError>;
}

/// 内置特征提取器: 像素强度 + 3x3 邻域均值 / 最小值 / 最大值.
#[derive(Copy, Clone, Debug, Default)]
pub struct IntensityFeatures;

impl FeatureExtract for IntensityFeatures {
    #[inline]
    fn width(&self) -> usize {
        4
    }

    fn features(&self, slice: ArrayView2<f32>) -> Result<Array2<f64>, CollabError> {
        let (h, w) = slice.dim();
        let mut ans = Array2::<f64>::zeros((h * w, self.width()));

        for ((ph, pw), &center) in slice.indexed_iter() {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;

            for dh in -1isize..=1 {
                for dw in -1isize..=1 {
                    let (nh, nw) = (ph as isize + dh, pw as isize + dw);
                    if nh < 0 || nw < 0 || nh as usize >= h || nw as usize >= w {
                        continue;
                    }
                    let v = slice[(nh as usize, nw as usize)] as f64;
                    sum += v;
                    count += 1;
                    min = min.min(v);
                    max = max.max(v);
                }
            }

            let row = ph * w + pw;
            ans[(row, 0)] = center as f64;
            ans[(row, 1)] = sum / count as f64;
            ans[(row, 2)] = min;
            ans[(row, 3)] = max;
        }
        Ok(ans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_intensity_features_shape_and_rows() {
        let sli = array![[1.0f32, 2.0], [3.0, 4.0]];
        let f = IntensityFeatures.features(sli.view()).unwrap();
        assert_eq!(f.dim(), (4, 4));

        // 像素 (0, 0): 强度 1, 邻域为全图.
        assert_eq!(f[(0, 0)], 1.0);
        assert_eq!(f[(0, 1)], 2.5);
        assert_eq!(f[(0, 2)], 1.0);
        assert_eq!(f[(0, 3)], 4.0);

        // 行优先: 像素 (1, 0) 对应第 2 行.
        assert_eq!(f[(2, 0)], 3.0);
    }
}
