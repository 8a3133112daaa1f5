pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
pub use rand_distr::StandardNormal;

use crate::traits::*;

type Mat = DMatrix<f32>;
type DVec = DVector<f32>;

impl SampleOps for Mat {
    type Mat = Self;

    fn runif<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        let rvec = (0..(dd * nn)).map(|_| rng.random::<f32>()).collect();
        Mat::from_vec(dd, nn, rvec)
    }

    fn rnorm<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        let rvec = (0..(dd * nn))
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Mat::from_vec(dd, nn, rvec)
    }
}

impl ColumnStatOps for Mat {
    type DVec = DVec;

    fn column_means(&self) -> DVec {
        let nn = self.nrows().max(1) as f32;
        DVec::from_iterator(self.ncols(), self.column_iter().map(|x| x.sum() / nn))
    }

    fn column_sds(&self) -> DVec {
        let nn = self.nrows();
        let denom = (nn.max(2) - 1) as f32;
        DVec::from_iterator(
            self.ncols(),
            self.column_iter().map(|x| {
                let mu = x.sum() / nn.max(1) as f32;
                (x.iter().map(|&v| (v - mu) * (v - mu)).sum::<f32>() / denom).sqrt()
            }),
        )
    }
}

impl MatOps for Mat {
    type Mat = Self;

    fn scale_columns_inplace(&mut self) {
        let mu = self.column_means();
        let sig = self.column_sds();
        for (j, mut xx_j) in self.column_iter_mut().enumerate() {
            xx_j.add_scalar_mut(-mu[j]);
            if sig[j] > 0.0 {
                xx_j /= sig[j];
            }
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_columns_inplace();
        ret
    }

    fn centre_columns_inplace(&mut self) {
        let mu = self.column_means();
        for (j, mut xx_j) in self.column_iter_mut().enumerate() {
            xx_j.add_scalar_mut(-mu[j]);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_columns_inplace();
        ret
    }
}

/// `[X1, X2, ...]` side by side; all blocks must have the same rows
pub fn concatenate_horizontal(xx_vec: &[Mat]) -> anyhow::Result<Mat> {
    let nrows = xx_vec.first().map(|x| x.nrows()).unwrap_or(0);
    if xx_vec.iter().any(|x| x.nrows() != nrows) {
        anyhow::bail!("all blocks should have the same number of rows");
    }
    let ncols = xx_vec.iter().map(|x| x.ncols()).sum();
    let mut ret = Mat::zeros(nrows, ncols);
    let mut lb = 0;
    for x in xx_vec {
        ret.columns_mut(lb, x.ncols()).copy_from(x);
        lb += x.ncols();
    }
    Ok(ret)
}

/// Flip the sign of each column pair `(U[:,k], V[:,k])` so that the
/// largest absolute entry of `U[:,k]` is positive
pub fn fix_svd_signs(uu: &mut Mat, vv: &mut Mat) {
    for k in 0..uu.ncols().min(vv.ncols()) {
        let pivot = uu
            .column(k)
            .iter()
            .cloned()
            .fold(0_f32, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            uu.column_mut(k).neg_mut();
            vv.column_mut(k).neg_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn scale_columns_gives_zero_mean_unit_sd() {
        let xx = Mat::from_row_slice(4, 2, &[1.0, 5.0, 2.0, 5.0, 3.0, 5.0, 6.0, 5.0]);
        let yy = xx.scale_columns();
        let mu = yy.column_means();
        let sd = yy.column_sds();
        assert_abs_diff_eq!(mu[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sd[0], 1.0, epsilon = 1e-5);
        // constant column is only centred
        assert_abs_diff_eq!(yy.column(1).norm(), 0.0);
    }

    #[test]
    fn concatenate_blocks() -> anyhow::Result<()> {
        let a = Mat::from_element(2, 3, 1.0);
        let b = Mat::from_element(2, 1, 2.0);
        let ab = concatenate_horizontal(&[a.clone(), b])?;
        assert_eq!(ab.shape(), (2, 4));
        assert_eq!(ab[(1, 3)], 2.0);

        assert!(concatenate_horizontal(&[a, Mat::zeros(3, 1)]).is_err());
        Ok(())
    }
}
