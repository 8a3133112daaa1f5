use crate::dmatrix_util::fix_svd_signs;
use crate::traits::SampleOps;
use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

type Mat = DMatrix<f32>;
type Vec = DVector<f32>;

const DEFAULT_OVERSAMPLE: usize = 5;

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009) with a seeded Gaussian
/// sketch. Small problems fall back to the exact decomposition. Signs
/// of the singular vectors are fixed so that the largest absolute
/// entry of each left vector is positive, which makes the output a
/// deterministic function of `(X, rank, seed)`.
///
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: Vec,
    v_vectors: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize) -> Self {
        Self {
            max_rank,
            iter,
            seed: 0,
            u_vectors: Mat::zeros(0, 0),
            singular_values: Vec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &Vec {
        &self.singular_values
    }

    pub fn compute(&mut self, xx: &Mat) -> anyhow::Result<()> {
        let nr = xx.nrows();
        let nc = xx.ncols();

        if nr == 0 || nc == 0 {
            anyhow::bail!("SVD on an empty [{} x {}] matrix", nr, nc);
        }

        let full_rank = nr.min(nc);
        let rank = if self.max_rank > 0 {
            self.max_rank.min(full_rank)
        } else {
            full_rank
        };

        let (mut uu, dd, mut vv) = if rank + DEFAULT_OVERSAMPLE >= full_rank {
            debug!("exact svd on [{} x {}]", nr, nc);
            exact_svd(xx, rank)?
        } else {
            let qq = self.rand_subspace_iteration(xx, rank + DEFAULT_OVERSAMPLE);
            let bb = qq.transpose() * xx;
            debug!("final svd on [{} x {}]", bb.nrows(), bb.ncols());
            let (u_b, dd, vv) = exact_svd(&bb, rank)?;
            (qq * u_b, dd, vv)
        };

        fix_svd_signs(&mut uu, &mut vv);

        self.u_vectors = uu;
        self.singular_values = dd;
        self.v_vectors = vv;
        Ok(())
    }

    // Find an orthonormal matrix qq whose range approximates the range of xx
    fn rand_subspace_iteration(&self, xx: &Mat, rank_and_oversample: usize) -> Mat {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let omega = Mat::rnorm(xx.ncols(), rank_and_oversample, &mut rng);

        let mut qq = (xx * omega).qr().q();

        for i in 0..self.iter {
            debug!("power iteration {:>5}", i + 1);
            let ww = (xx.transpose() * &qq).qr().q();
            qq = (xx * ww).qr().q();
        }

        debug!("found Q [{} x {}]", qq.nrows(), qq.ncols());
        qq
    }
}

fn exact_svd(xx: &Mat, rank: usize) -> anyhow::Result<(Mat, Vec, Mat)> {
    let svd = xx.clone().svd(true, true);

    let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) else {
        anyhow::bail!("SVD failed");
    };

    // nalgebra does not promise sorted singular values
    let mut order: std::vec::Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    order.truncate(rank);

    let uu = svd_u.select_columns(order.iter());
    let vv = svd_vt.transpose().select_columns(order.iter());
    let dd = Vec::from_iterator(order.len(), order.iter().map(|&k| svd.singular_values[k]));
    Ok((uu, dd, vv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rsvd(xx: &Mat, rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)> {
        let mut svd = RandomizedSVD::new(rank, 5).with_seed(seed);
        svd.compute(xx)?;
        Ok((
            svd.matrix_u().clone(),
            svd.singular_values().clone(),
            svd.matrix_v().clone(),
        ))
    }

    #[test]
    fn exact_path_recovers_identity_rank() -> anyhow::Result<()> {
        let mut xx = Mat::zeros(8, 8);
        xx.fill_with_identity();
        let (uu, dd, vv) = rsvd(&xx, 3, 1)?;
        assert_eq!(uu.shape(), (8, 3));
        assert_eq!(vv.shape(), (8, 3));
        for k in 0..3 {
            assert_abs_diff_eq!(dd[k], 1.0, epsilon = 1e-5);
        }
        assert_abs_diff_eq!(uu.transpose() * &uu, Mat::identity(3, 3), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn randomized_path_matches_exact_on_low_rank() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let aa = Mat::rnorm(60, 3, &mut rng);
        let bb = Mat::rnorm(3, 40, &mut rng);
        let xx = aa * bb;

        let (_, d_rand, _) = rsvd(&xx, 3, 11)?;
        let (_, d_exact, _) = exact_svd(&xx, 3)?;
        for k in 0..3 {
            assert_abs_diff_eq!(d_rand[k], d_exact[k], epsilon = 1e-2 * d_exact[0]);
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_vectors() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let xx = Mat::rnorm(50, 30, &mut rng);
        let (u1, _, v1) = rsvd(&xx, 4, 5)?;
        let (u2, _, v2) = rsvd(&xx, 4, 5)?;
        assert_eq!(u1, u2);
        assert_eq!(v1, v2);
        Ok(())
    }
}
