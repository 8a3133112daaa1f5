//! Per-edge projection models.
//!
//! Every model maps the measured features of a data set to
//! coordinates of some target space. A linear map is stored as
//! `y = x[features]' W + offset`, so centring, scaling, PCA rotation
//! and regression can all be folded into one weight matrix and applied
//! to sparse assays without densifying them.

use crate::assay::Assay;
use crate::lentil_common::*;
use matrix_util::dmatrix_rsvd::RandomizedSVD;
use matrix_util::traits::{ColumnStatOps, MatOps};
use nalgebra::{Cholesky, SymmetricEigen};

const LDA_RIDGE: f32 = 1e-4;
const SOLVE_RTOL: f32 = 1e-6;

/// `y = x[features]' W + offset`
#[derive(Clone, Debug)]
pub struct LinearWeights {
    pub features: Vec<Box<str>>,
    /// features x output dimensions
    pub weights: Mat,
    pub offset: DVec,
}

impl LinearWeights {
    pub fn num_outputs(&self) -> usize {
        self.weights.ncols()
    }

    /// cells x outputs
    pub fn apply(&self, assay: &Assay) -> anyhow::Result<Mat> {
        let rows = assay.row_positions(&self.features)?;
        let mut yy = assay.rows_transpose_mul(&rows, &self.weights)?;
        add_row_offset(&mut yy, &self.offset);
        Ok(yy)
    }

    /// Follow this map with `z -> z' coef + intercept`
    pub fn then_linear(&self, coef: &Mat, intercept: &DVec) -> LinearWeights {
        LinearWeights {
            features: self.features.clone(),
            weights: &self.weights * coef,
            offset: coef.transpose() * &self.offset + intercept,
        }
    }
}

fn add_row_offset(yy: &mut Mat, offset: &DVec) {
    for mut row in yy.row_iter_mut() {
        row += offset.transpose();
    }
}

/// Fisher's linear discriminant projection
#[derive(Clone, Debug)]
pub struct DiscriminantModel {
    /// grand mean of the training inputs
    pub centre: DVec,
    /// inputs x discriminant axes
    pub scaling: Mat,
    pub classes: Vec<Box<str>>,
}

impl DiscriminantModel {
    /// Fit on `xx` (cells x inputs) with one label per row
    ///
    /// The within-class scatter gets a small ridge so that the
    /// whitening step is defined even with more inputs than cells.
    pub fn fit(xx: &Mat, labels: &[Box<str>]) -> anyhow::Result<Self> {
        let nn = xx.nrows();
        let pp = xx.ncols();

        if labels.len() != nn {
            return Err(LentilError::contract(format!(
                "{} labels for {} cells",
                labels.len(),
                nn
            )));
        }

        let mut classes: Vec<Box<str>> = labels.to_vec();
        classes.sort();
        classes.dedup();
        let nclass = classes.len();

        if nclass < 2 {
            return Err(LentilError::contract(
                "a discriminant needs at least two classes",
            ));
        }

        let centre = xx.column_means();

        let mut class_sum = Mat::zeros(pp, nclass);
        let mut class_size = vec![0_usize; nclass];
        let class_of: Vec<usize> = labels
            .iter()
            .map(|x| classes.binary_search(x).unwrap_or_default())
            .collect();

        for (i, &c) in class_of.iter().enumerate() {
            let mut col = class_sum.column_mut(c);
            col += xx.row(i).transpose();
            class_size[c] += 1;
        }

        let mut class_mean = class_sum;
        for (c, mut col) in class_mean.column_iter_mut().enumerate() {
            col /= class_size[c] as f32;
        }

        let mut sw = Mat::zeros(pp, pp);
        for (i, &c) in class_of.iter().enumerate() {
            let r = xx.row(i).transpose() - class_mean.column(c);
            sw += &r * r.transpose();
        }
        sw /= (nn.saturating_sub(nclass)).max(1) as f32;

        let mut sb = Mat::zeros(pp, pp);
        for c in 0..nclass {
            let r = class_mean.column(c) - &centre;
            sb += (&r * r.transpose()) * class_size[c] as f32;
        }
        sb /= (nclass - 1) as f32;

        let ridge = LDA_RIDGE * (sw.trace() / pp.max(1) as f32).max(1.0);
        for j in 0..pp {
            sw[(j, j)] += ridge;
        }

        let Some(chol) = Cholesky::new(sw) else {
            anyhow::bail!("within-class scatter is not positive definite");
        };

        let l_inv = chol
            .l()
            .solve_lower_triangular(&Mat::identity(pp, pp))
            .ok_or_else(|| anyhow::anyhow!("singular within-class scatter"))?;

        let mm = &l_inv * sb * l_inv.transpose();
        let mm = (&mm + mm.transpose()) * 0.5;
        let eig = SymmetricEigen::new(mm);

        let mut order: Vec<usize> = (0..pp).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        order.truncate((nclass - 1).min(pp));

        let mut scaling = l_inv.transpose() * eig.eigenvectors.select_columns(order.iter());

        for mut col in scaling.column_iter_mut() {
            let pivot = col
                .iter()
                .cloned()
                .fold(0_f32, |acc, x| if x.abs() > acc.abs() { x } else { acc });
            if pivot < 0.0 {
                col.neg_mut();
            }
        }

        Ok(Self {
            centre,
            scaling,
            classes,
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.scaling.ncols()
    }

    /// cells x inputs -> cells x discriminant axes
    pub fn transform(&self, xx: &Mat) -> Mat {
        let mut xx = xx.clone();
        for mut row in xx.row_iter_mut() {
            row -= self.centre.transpose();
        }
        xx * &self.scaling
    }
}

/// Model carried along one edge of a path
#[derive(Clone, Debug)]
pub enum ProjectionModel {
    Linear(LinearWeights),
    Discriminant {
        features: Vec<Box<str>>,
        lda: DiscriminantModel,
    },
    /// linear reduction followed by a discriminant on its outputs
    Composite(LinearWeights, DiscriminantModel),
}

impl ProjectionModel {
    pub fn num_outputs(&self) -> usize {
        match self {
            ProjectionModel::Linear(lw) => lw.num_outputs(),
            ProjectionModel::Discriminant { lda, .. } => lda.num_outputs(),
            ProjectionModel::Composite(_, lda) => lda.num_outputs(),
        }
    }

    /// cells of `assay` x model outputs
    pub fn apply(&self, assay: &Assay) -> anyhow::Result<Mat> {
        match self {
            ProjectionModel::Linear(lw) => lw.apply(assay),
            ProjectionModel::Discriminant { features, lda } => {
                let rows = assay.row_positions(features)?;
                Ok(lda.transform(&assay.dense_rows(&rows).transpose()))
            }
            ProjectionModel::Composite(lw, lda) => Ok(lda.transform(&lw.apply(assay)?)),
        }
    }
}

/// Principal components of a subset of features of one assay
pub struct PcaFit {
    /// maps the raw features to the component scores
    pub weights: LinearWeights,
    /// cells x components
    pub scores: Mat,
}

/// Principal components of `assay` restricted to `features`
///
/// Cells are observations. Features are centred, and standardised when
/// `scale` is set; features with zero variance are only centred.
pub fn fit_pca(
    assay: &Assay,
    features: &[Box<str>],
    ncomp: usize,
    scale: bool,
    rsvd_iter: usize,
    seed: u64,
) -> anyhow::Result<PcaFit> {
    let ncells = assay.num_columns();
    if ncells < 2 {
        return Err(LentilError::contract(format!(
            "PCA needs at least two cells, found {}",
            ncells
        )));
    }
    if features.is_empty() || ncomp == 0 {
        return Err(LentilError::contract("PCA needs features and components"));
    }

    let rows = assay.row_positions(features)?;
    let mut xx = assay.dense_rows(&rows).transpose();

    let mu = xx.column_means();
    let sig = if scale {
        let sig = xx.column_sds().map(|s| if s > 0.0 { s } else { 1.0 });
        xx.scale_columns_inplace();
        sig
    } else {
        xx.centre_columns_inplace();
        DVec::from_element(xx.ncols(), 1.0)
    };

    let mut svd = RandomizedSVD::new(ncomp, rsvd_iter).with_seed(seed);
    svd.compute(&xx)?;
    let vv = svd.matrix_v();

    let mut weights = vv.clone();
    for (j, mut row) in weights.row_iter_mut().enumerate() {
        row /= sig[j];
    }
    let offset = -(weights.transpose() * &mu);

    let scores = &xx * vv;

    debug!(
        "PCA: {} cells x {} features -> {} components",
        ncells,
        features.len(),
        scores.ncols()
    );

    Ok(PcaFit {
        weights: LinearWeights {
            features: features.to_vec(),
            weights,
            offset,
        },
        scores,
    })
}

/// Least squares fit of `yy ~ 1 + zz`, returning `(coef, intercept)`
///
/// Solved through the SVD of the design matrix, so rank-deficient
/// designs get the minimum-norm solution.
pub fn fit_least_squares(zz: &Mat, yy: &Mat) -> anyhow::Result<(Mat, DVec)> {
    let nn = zz.nrows();
    if yy.nrows() != nn {
        return Err(LentilError::contract(format!(
            "regressing {} responses on {} predictors",
            yy.nrows(),
            nn
        )));
    }

    let qq = zz.ncols();
    let mut design = Mat::from_element(nn, qq + 1, 1.0);
    design.columns_mut(1, qq).copy_from(zz);

    let svd = design.svd(true, true);
    let dmax = svd.singular_values.max();
    let beta = svd
        .solve(yy, SOLVE_RTOL * dmax.max(f32::MIN_POSITIVE))
        .map_err(|e| anyhow::anyhow!("least squares: {}", e))?;

    let intercept = beta.row(0).transpose();
    let coef = beta.rows(1, qq).into_owned();
    Ok((coef, intercept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("{}{}", prefix, i).into()).collect()
    }

    fn random_assay(nfeat: usize, ncell: usize, seed: u64) -> Assay {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0_f32, 1.0).unwrap();
        let xx = Mat::from_fn(nfeat, ncell, |_, _| normal.sample(&mut rng));
        Assay::from_dense(xx, names("g", nfeat), names("c", ncell)).unwrap()
    }

    #[test]
    fn pca_weights_reproduce_scores() -> anyhow::Result<()> {
        let assay = random_assay(8, 20, 1);
        let features = assay.row_names()[..6].to_vec();
        let pca = fit_pca(&assay, &features, 3, true, 5, 42)?;

        assert_eq!(pca.scores.ncols(), 3);
        let again = pca.weights.apply(&assay)?;
        assert_abs_diff_eq!(again, pca.scores, epsilon = 1e-3);

        // scores are centred
        for col in pca.scores.column_iter() {
            assert_abs_diff_eq!(col.mean(), 0.0, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn least_squares_recovers_exact_linear_map() -> anyhow::Result<()> {
        let zz = Mat::from_row_slice(5, 2, &[1., 0., 0., 1., 1., 1., 2., 1., 3., -1.]);
        let coef_true = Mat::from_row_slice(2, 1, &[2.0, -1.0]);
        let yy = (&zz * &coef_true).add_scalar(0.5);

        let (coef, intercept) = fit_least_squares(&zz, &yy)?;
        assert_abs_diff_eq!(coef, coef_true, epsilon = 1e-3);
        assert_abs_diff_eq!(intercept[0], 0.5, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn composed_weights_equal_sequential_application() -> anyhow::Result<()> {
        let assay = random_assay(5, 12, 3);
        let features = assay.row_names().to_vec();
        let pca = fit_pca(&assay, &features, 2, false, 5, 7)?;

        let coef = Mat::from_row_slice(2, 3, &[1., 2., 3., -1., 0., 1.]);
        let intercept = DVec::from_vec(vec![0.1, 0.2, 0.3]);

        let composed = pca.weights.then_linear(&coef, &intercept);
        let direct = composed.apply(&assay)?;

        let mut sequential = &pca.scores * &coef;
        add_row_offset(&mut sequential, &intercept);
        assert_abs_diff_eq!(direct, sequential, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn discriminant_separates_two_groups() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0_f32, 0.1).unwrap();
        let nn = 20;
        let xx = Mat::from_fn(nn, 3, |i, j| {
            let shift = if i < nn / 2 && j == 0 { 3.0 } else { 0.0 };
            shift + normal.sample(&mut rng)
        });
        let labels: Vec<Box<str>> = (0..nn)
            .map(|i| if i < nn / 2 { "a".into() } else { "b".into() })
            .collect();

        let lda = DiscriminantModel::fit(&xx, &labels)?;
        assert_eq!(lda.num_outputs(), 1);

        let proj = lda.transform(&xx);
        let (a, b) = proj.as_slice().split_at(nn / 2);
        let max_a = a.iter().cloned().fold(f32::MIN, f32::max);
        let min_a = a.iter().cloned().fold(f32::MAX, f32::min);
        let max_b = b.iter().cloned().fold(f32::MIN, f32::max);
        let min_b = b.iter().cloned().fold(f32::MAX, f32::min);
        assert!(max_a < min_b || max_b < min_a);
        Ok(())
    }

    #[test]
    fn discriminant_needs_two_classes() {
        let xx = Mat::zeros(4, 2);
        let labels: Vec<Box<str>> = vec!["a".into(); 4];
        assert!(DiscriminantModel::fit(&xx, &labels).is_err());
    }
}
