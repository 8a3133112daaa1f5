use rand::Rng;

/// Column-wise summary statistics
pub trait ColumnStatOps {
    type DVec;

    fn column_means(&self) -> Self::DVec;

    /// sample standard deviation (denominator `n - 1`)
    fn column_sds(&self) -> Self::DVec;
}

/// Centre or scale columns
pub trait MatOps {
    type Mat;

    /// centre and standardize each column; constant columns are only centred
    fn scale_columns_inplace(&mut self);
    fn scale_columns(&self) -> Self::Mat;

    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;
}

/// Operations to sample random matrices from a caller-supplied
/// generator, so that every draw can be reproduced from a seed
pub trait SampleOps {
    type Mat;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;
}
