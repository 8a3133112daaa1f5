//! Named k-nearest-neighbour queries between two point sets.
//!
//! Points are rows of a cells x dimensions matrix. The numeric search
//! is delegated to [`ColumnDict`]; this module keeps track of names
//! and of the boundary cases (self matches, too few points).

use crate::lentil_common::*;
use matrix_util::knn_match::ColumnDict;
use matrix_util::utils::generate_minibatch_intervals;
use rayon::prelude::*;

const DEFAULT_BLOCK_SIZE: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct KnnArgs {
    pub knn: usize,
    /// drop a training point from a query's neighbours when both have
    /// the same name
    pub exclude_self: bool,
    pub backend: KnnBackend,
}

impl KnnArgs {
    pub fn new(knn: usize) -> Self {
        Self {
            knn,
            exclude_self: false,
            backend: KnnBackend::default(),
        }
    }

    pub fn excluding_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    pub fn with_backend(mut self, backend: KnnBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// Training neighbours of each query point, nearest first
#[derive(Clone, Debug)]
pub struct NeighbourTable {
    train_names: Vec<Box<str>>,
    indices: Vec<Vec<usize>>,
    distances: Vec<Vec<f32>>,
    knn: usize,
}

impl NeighbourTable {
    /// number of neighbours per query after capping
    pub fn knn(&self) -> usize {
        self.knn
    }

    pub fn num_queries(&self) -> usize {
        self.indices.len()
    }

    /// Training row positions of the neighbours of query `q`
    pub fn indices(&self, q: usize) -> &[usize] {
        &self.indices[q]
    }

    pub fn distances(&self, q: usize) -> &[f32] {
        &self.distances[q]
    }

    pub fn neighbour_names(&self, q: usize) -> impl Iterator<Item = &Box<str>> + '_ {
        self.indices[q].iter().map(|&j| &self.train_names[j])
    }
}

fn check_points(xx: &Mat, names: &[Box<str>], what: &str) -> anyhow::Result<()> {
    if xx.nrows() != names.len() {
        return Err(LentilError::contract(format!(
            "{} {} points but {} names",
            xx.nrows(),
            what,
            names.len()
        )));
    }
    if xx.iter().any(|x| x.is_infinite()) {
        return Err(LentilError::contract(format!(
            "{} coordinates must be finite or NaN",
            what
        )));
    }
    if xx.ncols() > 0 {
        if let Some(i) = (0..xx.nrows()).find(|&i| xx.row(i).iter().all(|x| x.is_nan())) {
            return Err(LentilError::contract(format!(
                "{} point {} has no observed coordinate",
                what, names[i]
            )));
        }
    }
    Ok(())
}

/// For each row of `query`, the `args.knn` nearest rows of `train` under
/// Euclidean distance
///
/// NaN coordinates (blocks of references a cell cannot reach) are left
/// out of the distance, which is rescaled to the full dimension. If
/// fewer training points are available than requested, the number of
/// neighbours is capped with a warning.
pub fn query_named_knn(
    train: &Mat,
    train_names: &[Box<str>],
    query: &Mat,
    query_names: &[Box<str>],
    args: &KnnArgs,
) -> anyhow::Result<NeighbourTable> {
    check_points(train, train_names, "training")?;
    check_points(query, query_names, "query")?;

    if train.ncols() != query.ncols() {
        return Err(LentilError::contract(format!(
            "training points have {} dimensions, query points {}",
            train.ncols(),
            query.ncols()
        )));
    }

    let dict = ColumnDict::from_dmatrix(&train.transpose(), train_names.to_vec(), args.backend)
        .map_err(|e| LentilError::contract(e.to_string()))?;

    query_dict(&dict, query, query_names, args)
}

/// Same as [`query_named_knn`] against a prebuilt dictionary of
/// training columns
pub fn query_dict(
    dict: &ColumnDict<Box<str>>,
    query: &Mat,
    query_names: &[Box<str>],
    args: &KnnArgs,
) -> anyhow::Result<NeighbourTable> {
    if args.knn == 0 {
        return Err(LentilError::contract("at least one neighbour must be requested"));
    }
    if query.nrows() != query_names.len() {
        return Err(LentilError::contract(format!(
            "{} query points but {} names",
            query.nrows(),
            query_names.len()
        )));
    }
    if !dict.is_empty() && dict.dim() != query.ncols() {
        return Err(LentilError::contract(format!(
            "training points have {} dimensions, query points {}",
            dict.dim(),
            query.ncols()
        )));
    }

    let ntrain = dict.len();

    let self_matches = args.exclude_self
        && query_names
            .iter()
            .any(|x| dict.position(x).is_some());

    let available = if self_matches {
        ntrain.saturating_sub(1)
    } else {
        ntrain
    };

    if available == 0 {
        return Err(LentilError::contract(format!(
            "no training points left to search among ({} in total)",
            ntrain
        )));
    }

    let knn = if args.knn > available {
        warn!(
            "{}; using {}",
            LentilError::NeighborCountExceeded {
                requested: args.knn,
                available,
            },
            available
        );
        available
    } else {
        args.knn
    };

    let nquery = query.nrows();
    let jobs = generate_minibatch_intervals(nquery, DEFAULT_BLOCK_SIZE);

    let blocks = jobs
        .into_par_iter()
        .map(|(lb, ub)| {
            (lb..ub)
                .map(|q| {
                    let point: Vec<f32> = query.row(q).iter().cloned().collect();
                    let self_idx = if args.exclude_self {
                        dict.position(&query_names[q])
                    } else {
                        None
                    };
                    let extra = usize::from(self_idx.is_some());
                    let (indices, distances) = dict.search_by_query_data(&point, knn + extra);
                    indices
                        .into_iter()
                        .zip(distances)
                        .filter(|&(j, _)| Some(j) != self_idx)
                        .take(knn)
                        .unzip::<usize, f32, Vec<usize>, Vec<f32>>()
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let (indices, distances): (Vec<Vec<usize>>, Vec<Vec<f32>>) =
        blocks.into_iter().flatten().unzip();

    let nisolated = distances
        .iter()
        .filter(|d| d.first().is_some_and(|x| x.is_infinite()))
        .count();
    if nisolated > 0 {
        warn!(
            "{} of {} queries share no observed dimension with any training point",
            nisolated, nquery
        );
    }

    debug!("{} queries x {} neighbours", nquery, knn);

    Ok(NeighbourTable {
        train_names: dict.names().to_vec(),
        indices,
        distances,
        knn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cell_names(n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("cell{}", i).into()).collect()
    }

    #[test]
    fn self_query_excluding_self_matches_brute_force() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let nn = 30;
        let xx = Mat::from_fn(nn, 2, |_, _| rng.random::<f32>());
        let names = cell_names(nn);

        let table = query_named_knn(&xx, &names, &xx, &names, &KnnArgs::new(1).excluding_self())?;

        for i in 0..nn {
            let truth = (0..nn)
                .filter(|&j| j != i)
                .min_by(|&a, &b| {
                    let da = (xx.row(i) - xx.row(a)).norm();
                    let db = (xx.row(i) - xx.row(b)).norm();
                    da.total_cmp(&db)
                })
                .unwrap();
            assert_eq!(table.indices(i), &[truth]);
            assert_eq!(table.neighbour_names(i).next().unwrap(), &names[truth]);
        }
        Ok(())
    }

    #[test]
    fn self_query_including_self_returns_self_first() -> anyhow::Result<()> {
        let xx = Mat::from_row_slice(3, 1, &[0.0, 1.0, 5.0]);
        let names = cell_names(3);
        let table = query_named_knn(&xx, &names, &xx, &names, &KnnArgs::new(2))?;
        assert_eq!(table.indices(0), &[0, 1]);
        assert_eq!(table.indices(2), &[2, 1]);
        assert_eq!(table.distances(2), &[0.0, 4.0]);
        Ok(())
    }

    #[test]
    fn knn_is_capped_to_training_size() -> anyhow::Result<()> {
        let train = Mat::from_row_slice(2, 1, &[0.0, 1.0]);
        let query = Mat::from_row_slice(1, 1, &[0.2]);
        let table = query_named_knn(
            &train,
            &cell_names(2),
            &query,
            &["q".into()],
            &KnnArgs::new(10),
        )?;
        assert_eq!(table.knn(), 2);
        assert_eq!(table.indices(0), &[0, 1]);
        Ok(())
    }

    #[test]
    fn nan_blocks_are_left_out_of_distances() -> anyhow::Result<()> {
        let nan = f32::NAN;
        let train = Mat::from_row_slice(
            3,
            4,
            &[0.0, 0.0, nan, nan, 1.0, 1.0, nan, nan, nan, nan, 0.9, 0.9],
        );
        let query = Mat::from_row_slice(1, 4, &[0.9, 0.9, nan, nan]);
        let names = cell_names(3);
        let table = query_named_knn(&train, &names, &query, &["q".into()], &KnnArgs::new(3))?;
        assert_eq!(table.indices(0), &[1, 0, 2]);
        assert!(table.distances(0)[1].is_finite());
        assert!(table.distances(0)[2].is_infinite());

        let unobserved = Mat::from_row_slice(1, 4, &[nan; 4]);
        let err = query_named_knn(&train, &names, &unobserved, &["q".into()], &KnnArgs::new(1));
        assert!(err.is_err());
        Ok(())
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let train = Mat::zeros(2, 2);
        let query = Mat::zeros(1, 3);
        let err = query_named_knn(&train, &cell_names(2), &query, &["q".into()], &KnnArgs::new(1))
            .unwrap_err();
        assert!(err.downcast_ref::<LentilError>().is_some());
    }
}
