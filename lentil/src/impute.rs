//! Neighbour-based imputation of assay values in the joint embedding.

use crate::assay::{Assay, AssayCollection, AssayData};
use crate::embedding::JointEmbedding;
use crate::knn::{query_named_knn, KnnArgs, NeighbourTable};
use crate::lentil_common::*;
use nalgebra_sparse::CooMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    #[default]
    Mean,
    /// middle value; the average of the two middle ones for even counts
    Median,
}

impl std::str::FromStr for Aggregator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            _ => Err(LentilError::contract(format!("unknown aggregator: {}", s))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputeArgs {
    pub neighbours: usize,
    pub aggregator: Aggregator,
    pub knn_backend: KnnBackend,
}

impl Default for ImputeArgs {
    fn default() -> Self {
        Self {
            neighbours: 5,
            aggregator: Aggregator::default(),
            knn_backend: KnnBackend::default(),
        }
    }
}

/// Imputed values of one data set: its features x the query cells
#[derive(Clone, Debug)]
pub struct ImputedAssay {
    pub dataset: Box<str>,
    pub assay: Assay,
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// `neighbours[q]` are assay columns of the neighbours of query `q`
fn aggregate_dense(xx: &Mat, neighbours: &[Vec<usize>], aggregator: Aggregator) -> Mat {
    let nfeat = xx.nrows();
    let columns: Vec<Vec<f32>> = neighbours
        .par_iter()
        .map(|nbrs| match aggregator {
            Aggregator::Mean => {
                let mut acc = vec![0_f32; nfeat];
                for &j in nbrs {
                    acc.iter_mut()
                        .zip(xx.column(j).iter())
                        .for_each(|(a, &x)| *a += x);
                }
                let denom = nbrs.len().max(1) as f32;
                acc.into_iter().map(|a| a / denom).collect()
            }
            Aggregator::Median => {
                let mut buf = vec![0_f32; nbrs.len()];
                (0..nfeat)
                    .map(|g| {
                        for (b, &j) in buf.iter_mut().zip(nbrs) {
                            *b = xx[(g, j)];
                        }
                        median(&mut buf)
                    })
                    .collect()
            }
        })
        .collect();

    let mut ret = Mat::zeros(nfeat, neighbours.len());
    for (q, col) in columns.into_iter().enumerate() {
        ret.column_mut(q).copy_from_slice(&col);
    }
    ret
}

fn aggregate_sparse(xx: &CscMat, neighbours: &[Vec<usize>], aggregator: Aggregator) -> CscMat {
    let nquery = neighbours.len();
    match aggregator {
        Aggregator::Mean => {
            // X * W where W[j, q] = 1/k for each neighbour j of q
            let mut coo = CooMatrix::new(xx.ncols(), nquery);
            for (q, nbrs) in neighbours.iter().enumerate() {
                let w = 1.0 / nbrs.len().max(1) as f32;
                for &j in nbrs {
                    coo.push(j, q, w);
                }
            }
            let weights = CscMat::from(&coo);
            xx * &weights
        }
        Aggregator::Median => {
            let triplets: Vec<Vec<(usize, f32)>> = neighbours
                .par_iter()
                .map(|nbrs| {
                    let mut observed: HashMap<usize, Vec<f32>> = HashMap::default();
                    for &j in nbrs {
                        let col = xx.col(j);
                        for (&i, &x) in col.row_indices().iter().zip(col.values()) {
                            observed.entry(i).or_default().push(x);
                        }
                    }
                    let mut rows: Vec<(usize, f32)> = observed
                        .into_iter()
                        .filter_map(|(i, mut vals)| {
                            // implicit zeros of the other neighbours
                            vals.resize(nbrs.len(), 0.0);
                            let m = median(&mut vals);
                            (m != 0.0).then_some((i, m))
                        })
                        .collect();
                    rows.sort_unstable_by_key(|&(i, _)| i);
                    rows
                })
                .collect();

            let mut coo = CooMatrix::new(xx.nrows(), nquery);
            for (q, rows) in triplets.into_iter().enumerate() {
                for (i, x) in rows {
                    coo.push(i, q, x);
                }
            }
            CscMat::from(&coo)
        }
    }
}

/// Impute every data set's features for the query cells from their
/// nearest reference cells in the embedding
///
/// * `assays` - data sets holding the observed values
/// * `embedding` - coordinates of both reference and query cells
/// * `reference_cells` - cells to borrow values from
/// * `query_cells` - cells to impute
/// * `args` - see [`ImputeArgs`]
///
/// Only data sets measuring at least one reference cell are imputed,
/// each from its own reference cells. Results keep the dense or sparse
/// storage of the input and follow the order of `assays`.
pub fn impute_embedding(
    assays: &AssayCollection,
    embedding: &JointEmbedding,
    reference_cells: &[Box<str>],
    query_cells: &[Box<str>],
    args: &ImputeArgs,
) -> anyhow::Result<Vec<ImputedAssay>> {
    if args.neighbours == 0 {
        return Err(LentilError::contract("at least one neighbour is needed"));
    }

    let query_coords = embedding.rows_for(query_cells)?;
    embedding.cell_positions(reference_cells)?;

    let mut ret = vec![];

    for (name, assay) in assays.iter() {
        let refs: Vec<Box<str>> = reference_cells
            .iter()
            .filter(|c| assay.column_position(c).is_some())
            .cloned()
            .collect();

        if refs.is_empty() {
            debug!("{}: no reference cells, skipped", name);
            continue;
        }

        let table: NeighbourTable = query_named_knn(
            &embedding.rows_for(&refs)?,
            &refs,
            &query_coords,
            query_cells,
            &KnnArgs::new(args.neighbours).with_backend(args.knn_backend),
        )?;

        let ref_columns = assay.column_positions(&refs)?;
        let neighbours: Vec<Vec<usize>> = (0..table.num_queries())
            .map(|q| table.indices(q).iter().map(|&j| ref_columns[j]).collect())
            .collect();

        let data = match assay.data() {
            AssayData::Dense(xx) => {
                AssayData::Dense(aggregate_dense(xx, &neighbours, args.aggregator))
            }
            AssayData::Sparse(xx) => {
                AssayData::Sparse(aggregate_sparse(xx, &neighbours, args.aggregator))
            }
        };

        info!(
            "imputed {}: {} features x {} cells from {} reference cells",
            name,
            data.nrows(),
            data.ncols(),
            refs.len()
        );

        ret.push(ImputedAssay {
            dataset: name.clone(),
            assay: Assay::new(data, assay.row_names().to_vec(), query_cells.to_vec())?,
        });
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_counts() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn dense_and_sparse_aggregates_agree() {
        let dense = Mat::from_row_slice(3, 4, &[1., 0., 2., 0., 0., 0., 3., 5., 4., 1., 0., 0.]);
        let mut coo = CooMatrix::new(3, 4);
        for i in 0..3 {
            for j in 0..4 {
                if dense[(i, j)] != 0.0 {
                    coo.push(i, j, dense[(i, j)]);
                }
            }
        }
        let sparse = CscMat::from(&coo);
        let neighbours = vec![vec![0, 2], vec![1, 2, 3], vec![3]];

        for aggregator in [Aggregator::Mean, Aggregator::Median] {
            let a = aggregate_dense(&dense, &neighbours, aggregator);
            let s = aggregate_sparse(&sparse, &neighbours, aggregator);
            let mut b = Mat::zeros(3, 3);
            for (i, j, &x) in s.triplet_iter() {
                b[(i, j)] = x;
            }
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }
}
