//! k-nearest-neighbour label transfer with adaptive neighbourhood
//! sizes.
//!
//! Labelled cells of a joint embedding form the training set. The
//! neighbourhood size k is either fixed, chosen once by repeated
//! cross-validation, chosen per class or per cell from the same
//! cross-validated error table, or derived from local density. Every
//! cell, labelled or not, is then classified by majority vote among its
//! k nearest training cells.

use crate::embedding::JointEmbedding;
use crate::error_matrix::*;
use crate::knn::{query_dict, query_named_knn, KnnArgs, NeighbourTable};
use crate::lentil_common::*;
use indicatif::ParallelProgressIterator;
use matrix_util::knn_match::ColumnDict;
use matrix_util::utils::{partition_by_membership, random_folds};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use crate::error_matrix::ErrorMeasure;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMode {
    /// one k per cell from smoothed cross-validated estimates
    AdaptiveLocal,
    /// one k per class
    AdaptiveLabels,
    /// one cross-validated k for everyone
    UniformOptimised,
    /// the first candidate k for everyone
    #[default]
    UniformFixed,
    /// k shrinking with local density
    AdaptiveDensity,
}

impl std::str::FromStr for ClassificationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "adaptive_local" => Ok(Self::AdaptiveLocal),
            "adaptive_labels" => Ok(Self::AdaptiveLabels),
            "uniform_optimised" => Ok(Self::UniformOptimised),
            "uniform_fixed" => Ok(Self::UniformFixed),
            "adaptive_density" => Ok(Self::AdaptiveDensity),
            _ => Err(LentilError::contract(format!(
                "unknown classification mode: {}",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyArgs {
    pub mode: ClassificationMode,
    /// candidate neighbourhood sizes; only `uniform_fixed` keeps the
    /// given order, the other modes sort them
    pub k_values: Vec<usize>,
    pub error_measure: ErrorMeasure,
    pub cv_folds: usize,
    pub cv_reps: usize,
    pub adaptive_local_nhood: usize,
    pub adaptive_local_smooth: usize,
    pub adaptive_density_max_k: usize,
    pub knn_backend: KnnBackend,
    /// fold assignment
    pub seed: u64,
}

impl Default for ClassifyArgs {
    fn default() -> Self {
        Self {
            mode: ClassificationMode::default(),
            k_values: vec![5],
            error_measure: ErrorMeasure::default(),
            cv_folds: 2,
            cv_reps: 5,
            adaptive_local_nhood: 100,
            adaptive_local_smooth: 10,
            adaptive_density_max_k: 100,
            knn_backend: KnnBackend::default(),
            seed: 42,
        }
    }
}

/// One row per embedded cell, in embedding order
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationOutput {
    pub cell_names: Vec<Box<str>>,
    /// given label; `None` for query cells
    pub input_labels: Vec<Option<Box<str>>>,
    /// vote among the training cells, self included
    pub resubstituted_labels: Vec<Box<str>>,
    /// given label if any, otherwise the vote
    pub predicted_labels: Vec<Box<str>>,
    /// neighbourhood size used for each cell
    pub adaptive_k: Vec<usize>,
}

impl ClassificationOutput {
    pub fn num_cells(&self) -> usize {
        self.cell_names.len()
    }

    /// Fraction of training cells whose resubstituted label differs
    /// from the given one
    pub fn resubstitution_error(&self) -> f32 {
        let (wrong, n) = self
            .input_labels
            .iter()
            .zip(self.resubstituted_labels.iter())
            .filter_map(|(x, y)| x.as_ref().map(|x| x != y))
            .fold((0, 0), |(w, n), e| (w + usize::from(e), n + 1));
        if n == 0 {
            f32::NAN
        } else {
            wrong as f32 / n as f32
        }
    }
}

struct Classifier<'a> {
    embedding: &'a JointEmbedding,
    args: &'a ClassifyArgs,
    /// sorted, distinct candidate k
    k_candidates: Vec<usize>,
    train: Mat,
    train_names: Vec<Box<str>>,
    train_labels: Vec<Box<str>>,
    /// embedding row of each training cell
    train_rows: Vec<usize>,
    /// training position of each embedding row
    train_of_row: Vec<Option<usize>>,
    query_rows: Vec<usize>,
}

fn vote<'a, I>(labels: I) -> Box<str>
where
    I: IntoIterator<Item = &'a str>,
{
    mode_first(labels).unwrap_or_default().into()
}

fn mean_usize<I: IntoIterator<Item = usize>>(values: I) -> Option<f32> {
    let (sum, n) = values
        .into_iter()
        .fold((0_usize, 0_usize), |(s, n), k| (s + k, n + 1));
    (n > 0).then(|| sum as f32 / n as f32)
}

/// `1 + (K - 1)(1 - q)` rounded, within `[1, K]`
fn density_k(kk: usize, q: f32) -> usize {
    let k = 1.0 + (kk.saturating_sub(1)) as f32 * (1.0 - q.clamp(0.0, 1.0));
    (k.round() as usize).clamp(1, kk.max(1))
}

/// Classes without an estimate take the rounded-up geometric mean of
/// the others, or `global` if none has one
fn fill_undefined_classes(class_k: &[Option<usize>], global: usize) -> Vec<usize> {
    let defined: Vec<usize> = class_k.iter().flatten().copied().collect();
    let fallback = geometric_mean_ceil(&defined).unwrap_or(global);
    class_k.iter().map(|k| k.unwrap_or(fallback)).collect()
}

/// A cell without an estimate takes that of its nearest neighbour in
/// `table` that has one
fn borrow_from_neighbours(raw: &[Option<usize>], table: &NeighbourTable) -> Vec<Option<usize>> {
    (0..raw.len())
        .map(|i| raw[i].or_else(|| table.indices(i).iter().find_map(|&j| raw[j])))
        .collect()
}

fn aggregate_errors(errors: &[f32], labels: &[Box<str>], measure: ErrorMeasure) -> f32 {
    match measure {
        ErrorMeasure::SimpleError => errors.iter().sum::<f32>() / errors.len().max(1) as f32,
        ErrorMeasure::BalancedError => {
            let mut per_class: HashMap<&str, (f32, usize)> = HashMap::default();
            for (e, l) in errors.iter().zip(labels) {
                let entry = per_class.entry(l.as_ref()).or_default();
                entry.0 += e;
                entry.1 += 1;
            }
            let nclass = per_class.len().max(1) as f32;
            per_class.values().map(|(s, n)| s / *n as f32).sum::<f32>() / nclass
        }
    }
}

impl<'a> Classifier<'a> {
    fn new(
        embedding: &'a JointEmbedding,
        labels: &LabelMap,
        args: &'a ClassifyArgs,
    ) -> anyhow::Result<Self> {
        if args.k_values.is_empty() || args.k_values.contains(&0) {
            return Err(LentilError::contract(
                "candidate k values must be a non-empty list of positive integers",
            ));
        }

        let mut unknown: Vec<&str> = labels
            .keys()
            .filter(|c| !embedding.contains(c))
            .map(|c| c.as_ref())
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(LentilError::contract(format!(
                "{} labelled cell(s) are not in the embedding, e.g. {}",
                unknown.len(),
                unknown[0]
            )));
        }

        let mut train_rows = vec![];
        let mut query_rows = vec![];
        let mut train_of_row = vec![None; embedding.num_cells()];
        for (i, c) in embedding.cell_names().iter().enumerate() {
            if labels.contains_key(c) {
                train_of_row[i] = Some(train_rows.len());
                train_rows.push(i);
            } else {
                query_rows.push(i);
            }
        }

        if train_rows.is_empty() {
            return Err(LentilError::contract("no labelled cells to learn from"));
        }

        let train = embedding.coords().select_rows(train_rows.iter());
        let train_names: Vec<Box<str>> = train_rows
            .iter()
            .map(|&i| embedding.cell_names()[i].clone())
            .collect();
        let train_labels: Vec<Box<str>> = train_names
            .iter()
            .filter_map(|c| labels.get(c).cloned())
            .collect();

        let mut k_candidates = args.k_values.clone();
        k_candidates.sort_unstable();
        k_candidates.dedup();

        Ok(Self {
            embedding,
            args,
            k_candidates,
            train,
            train_names,
            train_labels,
            train_rows,
            train_of_row,
            query_rows,
        })
    }

    fn ntrain(&self) -> usize {
        self.train_rows.len()
    }

    fn clamp_k(&self, k: usize) -> usize {
        k.clamp(1, self.ntrain())
    }

    fn knn_args(&self, knn: usize) -> KnnArgs {
        KnnArgs::new(knn).with_backend(self.args.knn_backend)
    }

    fn query_part(&self) -> (Mat, Vec<Box<str>>) {
        let coords = self.embedding.coords().select_rows(self.query_rows.iter());
        let names = self
            .query_rows
            .iter()
            .map(|&i| self.embedding.cell_names()[i].clone())
            .collect();
        (coords, names)
    }

    /// neighbours among the training cells; self included for training
    /// queries
    fn train_table(
        &self,
        query: &Mat,
        names: &[Box<str>],
        args: &KnnArgs,
    ) -> anyhow::Result<NeighbourTable> {
        query_named_knn(&self.train, &self.train_names, query, names, args)
    }

    fn neighbour_labels<'t>(
        &'t self,
        table: &'t NeighbourTable,
        q: usize,
    ) -> impl Iterator<Item = &'t str> + 't {
        table
            .indices(q)
            .iter()
            .map(move |&j| self.train_labels[j].as_ref())
    }

    /// Repeated k-fold error table over the training cells, or `None`
    /// if there are too few of them
    fn cross_validated_errors(&self) -> anyhow::Result<Option<ErrorMatrix>> {
        let ntrain = self.ntrain();

        if self.args.cv_folds < 2 {
            return Err(LentilError::contract(format!(
                "cross-validation needs at least 2 folds, got {}",
                self.args.cv_folds
            )));
        }
        if self.args.cv_reps == 0 {
            return Err(LentilError::contract(
                "cross-validation needs at least one repetition",
            ));
        }
        if ntrain < 2 {
            warn!(
                "{}",
                LentilError::UndefinedLocalEstimate(format!(
                    "cross-validation with {} labelled cell(s)",
                    ntrain
                ))
            );
            return Ok(None);
        }

        let nfold = self.args.cv_folds.min(ntrain);
        let mut rng = StdRng::seed_from_u64(self.args.seed);

        let mut grid = vec![];
        for _ in 0..self.args.cv_reps {
            let folds = random_folds(ntrain, nfold, &mut rng);
            for f in 0..nfold {
                let held = folds[f].clone();
                let mut rest: Vec<usize> = folds
                    .iter()
                    .enumerate()
                    .filter(|&(g, _)| g != f)
                    .flat_map(|(_, x)| x.iter().copied())
                    .collect();
                rest.sort_unstable();
                grid.push((held, rest));
            }
        }

        let kmax = self.k_candidates.last().copied().unwrap_or(1);
        let min_rest = grid.iter().map(|(_, r)| r.len()).min().unwrap_or(0);
        if kmax > min_rest {
            warn!(
                "{}; cross-validation votes use all of them",
                LentilError::NeighborCountExceeded {
                    requested: kmax,
                    available: min_rest,
                }
            );
        }

        let njobs = grid.len() as u64;
        let blocks = grid
            .par_iter()
            .progress_count(njobs)
            .map(|(held, rest)| self.evaluate_fold(held, rest, kmax))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let em = ErrorMatrix::concat(&blocks)?;

        info!(
            "cross-validation: {} x {} folds, {} rows ({} defined)",
            self.args.cv_reps,
            nfold,
            em.num_rows(),
            em.num_defined()
        );
        Ok(Some(em))
    }

    fn evaluate_fold(
        &self,
        held: &[usize],
        rest: &[usize],
        kmax: usize,
    ) -> anyhow::Result<ErrorMatrix> {
        let rest_names: Vec<Box<str>> = rest.iter().map(|&j| self.train_names[j].clone()).collect();
        let dict = ColumnDict::from_dmatrix(
            &self.train.select_rows(rest.iter()).transpose(),
            rest_names,
            self.args.knn_backend,
        )?;

        let held_names: Vec<Box<str>> = held.iter().map(|&i| self.train_names[i].clone()).collect();
        let table = query_dict(
            &dict,
            &self.train.select_rows(held.iter()),
            &held_names,
            &self.knn_args(kmax.min(rest.len())),
        )?;

        let neighbour_labels: Vec<Vec<&str>> = (0..held.len())
            .map(|q| {
                table
                    .indices(q)
                    .iter()
                    .map(|&j| self.train_labels[rest[j]].as_ref())
                    .collect()
            })
            .collect();

        ErrorMatrix::from_neighbour_classes(
            held.to_vec(),
            held.iter().map(|&i| self.train_labels[i].clone()).collect(),
            &neighbour_labels,
            &self.k_candidates,
        )
    }

    fn global_best(&self, em: Option<&ErrorMatrix>) -> usize {
        match em.and_then(|e| e.best_k(self.args.error_measure)) {
            Some(k) => self.clamp_k(k),
            None => {
                warn!(
                    "{}; using k = {}",
                    LentilError::UndefinedLocalEstimate("no defined cross-validation error".into()),
                    self.k_candidates[0]
                );
                self.clamp_k(self.k_candidates[0])
            }
        }
    }

    fn uniform_fixed(&self) -> Vec<usize> {
        vec![self.clamp_k(self.args.k_values[0]); self.embedding.num_cells()]
    }

    fn uniform_optimised(&self) -> anyhow::Result<Vec<usize>> {
        let em = self.cross_validated_errors()?;
        let k = self.global_best(em.as_ref());
        info!("optimised k = {}", k);
        Ok(vec![k; self.embedding.num_cells()])
    }

    fn adaptive_labels(&self) -> anyhow::Result<Vec<usize>> {
        let em = self.cross_validated_errors()?;
        let global = self.global_best(em.as_ref());
        let per_cell = em
            .as_ref()
            .map(|e| e.best_k_per_cell(self.ntrain()))
            .unwrap_or_else(|| vec![None; self.ntrain()]);

        let members = partition_by_membership(&self.train_labels);
        let mut classes: Vec<&str> = members.keys().map(|x| x.as_ref()).collect();
        classes.sort_unstable();

        // most frequent per-cell k of each class, smallest on ties
        let class_k: Vec<Option<usize>> = classes
            .iter()
            .map(|&c| {
                let counts: Vec<usize> = self
                    .k_candidates
                    .iter()
                    .map(|&k| {
                        members[c]
                            .iter()
                            .filter(|&&i| per_cell[i] == Some(k))
                            .count()
                    })
                    .collect();
                let (j, &n) = counts
                    .iter()
                    .enumerate()
                    .rev()
                    .max_by_key(|&(_, n)| *n)?;
                (n > 0).then_some(self.k_candidates[j])
            })
            .collect();

        let nundefined = class_k.iter().filter(|k| k.is_none()).count();
        if nundefined > 0 {
            warn!(
                "{}",
                LentilError::UndefinedLocalEstimate(format!(
                    "{} of {} classes have no k estimate",
                    nundefined,
                    classes.len()
                ))
            );
        }
        let class_k: HashMap<&str, usize> = classes
            .iter()
            .zip(fill_undefined_classes(&class_k, global))
            .map(|(&c, k)| (c, self.clamp_k(k)))
            .collect();

        for c in classes.iter() {
            debug!("class {}: k = {}", c, class_k[c]);
        }

        let mut ret = vec![global; self.embedding.num_cells()];
        for (t, &i) in self.train_rows.iter().enumerate() {
            ret[i] = class_k[self.train_labels[t].as_ref()];
        }

        if !self.query_rows.is_empty() {
            let (coords, names) = self.query_part();
            let table = self.train_table(&coords, &names, &self.knn_args(global))?;
            for (q, &i) in self.query_rows.iter().enumerate() {
                let provisional = mode_first(self.neighbour_labels(&table, q)).unwrap_or_default();
                ret[i] = class_k.get(provisional).copied().unwrap_or(global);
            }
        }
        Ok(ret)
    }

    fn adaptive_local(&self) -> anyhow::Result<Vec<usize>> {
        let ntrain = self.ntrain();
        let em = self.cross_validated_errors()?;
        let global = self.global_best(em.as_ref());
        let raw = em
            .as_ref()
            .map(|e| e.best_k_per_cell(ntrain))
            .unwrap_or_else(|| vec![None; ntrain]);

        let nhood = self.args.adaptive_local_nhood.max(1);
        let table = self.train_table(&self.train, &self.train_names, &self.knn_args(nhood))?;

        let filled = borrow_from_neighbours(&raw, &table);

        let nborrowed = (0..ntrain)
            .filter(|&i| raw[i].is_none() && filled[i].is_some())
            .count();
        if nborrowed > 0 {
            warn!(
                "{}",
                LentilError::UndefinedLocalEstimate(format!(
                    "{} cell(s) borrow k from their neighbourhood",
                    nborrowed
                ))
            );
        }

        let nhood_mean: Vec<Option<f32>> = (0..ntrain)
            .map(|i| mean_usize(table.indices(i).iter().filter_map(|&j| filled[j])))
            .collect();

        let smooth = self.args.adaptive_local_smooth.max(1).min(table.knn());
        let smoothed: Vec<usize> = (0..ntrain)
            .map(|i| {
                let vals: Vec<f32> = table.indices(i)[..smooth]
                    .iter()
                    .filter_map(|&j| nhood_mean[j])
                    .collect();
                if vals.is_empty() {
                    global
                } else {
                    let m = vals.iter().sum::<f32>() / vals.len() as f32;
                    self.clamp_k(m.round() as usize)
                }
            })
            .collect();

        let mut ret = vec![global; self.embedding.num_cells()];
        for (t, &i) in self.train_rows.iter().enumerate() {
            ret[i] = smoothed[t];
        }

        if !self.query_rows.is_empty() {
            let (coords, names) = self.query_part();
            let table = self.train_table(&coords, &names, &self.knn_args(smooth))?;
            for (q, &i) in self.query_rows.iter().enumerate() {
                ret[i] = mean_usize(table.indices(q).iter().map(|&j| smoothed[j]))
                    .map(|m| self.clamp_k(m.round() as usize))
                    .unwrap_or(global);
            }
        }
        Ok(ret)
    }

    fn adaptive_density(&self) -> anyhow::Result<Vec<usize>> {
        let ntrain = self.ntrain();
        if ntrain < 2 {
            warn!(
                "{}; using k = {}",
                LentilError::UndefinedLocalEstimate(format!(
                    "density with {} labelled cell(s)",
                    ntrain
                )),
                self.k_candidates[0]
            );
            return Ok(self.uniform_fixed());
        }

        let max_k = self.args.adaptive_density_max_k.max(1);
        let mean_distance = |table: &NeighbourTable| -> Vec<f32> {
            (0..table.num_queries())
                .map(|q| {
                    let d = table.distances(q);
                    d.iter().sum::<f32>() / d.len().max(1) as f32
                })
                .collect()
        };

        let others = self.train_table(
            &self.train,
            &self.train_names,
            &self.knn_args(max_k).excluding_self(),
        )?;
        let density = mean_distance(&others);

        let mut order: Vec<usize> = (0..ntrain).collect();
        order.sort_by(|&a, &b| density[a].total_cmp(&density[b]).then(a.cmp(&b)));
        let denom = (ntrain - 1) as f32;
        let mut quantile = vec![0_f32; ntrain];
        for (rank, &i) in order.iter().enumerate() {
            quantile[i] = rank as f32 / denom;
        }

        let kmax = self.k_candidates.last().copied().unwrap_or(1);
        let loo = self.train_table(
            &self.train,
            &self.train_names,
            &self.knn_args(kmax).excluding_self(),
        )?;

        let scheme_errors: Vec<f32> = self
            .k_candidates
            .iter()
            .map(|&kk| {
                let errors: Vec<f32> = (0..ntrain)
                    .map(|i| {
                        let k = density_k(kk, quantile[i]);
                        let pred = mode_first(self.neighbour_labels(&loo, i).take(k));
                        if pred == Some(self.train_labels[i].as_ref()) {
                            0.0
                        } else {
                            1.0
                        }
                    })
                    .collect();
                aggregate_errors(&errors, &self.train_labels, self.args.error_measure)
            })
            .collect();

        let best = best_column(&scheme_errors).unwrap_or(0);
        let kk = self.k_candidates[best];
        info!(
            "density scheme: K = {} (error {:.4})",
            kk, scheme_errors[best]
        );

        let mut ret = vec![0; self.embedding.num_cells()];
        for (t, &i) in self.train_rows.iter().enumerate() {
            ret[i] = self.clamp_k(density_k(kk, quantile[t]));
        }

        if !self.query_rows.is_empty() {
            let (coords, names) = self.query_part();
            let table = self.train_table(&coords, &names, &self.knn_args(max_k))?;
            for (q, d) in mean_distance(&table).into_iter().enumerate() {
                let denser = density.iter().filter(|&&x| x < d).count();
                let qq = (denser as f32 / denom).min(1.0);
                ret[self.query_rows[q]] = self.clamp_k(density_k(kk, qq));
            }
        }
        Ok(ret)
    }

    fn resubstitute(&self, k_per_cell: &[usize]) -> anyhow::Result<Vec<Box<str>>> {
        let kmax = k_per_cell.iter().copied().max().unwrap_or(1);
        let table = self.train_table(
            self.embedding.coords(),
            self.embedding.cell_names(),
            &self.knn_args(kmax),
        )?;
        Ok((0..self.embedding.num_cells())
            .map(|i| vote(self.neighbour_labels(&table, i).take(k_per_cell[i])))
            .collect())
    }
}

/// Classify every cell of `embedding` from the labelled ones
///
/// * `embedding` - joint coordinates of all cells
/// * `labels` - cell -> class for the training cells; every cell must
///   be embedded
/// * `args` - see [`ClassifyArgs`]
pub fn classify_embedding(
    embedding: &JointEmbedding,
    labels: &LabelMap,
    args: &ClassifyArgs,
) -> anyhow::Result<ClassificationOutput> {
    let clf = Classifier::new(embedding, labels, args)?;

    info!(
        "classification ({:?}): {} labelled, {} query cells",
        args.mode,
        clf.ntrain(),
        clf.query_rows.len()
    );

    let adaptive_k = match args.mode {
        ClassificationMode::UniformFixed => clf.uniform_fixed(),
        ClassificationMode::UniformOptimised => clf.uniform_optimised()?,
        ClassificationMode::AdaptiveLabels => clf.adaptive_labels()?,
        ClassificationMode::AdaptiveLocal => clf.adaptive_local()?,
        ClassificationMode::AdaptiveDensity => clf.adaptive_density()?,
    };

    let resubstituted_labels = clf.resubstitute(&adaptive_k)?;

    let input_labels: Vec<Option<Box<str>>> = (0..embedding.num_cells())
        .map(|i| clf.train_of_row[i].map(|t| clf.train_labels[t].clone()))
        .collect();

    let predicted_labels = input_labels
        .iter()
        .zip(resubstituted_labels.iter())
        .map(|(x, y)| x.clone().unwrap_or_else(|| y.clone()))
        .collect();

    Ok(ClassificationOutput {
        cell_names: embedding.cell_names().to_vec(),
        input_labels,
        resubstituted_labels,
        predicted_labels,
        adaptive_k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// two well separated clusters on a line with a few stragglers
    fn two_clusters(n_per: usize, seed: u64) -> (JointEmbedding, LabelMap) {
        let mut rng = StdRng::seed_from_u64(seed);
        let nn = 2 * n_per;
        let coords = Mat::from_fn(nn, 2, |i, _| {
            let centre = if i < n_per { 0.0 } else { 10.0 };
            centre + rng.random::<f32>()
        });
        let cells: Vec<Box<str>> = (0..nn).map(|i| format!("c{}", i).into()).collect();
        let dims: Vec<Box<str>> = vec!["r_PC1".into(), "r_PC2".into()];
        let groups: Vec<Box<str>> = vec!["r".into(), "r".into()];

        let mut labels = LabelMap::default();
        for (i, c) in cells.iter().enumerate() {
            // every third cell is a query
            if i % 3 != 0 {
                labels.insert(c.clone(), if i < n_per { "x".into() } else { "y".into() });
            }
        }
        (JointEmbedding::new(coords, cells, dims, groups).unwrap(), labels)
    }

    fn query_accuracy(emb: &JointEmbedding, out: &ClassificationOutput, n_per: usize) -> f32 {
        let mut correct = 0;
        let mut total = 0;
        for i in 0..emb.num_cells() {
            if out.input_labels[i].is_none() {
                let truth = if i < n_per { "x" } else { "y" };
                correct += usize::from(out.predicted_labels[i].as_ref() == truth);
                total += 1;
            }
        }
        correct as f32 / total as f32
    }

    #[test]
    fn every_mode_recovers_separated_clusters() -> anyhow::Result<()> {
        let n_per = 15;
        let (emb, labels) = two_clusters(n_per, 3);

        for mode in [
            ClassificationMode::UniformFixed,
            ClassificationMode::UniformOptimised,
            ClassificationMode::AdaptiveLabels,
            ClassificationMode::AdaptiveLocal,
            ClassificationMode::AdaptiveDensity,
        ] {
            let args = ClassifyArgs {
                mode,
                k_values: vec![1, 3, 5],
                adaptive_local_nhood: 8,
                adaptive_local_smooth: 3,
                adaptive_density_max_k: 5,
                ..ClassifyArgs::default()
            };
            let out = classify_embedding(&emb, &labels, &args)?;
            assert_eq!(out.num_cells(), 2 * n_per);
            assert_eq!(query_accuracy(&emb, &out, n_per), 1.0, "{:?}", mode);
            assert!(out.adaptive_k.iter().all(|&k| (1..=5).contains(&k)));
            assert_eq!(out.resubstitution_error(), 0.0);
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_output() -> anyhow::Result<()> {
        let (emb, labels) = two_clusters(12, 8);
        let args = ClassifyArgs {
            mode: ClassificationMode::AdaptiveLocal,
            k_values: vec![1, 2, 4],
            adaptive_local_nhood: 6,
            adaptive_local_smooth: 2,
            ..ClassifyArgs::default()
        };
        let a = classify_embedding(&emb, &labels, &args)?;
        let b = classify_embedding(&emb, &labels, &args)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn unknown_labelled_cells_are_rejected() {
        let (emb, mut labels) = two_clusters(4, 1);
        labels.insert("ghost".into(), "x".into());
        let err = classify_embedding(&emb, &labels, &ClassifyArgs::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LentilError>(),
            Some(LentilError::InputContractViolation(_))
        ));
    }

    #[test]
    fn single_fold_is_rejected() {
        let (emb, labels) = two_clusters(4, 1);
        let args = ClassifyArgs {
            mode: ClassificationMode::UniformOptimised,
            cv_folds: 1,
            ..ClassifyArgs::default()
        };
        assert!(classify_embedding(&emb, &labels, &args).is_err());
    }

    #[test]
    fn fixed_k_is_capped_by_training_size() -> anyhow::Result<()> {
        let (emb, labels) = two_clusters(3, 2);
        let args = ClassifyArgs {
            k_values: vec![50],
            ..ClassifyArgs::default()
        };
        let out = classify_embedding(&emb, &labels, &args)?;
        assert!(out.adaptive_k.iter().all(|&k| k == labels.len()));
        Ok(())
    }

    #[test]
    fn classes_without_estimate_take_geometric_mean() {
        assert_eq!(fill_undefined_classes(&[Some(2), None, Some(8)], 5), vec![2, 4, 8]);
        assert_eq!(fill_undefined_classes(&[Some(3), None], 5), vec![3, 3]);
        assert_eq!(fill_undefined_classes(&[None, None], 5), vec![5, 5]);
    }

    #[test]
    fn cells_without_estimate_borrow_from_nearest() -> anyhow::Result<()> {
        let xx = Mat::from_row_slice(4, 1, &[0.0, 1.0, 9.0, 10.0]);
        let cells: Vec<Box<str>> = (0..4).map(|i| format!("c{}", i).into()).collect();
        let table = query_named_knn(&xx, &cells, &xx, &cells, &KnnArgs::new(4))?;
        let raw = [None, Some(3), None, Some(7)];
        assert_eq!(
            borrow_from_neighbours(&raw, &table),
            vec![Some(3), Some(3), Some(7), Some(7)]
        );
        Ok(())
    }

    #[test]
    fn isolated_class_takes_geometric_mean_of_the_others() -> anyhow::Result<()> {
        // x and y overlap, z sits far away so its error rows are undefined
        let mut rng = StdRng::seed_from_u64(21);
        let n_per = 30;
        let coords = Mat::from_fn(3 * n_per, 2, |i, _| {
            let centre = if i < 2 * n_per { 0.0 } else { 50.0 };
            centre + rng.random::<f32>()
        });
        let cells: Vec<Box<str>> = (0..3 * n_per).map(|i| format!("c{}", i).into()).collect();
        let class_of = |i: usize| match i / n_per {
            0 => "x",
            1 => "y",
            _ => "z",
        };
        let labels: LabelMap = cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), class_of(i).into()))
            .collect();
        let emb = JointEmbedding::new(
            coords,
            cells,
            vec!["r_PC1".into(), "r_PC2".into()],
            vec!["r".into(), "r".into()],
        )?;

        let args = ClassifyArgs {
            mode: ClassificationMode::AdaptiveLabels,
            k_values: vec![1, 3, 5],
            ..ClassifyArgs::default()
        };
        let out = classify_embedding(&emb, &labels, &args)?;

        let k_of = |class: &str| -> Vec<usize> {
            (0..3 * n_per)
                .filter(|&i| class_of(i) == class)
                .map(|i| out.adaptive_k[i])
                .collect()
        };
        let (kx, ky, kz) = (k_of("x"), k_of("y"), k_of("z"));
        assert!(kx.iter().all(|&k| k == kx[0]));
        assert!(ky.iter().all(|&k| k == ky[0]));
        assert!(kz.iter().all(|&k| k == kz[0]));
        assert_eq!(Some(kz[0]), geometric_mean_ceil(&[kx[0], ky[0]]));
        Ok(())
    }

    #[test]
    fn density_k_shrinks_with_sparsity() {
        assert_eq!(density_k(5, 0.0), 5);
        assert_eq!(density_k(5, 1.0), 1);
        assert_eq!(density_k(5, 0.5), 3);
        assert_eq!(density_k(1, 0.3), 1);
    }

    #[test]
    fn modes_parse_from_names() -> anyhow::Result<()> {
        assert_eq!(
            "uniform_optimised".parse::<ClassificationMode>()?,
            ClassificationMode::UniformOptimised
        );
        assert_eq!("balanced_error".parse::<ErrorMeasure>()?, ErrorMeasure::BalancedError);
        assert!("uniform".parse::<ClassificationMode>().is_err());
        Ok(())
    }
}
