//! Cross-validated misclassification tables and the voting rules
//! behind them.

use crate::lentil_common::*;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};

/// How errors of a column are aggregated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMeasure {
    /// mean over cells
    #[default]
    SimpleError,
    /// mean over classes of the per-class mean
    BalancedError,
}

impl std::str::FromStr for ErrorMeasure {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "simple_error" => Ok(Self::SimpleError),
            "balanced_error" => Ok(Self::BalancedError),
            _ => Err(LentilError::contract(format!("unknown error measure: {}", s))),
        }
    }
}

/// Majority vote; ties go to the tied class seen first in `labels`
///
/// `labels` are expected nearest first, so a tie resolves to the class
/// of the nearest tied neighbour.
pub fn mode_first<'a, I>(labels: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut votes: Vec<(&'a str, usize)> = vec![];
    for x in labels {
        match votes.iter_mut().find(|(c, _)| *c == x) {
            Some((_, n)) => *n += 1,
            None => votes.push((x, 1)),
        }
    }
    // first maximum in order of first appearance
    votes
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (c, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((c, n)),
        })
        .map(|(c, _)| c)
}

/// Ceiling of the geometric mean; `None` for an empty input
pub fn geometric_mean_ceil(values: &[usize]) -> Option<usize> {
    if values.is_empty() {
        return None;
    }
    let log_mean =
        values.iter().map(|&k| (k.max(1) as f64).ln()).sum::<f64>() / values.len() as f64;
    // guard against exp(ln(k)) landing just above an integer
    Some(((log_mean.exp() - 1e-9).ceil() as usize).max(1))
}

/// Position of the smallest non-NaN error; ties go to the first
pub fn best_column(errors: &[f32]) -> Option<usize> {
    errors
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (j, &e)| match best {
            Some((_, b)) if b <= e => best,
            _ => Some((j, e)),
        })
        .map(|(j, _)| j)
}

/// Classification errors of evaluated cells (rows) at candidate k
/// values (columns)
///
/// Entries are `1` for a wrong vote and are stored sparsely. A row is
/// undefined when every neighbour up to the largest k had the same
/// class, since no choice of k can change the vote; undefined rows are
/// kept but do not enter any aggregate.
#[derive(Clone, Debug)]
pub struct ErrorMatrix {
    k_values: Vec<usize>,
    /// evaluated cell (training position) of each row
    cells: Vec<usize>,
    /// true label of each row
    labels: Vec<Box<str>>,
    defined: Vec<bool>,
    errors: CsrMatrix<f32>,
}

impl ErrorMatrix {
    /// * `cells` - training position of each evaluated row
    /// * `labels` - true label of each row
    /// * `neighbour_labels` - neighbour classes of each row, nearest first
    /// * `k_values` - sorted candidate k
    pub fn from_neighbour_classes(
        cells: Vec<usize>,
        labels: Vec<Box<str>>,
        neighbour_labels: &[Vec<&str>],
        k_values: &[usize],
    ) -> anyhow::Result<Self> {
        let nrows = cells.len();
        if labels.len() != nrows || neighbour_labels.len() != nrows {
            return Err(LentilError::contract(format!(
                "{} rows, {} labels, {} neighbour lists",
                nrows,
                labels.len(),
                neighbour_labels.len()
            )));
        }

        let kmax = k_values.iter().copied().max().unwrap_or(0);
        let mut coo = CooMatrix::new(nrows, k_values.len());
        let mut defined = Vec::with_capacity(nrows);

        for (i, nbrs) in neighbour_labels.iter().enumerate() {
            let upto = &nbrs[..kmax.min(nbrs.len())];
            let is_defined = upto.split_first().is_some_and(|(x, rest)| rest.iter().any(|y| y != x));
            defined.push(is_defined);

            for (j, &k) in k_values.iter().enumerate() {
                let vote = mode_first(nbrs[..k.min(nbrs.len())].iter().copied());
                if vote != Some(labels[i].as_ref()) {
                    coo.push(i, j, 1.0);
                }
            }
        }

        Ok(Self {
            k_values: k_values.to_vec(),
            cells,
            labels,
            defined,
            errors: CsrMatrix::from(&coo),
        })
    }

    /// Stack blocks evaluated on the same candidate k values
    pub fn concat(blocks: &[ErrorMatrix]) -> anyhow::Result<Self> {
        let Some(first) = blocks.first() else {
            anyhow::bail!("no error blocks to concatenate");
        };
        let k_values = first.k_values.clone();
        if blocks.iter().any(|b| b.k_values != k_values) {
            anyhow::bail!("error blocks evaluated on different k values");
        }

        let nrows = blocks.iter().map(|b| b.num_rows()).sum();
        let mut coo = CooMatrix::new(nrows, k_values.len());
        let mut cells = Vec::with_capacity(nrows);
        let mut labels = Vec::with_capacity(nrows);
        let mut defined = Vec::with_capacity(nrows);

        let mut offset = 0;
        for b in blocks {
            for (i, j, &v) in b.errors.triplet_iter() {
                coo.push(offset + i, j, v);
            }
            cells.extend_from_slice(&b.cells);
            labels.extend_from_slice(&b.labels);
            defined.extend_from_slice(&b.defined);
            offset += b.num_rows();
        }

        Ok(Self {
            k_values,
            cells,
            labels,
            defined,
            errors: CsrMatrix::from(&coo),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.cells.len()
    }

    pub fn num_defined(&self) -> usize {
        self.defined.iter().filter(|&&d| d).count()
    }

    /// `None` for undefined rows
    pub fn row(&self, row: usize) -> Option<Vec<f32>> {
        if !self.defined[row] {
            return None;
        }
        let mut ret = vec![0.0; self.k_values.len()];
        let r = self.errors.row(row);
        for (&j, &v) in r.col_indices().iter().zip(r.values()) {
            ret[j] = v;
        }
        Some(ret)
    }

    /// Aggregate error of every column over the defined rows; `NaN`
    /// when no row is defined
    pub fn column_error(&self, measure: ErrorMeasure) -> Vec<f32> {
        let ncol = self.k_values.len();
        let defined_rows = (0..self.num_rows()).filter_map(|i| self.row(i).map(|r| (i, r)));

        match measure {
            ErrorMeasure::SimpleError => {
                let mut sum = vec![0_f32; ncol];
                let mut n = 0_usize;
                for (_, r) in defined_rows {
                    sum.iter_mut().zip(r).for_each(|(s, x)| *s += x);
                    n += 1;
                }
                if n == 0 {
                    return vec![f32::NAN; ncol];
                }
                sum.into_iter().map(|s| s / n as f32).collect()
            }
            ErrorMeasure::BalancedError => {
                let mut per_class: Vec<(&str, Vec<f32>, usize)> = vec![];
                for (i, r) in defined_rows {
                    let lab = self.labels[i].as_ref();
                    let pos = match per_class.iter().position(|(c, _, _)| *c == lab) {
                        Some(p) => p,
                        None => {
                            per_class.push((lab, vec![0.0; ncol], 0));
                            per_class.len() - 1
                        }
                    };
                    let (_, sum, n) = &mut per_class[pos];
                    sum.iter_mut().zip(r).for_each(|(s, x)| *s += x);
                    *n += 1;
                }
                if per_class.is_empty() {
                    return vec![f32::NAN; ncol];
                }
                let nclass = per_class.len() as f32;
                (0..ncol)
                    .map(|j| {
                        per_class
                            .iter()
                            .map(|(_, s, n)| s[j] / *n as f32)
                            .sum::<f32>()
                            / nclass
                    })
                    .collect()
            }
        }
    }

    /// The k minimising the aggregate error, preferring the smallest on
    /// ties
    pub fn best_k(&self, measure: ErrorMeasure) -> Option<usize> {
        best_column(&self.column_error(measure)).map(|j| self.k_values[j])
    }

    /// Best k of each of `ncells` training cells from its pooled rows
    ///
    /// A cell has no estimate if it has no defined row, or if its
    /// pooled errors are the same for every k.
    pub fn best_k_per_cell(&self, ncells: usize) -> Vec<Option<usize>> {
        let ncol = self.k_values.len();
        let mut sum = vec![vec![0_f32; ncol]; ncells];
        let mut n = vec![0_usize; ncells];

        for i in 0..self.num_rows() {
            if let Some(r) = self.row(i) {
                let c = self.cells[i];
                sum[c].iter_mut().zip(r).for_each(|(s, x)| *s += x);
                n[c] += 1;
            }
        }

        sum.into_iter()
            .zip(n)
            .map(|(s, n)| {
                if n == 0 {
                    return None;
                }
                let constant = s.iter().all(|&x| x == s[0]);
                if constant {
                    return None;
                }
                best_column(&s).map(|j| self.k_values[j])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    #[test]
    fn ties_go_to_the_nearest_class() {
        assert_eq!(mode_first(["b", "a", "a", "b"]), Some("b"));
        assert_eq!(mode_first(["a", "b", "b"]), Some("b"));
        assert_eq!(mode_first(["c"]), Some("c"));
        assert_eq!(mode_first(Vec::<&str>::new()), None);
    }

    #[test]
    fn geometric_mean_rounds_up() {
        assert_eq!(geometric_mean_ceil(&[3, 3]), Some(3));
        assert_eq!(geometric_mean_ceil(&[1, 4]), Some(2));
        assert_eq!(geometric_mean_ceil(&[2, 5]), Some(4));
        assert_eq!(geometric_mean_ceil(&[]), None);
    }

    #[test]
    fn best_column_prefers_first_minimum() {
        assert_eq!(best_column(&[0.5, 0.2, 0.2]), Some(1));
        assert_eq!(best_column(&[f32::NAN, 0.3, 0.1]), Some(2));
        assert_eq!(best_column(&[f32::NAN]), None);
    }

    fn toy() -> ErrorMatrix {
        // k = 1, 3
        let nbrs: Vec<Vec<&str>> = vec![
            vec!["a", "b", "b"], // a: right at 1, wrong at 3
            vec!["b", "b", "b"], // b: undefined
            vec!["a", "b", "b"], // b: wrong at 1, right at 3
            vec!["b", "a", "a"], // a: wrong at 1, right at 3
        ];
        ErrorMatrix::from_neighbour_classes(
            vec![0, 1, 2, 3],
            boxed(&["a", "b", "b", "a"]),
            &nbrs,
            &[1, 3],
        )
        .unwrap()
    }

    #[test]
    fn undefined_rows_are_skipped() {
        let em = toy();
        assert_eq!(em.num_rows(), 4);
        assert_eq!(em.num_defined(), 3);
        assert_eq!(em.row(1), None);
        assert_eq!(em.row(0), Some(vec![0.0, 1.0]));
    }

    #[test]
    fn simple_and_balanced_aggregates() {
        let em = toy();
        let simple = em.column_error(ErrorMeasure::SimpleError);
        assert_eq!(simple, vec![2.0 / 3.0, 1.0 / 3.0]);

        // class a: rows 0, 3 -> [0.5, 0.5]; class b: row 2 -> [1, 0]
        let balanced = em.column_error(ErrorMeasure::BalancedError);
        assert_eq!(balanced, vec![0.75, 0.25]);
        assert_eq!(em.best_k(ErrorMeasure::BalancedError), Some(3));
    }

    #[test]
    fn per_cell_estimates_pool_repeated_rows() -> anyhow::Result<()> {
        let em = toy();
        let again = ErrorMatrix::from_neighbour_classes(
            vec![0],
            boxed(&["a"]),
            &[vec!["b", "a", "a"]],
            &[1, 3],
        )?;
        let pooled = ErrorMatrix::concat(&[em, again])?;
        assert_eq!(pooled.num_rows(), 5);

        // cell 0 pooled: [0, 1] + [1, 0] -> constant
        let best = pooled.best_k_per_cell(4);
        assert_eq!(best, vec![None, None, Some(3), Some(3)]);
        Ok(())
    }
}
