use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

const HNSW_SEED: u64 = 42;
const HNSW_EF_SEARCH: usize = 100;

/// Nearest neighbour search strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnnBackend {
    /// brute force over all columns
    #[default]
    Exact,
    /// approximate search in an `instant_distance` HNSW graph
    Hnsw,
}

impl std::str::FromStr for KnnBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "exact" => Ok(Self::Exact),
            "hnsw" => Ok(Self::Hnsw),
            _ => Err(anyhow::anyhow!("unknown knn backend: {}", s)),
        }
    }
}

enum SearchIndex {
    Exact,
    Hnsw(instant_distance::HnswMap<VecPoint, usize>),
}

/// A dictionary of named columns for fast nearest neighbour look-up
///
/// Search results are positions into [`ColumnDict::names`], nearest
/// first. Exact search breaks distance ties by column position.
pub struct ColumnDict<T> {
    index: SearchIndex,
    data_vec: Vec<VecPoint>,
    names: Vec<T>,
    name2index: HashMap<T, usize>,
}

impl<T> ColumnDict<T>
where
    T: Clone + Eq + Hash + Debug + Display,
{
    pub fn names(&self) -> &[T] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.data_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_vec.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.data_vec.first().map(|x| x.data.len()).unwrap_or(0)
    }

    pub fn position(&self, name: &T) -> Option<usize> {
        self.name2index.get(name).copied()
    }

    /// Build a dictionary where each column of `data` (d x n) is a point
    ///
    /// * `data` - coordinates, one column per point
    /// * `names` - unique name of each column
    /// * `backend` - search strategy
    ///
    pub fn from_dmatrix(
        data: &DMatrix<f32>,
        names: Vec<T>,
        backend: KnnBackend,
    ) -> anyhow::Result<Self> {
        let nn = data.ncols();

        if nn != names.len() {
            anyhow::bail!(
                "data has {} columns but {} names were given",
                nn,
                names.len()
            );
        }

        let data_vec: Vec<VecPoint> = data.column_iter().map(|x| x.to_vp()).collect();

        let mut name2index = HashMap::<T, usize>::with_capacity(nn);
        for (j, x) in names.iter().enumerate() {
            if name2index.insert(x.clone(), j).is_some() {
                anyhow::bail!("duplicate column name: {}", x);
            }
        }

        let index = match backend {
            KnnBackend::Exact => SearchIndex::Exact,
            KnnBackend::Hnsw => {
                use instant_distance::Builder;
                let dict = Builder::default()
                    .seed(HNSW_SEED)
                    .ef_search(HNSW_EF_SEARCH)
                    .build(data_vec.clone(), (0..nn).collect());
                SearchIndex::Hnsw(dict)
            }
        };

        Ok(ColumnDict {
            index,
            data_vec,
            names,
            name2index,
        })
    }

    /// k-nearest neighbours of a query vector
    ///
    /// Returns `(positions, distances)` sorted from nearest to farthest,
    /// at most `min(knn, self.len())` of them.
    pub fn search_by_query_data(&self, query: &[f32], knn: usize) -> (Vec<usize>, Vec<f32>) {
        let nquery = knn.min(self.data_vec.len());
        if nquery == 0 {
            return (vec![], vec![]);
        }

        let query = VecPoint {
            data: query.to_vec(),
        };

        if let SearchIndex::Hnsw(dict) = &self.index {
            use instant_distance::Search;
            let mut search = Search::default();
            let (indices, distances): (Vec<usize>, Vec<f32>) = dict
                .search(&query, &mut search)
                .take(nquery)
                .map(|v| (*v.value, v.distance))
                .unzip();

            if indices.len() == nquery {
                return (indices, distances);
            }
            // the graph search ran out of candidates
        }

        self.exact_search(&query, nquery)
    }

    fn exact_search(&self, query: &VecPoint, nquery: usize) -> (Vec<usize>, Vec<f32>) {
        use instant_distance::Point;

        let mut dist: Vec<(f32, usize)> = self
            .data_vec
            .iter()
            .enumerate()
            .map(|(j, x)| (query.distance(x), j))
            .collect();

        let by_distance =
            |a: &(f32, usize), b: &(f32, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));

        if nquery < dist.len() {
            dist.select_nth_unstable_by(nquery - 1, by_distance);
            dist.truncate(nquery);
        }
        dist.sort_by(by_distance);
        dist.into_iter().map(|(d, j)| (j, d)).unzip()
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl<S> MakeVecPoint for nalgebra::Matrix<f32, nalgebra::Dyn, nalgebra::U1, S>
where
    S: nalgebra::RawStorage<f32, nalgebra::Dyn, nalgebra::U1>,
{
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

/// Euclidean distance over the coordinates observed (not NaN) in both
/// points, rescaled to the full dimension; infinite when no coordinate
/// is shared
impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        let dim = self.data.len();
        let (sum, nobs) = self
            .data
            .iter()
            .zip(other.data.iter())
            .filter(|(x, y)| !x.is_nan() && !y.is_nan())
            .fold((0_f32, 0_usize), |(s, n), (x, y)| (s + (x - y) * (x - y), n + 1));

        if nobs == 0 && dim > 0 {
            f32::INFINITY
        } else if nobs < dim {
            (sum * dim as f32 / nobs as f32).sqrt()
        } else {
            sum.sqrt()
        }
    }
}
