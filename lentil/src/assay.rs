//! Feature-by-cell measurement matrices and named collections of them.
//!
//! An [`Assay`] is read-only once built: every routine downstream
//! produces new matrices rather than touching the caller's data.

use crate::lentil_common::*;

/// Dense or sparse storage of a features x cells matrix
#[derive(Clone, Debug)]
pub enum AssayData {
    Dense(Mat),
    Sparse(CscMat),
}

impl AssayData {
    pub fn nrows(&self) -> usize {
        match self {
            AssayData::Dense(x) => x.nrows(),
            AssayData::Sparse(x) => x.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            AssayData::Dense(x) => x.ncols(),
            AssayData::Sparse(x) => x.ncols(),
        }
    }
}

/// One data set: rows are features, columns are cells, both uniquely
/// named
#[derive(Clone, Debug)]
pub struct Assay {
    data: AssayData,
    row_names: Vec<Box<str>>,
    column_names: Vec<Box<str>>,
    row_index: HashMap<Box<str>, usize>,
    column_index: HashMap<Box<str>, usize>,
}

fn name_index(names: &[Box<str>], what: &str) -> anyhow::Result<HashMap<Box<str>, usize>> {
    let mut index = HashMap::default();
    for (i, x) in names.iter().enumerate() {
        if x.is_empty() {
            return Err(LentilError::contract(format!("empty {} name at {}", what, i)));
        }
        if index.insert(x.clone(), i).is_some() {
            return Err(LentilError::contract(format!("duplicate {} name: {}", what, x)));
        }
    }
    Ok(index)
}

impl Assay {
    pub fn new(
        data: AssayData,
        row_names: Vec<Box<str>>,
        column_names: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        if data.nrows() != row_names.len() || data.ncols() != column_names.len() {
            return Err(LentilError::contract(format!(
                "[{} x {}] assay with {} row names and {} column names",
                data.nrows(),
                data.ncols(),
                row_names.len(),
                column_names.len()
            )));
        }
        let row_index = name_index(&row_names, "feature")?;
        let column_index = name_index(&column_names, "cell")?;
        Ok(Self {
            data,
            row_names,
            column_names,
            row_index,
            column_index,
        })
    }

    pub fn from_dense(
        data: Mat,
        row_names: Vec<Box<str>>,
        column_names: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        Self::new(AssayData::Dense(data), row_names, column_names)
    }

    pub fn from_sparse(
        data: CscMat,
        row_names: Vec<Box<str>>,
        column_names: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        Self::new(AssayData::Sparse(data), row_names, column_names)
    }

    pub fn data(&self) -> &AssayData {
        &self.data
    }

    pub fn num_rows(&self) -> usize {
        self.row_names.len()
    }

    pub fn num_columns(&self) -> usize {
        self.column_names.len()
    }

    pub fn row_names(&self) -> &[Box<str>] {
        &self.row_names
    }

    pub fn column_names(&self) -> &[Box<str>] {
        &self.column_names
    }

    pub fn row_position(&self, name: &str) -> Option<usize> {
        self.row_index.get(name).copied()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.column_index.get(name).copied()
    }

    pub fn has_row(&self, name: &str) -> bool {
        self.row_index.contains_key(name)
    }

    /// Features present in both assays, in the order of `self`
    pub fn shared_features(&self, other: &Assay) -> Vec<Box<str>> {
        self.row_names
            .iter()
            .filter(|x| other.has_row(x))
            .cloned()
            .collect()
    }

    /// Row positions of named features; every name must exist
    pub fn row_positions(&self, features: &[Box<str>]) -> anyhow::Result<Vec<usize>> {
        features
            .iter()
            .map(|x| {
                self.row_position(x).ok_or_else(|| {
                    LentilError::contract(format!("feature {} is not measured here", x))
                })
            })
            .collect()
    }

    /// Column positions of named cells; every name must exist
    pub fn column_positions(&self, cells: &[Box<str>]) -> anyhow::Result<Vec<usize>> {
        cells
            .iter()
            .map(|x| {
                self.column_position(x)
                    .ok_or_else(|| LentilError::contract(format!("cell {} is not in this assay", x)))
            })
            .collect()
    }

    /// `row -> position in rows` lookup over all rows of the assay
    fn row_lookup(&self, rows: &[usize]) -> Vec<Option<usize>> {
        let mut lookup = vec![None; self.num_rows()];
        for (s, &i) in rows.iter().enumerate() {
            lookup[i] = Some(s);
        }
        lookup
    }

    /// Dense copy of the selected rows over all cells
    pub fn dense_rows(&self, rows: &[usize]) -> Mat {
        match &self.data {
            AssayData::Dense(xx) => xx.select_rows(rows.iter()),
            AssayData::Sparse(xx) => {
                let lookup = self.row_lookup(rows);
                let mut ret = Mat::zeros(rows.len(), xx.ncols());
                for (j, col) in xx.col_iter().enumerate() {
                    for (&i, &x_ij) in col.row_indices().iter().zip(col.values()) {
                        if let Some(s) = lookup[i] {
                            ret[(s, j)] = x_ij;
                        }
                    }
                }
                ret
            }
        }
    }

    /// Dense copy of `X[rows, cols]`
    pub fn dense_submatrix(&self, rows: &[usize], cols: &[usize]) -> Mat {
        match &self.data {
            AssayData::Dense(xx) => xx.select_rows(rows.iter()).select_columns(cols.iter()),
            AssayData::Sparse(xx) => {
                let lookup = self.row_lookup(rows);
                let mut ret = Mat::zeros(rows.len(), cols.len());
                for (c, &j) in cols.iter().enumerate() {
                    let col = xx.col(j);
                    for (&i, &x_ij) in col.row_indices().iter().zip(col.values()) {
                        if let Some(s) = lookup[i] {
                            ret[(s, c)] = x_ij;
                        }
                    }
                }
                ret
            }
        }
    }

    /// `X[rows, :]' * W` giving a cells x `W.ncols()` matrix
    ///
    /// Sparse assays are visited column by column without building the
    /// dense row subset.
    pub fn rows_transpose_mul(&self, rows: &[usize], ww: &Mat) -> anyhow::Result<Mat> {
        if ww.nrows() != rows.len() {
            anyhow::bail!(
                "weights have {} rows for {} selected features",
                ww.nrows(),
                rows.len()
            );
        }
        match &self.data {
            AssayData::Dense(xx) => Ok(xx.select_rows(rows.iter()).transpose() * ww),
            AssayData::Sparse(xx) => {
                let lookup = self.row_lookup(rows);
                let kk = ww.ncols();
                let mut ret = Mat::zeros(xx.ncols(), kk);
                for (j, col) in xx.col_iter().enumerate() {
                    for (&i, &x_ij) in col.row_indices().iter().zip(col.values()) {
                        if let Some(s) = lookup[i] {
                            for k in 0..kk {
                                ret[(j, k)] += x_ij * ww[(s, k)];
                            }
                        }
                    }
                }
                Ok(ret)
            }
        }
    }
}

/// Named data sets that partition the cells between them
#[derive(Clone, Debug, Default)]
pub struct AssayCollection {
    names: Vec<Box<str>>,
    assays: Vec<Assay>,
    index: HashMap<Box<str>, usize>,
    cell_owner: HashMap<Box<str>, usize>,
}

impl AssayCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a data set; its name and all of its cells must be new
    pub fn push(&mut self, name: &str, assay: Assay) -> anyhow::Result<()> {
        if name.is_empty() {
            return Err(LentilError::contract("empty dataset name"));
        }
        if self.index.contains_key(name) {
            return Err(LentilError::contract(format!("duplicate dataset {}", name)));
        }

        let d = self.assays.len();
        for cell in assay.column_names() {
            if let Some(&other) = self.cell_owner.get(cell) {
                return Err(LentilError::contract(format!(
                    "cell {} appears in both {} and {}",
                    cell, self.names[other], name
                )));
            }
        }
        for cell in assay.column_names() {
            self.cell_owner.insert(cell.clone(), d);
        }

        self.index.insert(name.into(), d);
        self.names.push(name.into());
        self.assays.push(assay);
        Ok(())
    }

    pub fn from_assays<I, S>(assays: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (S, Assay)>,
        S: AsRef<str>,
    {
        let mut ret = Self::new();
        for (name, assay) in assays {
            ret.push(name.as_ref(), assay)?;
        }
        Ok(ret)
    }

    pub fn len(&self) -> usize {
        self.assays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assays.is_empty()
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    pub fn assays(&self) -> &[Assay] {
        &self.assays
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Assay> {
        self.position(name).map(|d| &self.assays[d])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Box<str>, &Assay)> {
        self.names.iter().zip(self.assays.iter())
    }

    /// Position of the data set that holds this cell
    pub fn dataset_of_cell(&self, cell: &str) -> Option<usize> {
        self.cell_owner.get(cell).copied()
    }

    pub fn num_cells(&self) -> usize {
        self.cell_owner.len()
    }
}
