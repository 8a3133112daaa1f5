use crate::lentil_common::*;

/// Cells x dimensions coordinates shared by all integrated data sets
///
/// Every dimension carries a group tag, the name of the reference data
/// set it was derived from.
#[derive(Clone, Debug)]
pub struct JointEmbedding {
    coords: Mat,
    cell_names: Vec<Box<str>>,
    dim_names: Vec<Box<str>>,
    dim_groups: Vec<Box<str>>,
    cell_index: HashMap<Box<str>, usize>,
}

impl JointEmbedding {
    pub fn new(
        coords: Mat,
        cell_names: Vec<Box<str>>,
        dim_names: Vec<Box<str>>,
        dim_groups: Vec<Box<str>>,
    ) -> anyhow::Result<Self> {
        if coords.nrows() != cell_names.len() {
            return Err(LentilError::contract(format!(
                "{} embedded rows for {} cell names",
                coords.nrows(),
                cell_names.len()
            )));
        }
        if coords.ncols() != dim_names.len() || dim_names.len() != dim_groups.len() {
            return Err(LentilError::contract(format!(
                "{} embedded columns, {} dimension names, {} groups",
                coords.ncols(),
                dim_names.len(),
                dim_groups.len()
            )));
        }

        let mut cell_index = HashMap::default();
        for (i, x) in cell_names.iter().enumerate() {
            if cell_index.insert(x.clone(), i).is_some() {
                return Err(LentilError::contract(format!("duplicate cell {}", x)));
            }
        }

        Ok(Self {
            coords,
            cell_names,
            dim_names,
            dim_groups,
            cell_index,
        })
    }

    pub fn coords(&self) -> &Mat {
        &self.coords
    }

    pub fn num_cells(&self) -> usize {
        self.coords.nrows()
    }

    pub fn num_dims(&self) -> usize {
        self.coords.ncols()
    }

    pub fn cell_names(&self) -> &[Box<str>] {
        &self.cell_names
    }

    pub fn dim_names(&self) -> &[Box<str>] {
        &self.dim_names
    }

    pub fn dim_groups(&self) -> &[Box<str>] {
        &self.dim_groups
    }

    pub fn cell_position(&self, cell: &str) -> Option<usize> {
        self.cell_index.get(cell).copied()
    }

    pub fn contains(&self, cell: &str) -> bool {
        self.cell_index.contains_key(cell)
    }

    /// Row positions of the named cells; every cell must be embedded
    pub fn cell_positions(&self, cells: &[Box<str>]) -> anyhow::Result<Vec<usize>> {
        cells
            .iter()
            .map(|x| {
                self.cell_position(x).ok_or_else(|| {
                    LentilError::contract(format!("cell {} is not in the embedding", x))
                })
            })
            .collect()
    }

    /// Coordinates of the named cells, in the given order
    pub fn rows_for(&self, cells: &[Box<str>]) -> anyhow::Result<Mat> {
        let rows = self.cell_positions(cells)?;
        Ok(self.coords.select_rows(rows.iter()))
    }

    /// Distinct group tags in order of first appearance
    pub fn groups(&self) -> Vec<Box<str>> {
        let mut seen = HashSet::default();
        self.dim_groups
            .iter()
            .filter(|&g| seen.insert(g.as_ref()))
            .cloned()
            .collect()
    }

    /// Same cells and dimensions with new coordinates
    pub fn with_coords(&self, coords: Mat) -> anyhow::Result<Self> {
        Self::new(
            coords,
            self.cell_names.clone(),
            self.dim_names.clone(),
            self.dim_groups.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_follow_requested_order() -> anyhow::Result<()> {
        let coords = Mat::from_row_slice(3, 2, &[1., 2., 3., 4., 5., 6.]);
        let cells: Vec<Box<str>> = vec!["a".into(), "b".into(), "c".into()];
        let dims: Vec<Box<str>> = vec!["r_PC1".into(), "r_PC2".into()];
        let groups: Vec<Box<str>> = vec!["r".into(), "r".into()];
        let emb = JointEmbedding::new(coords, cells, dims, groups)?;

        let sub = emb.rows_for(&["c".into(), "a".into()])?;
        assert_eq!(sub, Mat::from_row_slice(2, 2, &[5., 6., 1., 2.]));
        assert!(emb.rows_for(&["z".into()]).is_err());
        assert_eq!(emb.groups(), vec![Box::<str>::from("r")]);
        Ok(())
    }

    #[test]
    fn duplicate_cells_are_rejected() {
        let cells: Vec<Box<str>> = vec!["a".into(), "a".into()];
        let res = JointEmbedding::new(Mat::zeros(2, 1), cells, vec!["d".into()], vec!["g".into()]);
        assert!(res.is_err());
    }
}
