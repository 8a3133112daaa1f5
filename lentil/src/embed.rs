//! Stabilised projection of mosaic data sets onto reference embeddings.
//!
//! Each reference data set gets its own principal components (and,
//! given cell labels, linear discriminants). Every other data set is
//! carried into that space along its shortest path in the overlap
//! topology: models are fitted edge by edge from the reference side,
//! each one predicting the coordinates of the next node from the
//! features it shares with the previous one.

use crate::assay::{Assay, AssayCollection};
use crate::embedding::JointEmbedding;
use crate::lentil_common::*;
use crate::projection::*;
use crate::topology::Topology;
use matrix_util::dmatrix_util::concatenate_horizontal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedArgs {
    /// principal components of each reference
    pub ncomponents_reference: usize,
    /// principal components of the shared features along a path
    pub ncomponents_subset: usize,
    /// standardise features before PCA
    pub reference_scale: bool,
    /// reference data set -> features used for its own PCA
    pub reference_features: Option<HashMap<Box<str>, Vec<Box<str>>>>,
    /// fail if some data set cannot reach any reference
    pub require_connected: bool,
    pub rsvd_iter: usize,
    pub seed: u64,
}

impl Default for EmbedArgs {
    fn default() -> Self {
        Self {
            ncomponents_reference: 50,
            ncomponents_subset: 50,
            reference_scale: true,
            reference_features: None,
            require_connected: true,
            rsvd_iter: 5,
            seed: 42,
        }
    }
}

/// Which block of a reference's coordinates a model predicts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Principal,
    Discriminant,
}

impl BlockKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            BlockKind::Principal => "PC",
            BlockKind::Discriminant => "LD",
        }
    }
}

/// Models along the path from one data set to one reference
///
/// `models[i]` maps the features of `path[i]` into the reference
/// coordinates; only `models[0]` reads the source data set, the others
/// produced its training targets.
#[derive(Clone, Debug)]
pub struct PathModel {
    pub source: Box<str>,
    pub reference: Box<str>,
    pub kind: BlockKind,
    pub path: Vec<Box<str>>,
    pub models: Vec<ProjectionModel>,
}

impl PathModel {
    pub fn num_hops(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    /// Coordinates of cells measured on the source data set's features
    pub fn project(&self, assay: &Assay) -> anyhow::Result<Mat> {
        let Some(model) = self.models.first() else {
            anyhow::bail!("empty path model {} -> {}", self.source, self.reference);
        };
        model.apply(assay)
    }
}

pub struct StabMapOutput {
    pub embedding: JointEmbedding,
    /// data sets with no path to any reference
    pub excluded: Vec<Box<str>>,
    pub paths: Vec<PathModel>,
    pub topology: Topology,
}

struct ReferenceFit {
    name: Box<str>,
    pca: PcaFit,
    /// label of each reference cell, if any
    cell_labels: Vec<Option<Box<str>>>,
    /// discriminant on the PCA scores and the resulting coordinates
    lda: Option<(DiscriminantModel, Mat)>,
}

impl ReferenceFit {
    fn kinds(&self) -> Vec<BlockKind> {
        let mut ret = vec![BlockKind::Principal];
        if self.lda.is_some() {
            ret.push(BlockKind::Discriminant);
        }
        ret
    }

    fn features(&self) -> &[Box<str>] {
        &self.pca.weights.features
    }

    fn target(&self, kind: BlockKind) -> anyhow::Result<&Mat> {
        match (kind, &self.lda) {
            (BlockKind::Principal, _) => Ok(&self.pca.scores),
            (BlockKind::Discriminant, Some((_, ld))) => Ok(ld),
            (BlockKind::Discriminant, None) => {
                anyhow::bail!("no discriminant fitted for {}", self.name)
            }
        }
    }

    fn native(&self, kind: BlockKind) -> anyhow::Result<ProjectionModel> {
        match (kind, &self.lda) {
            (BlockKind::Principal, _) => Ok(ProjectionModel::Linear(self.pca.weights.clone())),
            (BlockKind::Discriminant, Some((lda, _))) => Ok(ProjectionModel::Composite(
                self.pca.weights.clone(),
                lda.clone(),
            )),
            (BlockKind::Discriminant, None) => {
                anyhow::bail!("no discriminant fitted for {}", self.name)
            }
        }
    }

    /// positions of labelled reference cells and their labels
    fn labelled(&self) -> (Vec<usize>, Vec<Box<str>>) {
        self.cell_labels
            .iter()
            .enumerate()
            .filter_map(|(i, x)| x.as_ref().map(|l| (i, l.clone())))
            .unzip()
    }
}

fn fit_reference(
    name: &str,
    assay: &Assay,
    reference_labels: Option<&LabelMap>,
    args: &EmbedArgs,
) -> anyhow::Result<ReferenceFit> {
    let features: Vec<Box<str>> = match args
        .reference_features
        .as_ref()
        .and_then(|m| m.get(name))
    {
        Some(selected) => {
            let kept: Vec<Box<str>> = selected
                .iter()
                .filter(|f| assay.has_row(f))
                .cloned()
                .collect();
            if kept.len() < selected.len() {
                warn!(
                    "{}: {} of {} selected features are not measured",
                    name,
                    selected.len() - kept.len(),
                    selected.len()
                );
            }
            if kept.is_empty() {
                return Err(LentilError::contract(format!(
                    "no selected features of reference {} are measured",
                    name
                )));
            }
            kept
        }
        None => assay.row_names().to_vec(),
    };

    let pca = fit_pca(
        assay,
        &features,
        args.ncomponents_reference,
        args.reference_scale,
        args.rsvd_iter,
        args.seed,
    )?;

    info!(
        "reference {}: {} cells, {} features, {} components",
        name,
        assay.num_columns(),
        features.len(),
        pca.scores.ncols()
    );

    let cell_labels: Vec<Option<Box<str>>> = match reference_labels {
        Some(labels) => assay
            .column_names()
            .iter()
            .map(|c| labels.get(c).cloned())
            .collect(),
        None => vec![None; assay.num_columns()],
    };

    let mut fit = ReferenceFit {
        name: name.into(),
        pca,
        cell_labels,
        lda: None,
    };

    if reference_labels.is_some() {
        let (rows, labels) = fit.labelled();
        let nclass = labels.iter().collect::<HashSet<_>>().len();
        if nclass < 2 {
            warn!(
                "reference {}: {} labelled class(es); skipping the discriminant block",
                name, nclass
            );
        } else {
            let lda = DiscriminantModel::fit(&fit.pca.scores.select_rows(rows.iter()), &labels)?;
            let ld = lda.transform(&fit.pca.scores);
            info!("reference {}: {} discriminants", name, ld.ncols());
            fit.lda = Some((lda, ld));
        }
    }

    Ok(fit)
}

/// Model predicting `target` (coordinates of `hub` cells) from the
/// `shared` features of `hub`
fn fit_edge_model(
    hub: &Assay,
    shared: &[Box<str>],
    target: &Mat,
    discriminant_at: Option<&ReferenceFit>,
    args: &EmbedArgs,
) -> anyhow::Result<ProjectionModel> {
    if let Some(rf) = discriminant_at {
        let (rows, labels) = rf.labelled();

        if shared.len() > args.ncomponents_subset {
            let pca = fit_pca(
                hub,
                shared,
                args.ncomponents_subset,
                args.reference_scale,
                args.rsvd_iter,
                args.seed,
            )?;
            let lda = DiscriminantModel::fit(&pca.scores.select_rows(rows.iter()), &labels)?;
            return Ok(ProjectionModel::Composite(pca.weights, lda));
        }

        let feature_rows = hub.row_positions(shared)?;
        let xx = hub.dense_submatrix(&feature_rows, &rows).transpose();
        let lda = DiscriminantModel::fit(&xx, &labels)?;
        return Ok(ProjectionModel::Discriminant {
            features: shared.to_vec(),
            lda,
        });
    }

    let pca = fit_pca(
        hub,
        shared,
        args.ncomponents_subset,
        args.reference_scale,
        args.rsvd_iter,
        args.seed,
    )?;
    let (coef, intercept) = fit_least_squares(&pca.scores, target)?;
    Ok(ProjectionModel::Linear(
        pca.weights.then_linear(&coef, &intercept),
    ))
}

/// Fit the models along `path` (source first, reference last) and
/// return them with the source's coordinates
fn fit_path(
    assays: &AssayCollection,
    rf: &ReferenceFit,
    kind: BlockKind,
    path: &[usize],
    args: &EmbedArgs,
) -> anyhow::Result<(PathModel, Mat)> {
    let nhops = path.len() - 1;
    let mut target = rf.target(kind)?.clone();
    let mut models = Vec::with_capacity(nhops.max(1));

    if nhops == 0 {
        models.push(rf.native(kind)?);
    }

    for i in (0..nhops).rev() {
        let src = &assays.assays()[path[i]];
        let hub = &assays.assays()[path[i + 1]];
        let at_reference = i + 1 == nhops;

        let model = if at_reference && rf.features().iter().all(|f| src.has_row(f)) {
            rf.native(kind)?
        } else {
            let shared = hub.shared_features(src);
            let discriminant_at =
                (at_reference && kind == BlockKind::Discriminant).then_some(rf);
            fit_edge_model(hub, &shared, &target, discriminant_at, args)?
        };

        target = model.apply(src)?;
        models.push(model);
    }
    models.reverse();

    let names = assays.names();
    let path_model = PathModel {
        source: names[path[0]].clone(),
        reference: rf.name.clone(),
        kind,
        path: path.iter().map(|&v| names[v].clone()).collect(),
        models,
    };
    Ok((path_model, target))
}

/// Project every data set of `assays` onto the coordinates of each of
/// the `references`
///
/// * `assays` - data sets partitioning the cells
/// * `references` - names of the anchoring data sets
/// * `reference_labels` - optional cell labels; references with two or
///   more labelled classes get an additional discriminant block
/// * `args` - see [`EmbedArgs`]
///
/// The joint embedding has one row per cell of every data set that can
/// reach at least one reference; the columns are the concatenated
/// blocks `{reference}_PC{j}` (and `{reference}_LD{j}`). Cells that
/// cannot reach a particular reference get `NaN` in its blocks.
pub fn stab_map(
    assays: &AssayCollection,
    references: &[&str],
    reference_labels: Option<&LabelMap>,
    args: &EmbedArgs,
) -> anyhow::Result<StabMapOutput> {
    if assays.is_empty() {
        return Err(LentilError::contract("no data sets to integrate"));
    }
    if references.is_empty() {
        return Err(LentilError::contract("at least one reference is needed"));
    }

    let mut ref_ids = Vec::with_capacity(references.len());
    for r in references {
        let Some(pos) = assays.position(r) else {
            return Err(LentilError::contract(format!("unknown reference {}", r)));
        };
        if ref_ids.contains(&pos) {
            return Err(LentilError::contract(format!("reference {} given twice", r)));
        }
        ref_ids.push(pos);
    }

    let topology = Topology::from_assays(assays);

    let unreachable = topology.unreachable_from(&ref_ids);
    if !unreachable.is_empty() && args.require_connected {
        topology.check_reachable(&ref_ids)?;
    }

    let excluded: Vec<Box<str>> = unreachable
        .iter()
        .map(|&d| assays.names()[d].clone())
        .collect();
    for d in excluded.iter() {
        warn!("excluding {}: no path to any reference", d);
    }

    let included: Vec<usize> = (0..assays.len())
        .filter(|d| !unreachable.contains(d))
        .collect();

    let mut cell_names: Vec<Box<str>> = vec![];
    let mut row_offset = vec![0; assays.len()];
    for &d in included.iter() {
        row_offset[d] = cell_names.len();
        cell_names.extend(assays.assays()[d].column_names().iter().cloned());
    }
    let ncells = cell_names.len();

    let mut blocks: Vec<Mat> = vec![];
    let mut dim_names: Vec<Box<str>> = vec![];
    let mut dim_groups: Vec<Box<str>> = vec![];
    let mut paths: Vec<PathModel> = vec![];

    for &r in ref_ids.iter() {
        let r_name = &assays.names()[r];
        let rf = fit_reference(r_name, &assays.assays()[r], reference_labels, args)?;

        let routes: Vec<(usize, Vec<usize>)> = included
            .iter()
            .filter_map(|&d| match topology.shortest_path(d, r) {
                Some(path) => Some((d, path)),
                None => {
                    warn!(
                        "{}",
                        LentilError::UnreachableDataset {
                            dataset: assays.names()[d].clone(),
                            reference: r_name.clone(),
                        }
                    );
                    None
                }
            })
            .collect();

        for kind in rf.kinds() {
            let fitted = routes
                .par_iter()
                .map(|(d, path)| {
                    fit_path(assays, &rf, kind, path, args).map(|(pm, coords)| (*d, pm, coords))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let ndim = rf.target(kind)?.ncols();
            let mut block = Mat::from_element(ncells, ndim, f32::NAN);

            for (d, pm, coords) in fitted {
                debug!(
                    "{} -> {} ({}): {} hop(s)",
                    pm.source,
                    pm.reference,
                    kind.suffix(),
                    pm.num_hops()
                );
                let nout = pm.models.first().map(|m| m.num_outputs()).unwrap_or(0);
                if nout > ndim || coords.ncols() != nout {
                    anyhow::bail!(
                        "{} -> {}: model gives {} dimensions for a block of {}",
                        pm.source,
                        pm.reference,
                        coords.ncols(),
                        ndim
                    );
                }
                if nout < ndim {
                    // fewer discriminants reachable through the shared features
                    warn!(
                        "{} -> {}: only {} of {} {} dimensions, the rest are NaN",
                        pm.source,
                        pm.reference,
                        nout,
                        ndim,
                        kind.suffix()
                    );
                }
                block
                    .view_mut((row_offset[d], 0), (coords.nrows(), nout))
                    .copy_from(&coords);
                paths.push(pm);
            }

            dim_names.extend(
                (1..=ndim).map(|j| format!("{}_{}{}", r_name, kind.suffix(), j).into()),
            );
            dim_groups.extend(std::iter::repeat_n(r_name.clone(), ndim));
            blocks.push(block);
        }
    }

    let coords = concatenate_horizontal(&blocks)?;
    let embedding = JointEmbedding::new(coords, cell_names, dim_names, dim_groups)?;

    info!(
        "joint embedding: {} cells x {} dimensions from {} reference(s)",
        embedding.num_cells(),
        embedding.num_dims(),
        ref_ids.len()
    );

    Ok(StabMapOutput {
        embedding,
        excluded,
        paths,
        topology,
    })
}

/// Rescale each group of dimensions so that its summed absolute value
/// is `factor * weight / sum(weights)`
///
/// Groups missing from `weights` are an error; `None` weighs all groups
/// equally. Non-finite entries are ignored when summing.
pub fn reweight_embedding(
    embedding: &JointEmbedding,
    weights: Option<&HashMap<Box<str>, f32>>,
    factor: f32,
) -> anyhow::Result<JointEmbedding> {
    let groups = embedding.groups();

    let group_weights: Vec<f32> = match weights {
        Some(w) => groups
            .iter()
            .map(|g| {
                w.get(g).copied().ok_or_else(|| {
                    LentilError::contract(format!("no weight given for group {}", g))
                })
            })
            .collect::<anyhow::Result<_>>()?,
        None => vec![1.0; groups.len()],
    };

    let total: f32 = group_weights.iter().sum();
    if !(total > 0.0) || group_weights.iter().any(|&w| w < 0.0) {
        return Err(LentilError::contract(
            "group weights must be non-negative with a positive sum",
        ));
    }

    let mut coords = embedding.coords().clone();

    for (g, w) in groups.iter().zip(group_weights) {
        let columns: Vec<usize> = embedding
            .dim_groups()
            .iter()
            .enumerate()
            .filter(|(_, x)| *x == g)
            .map(|(j, _)| j)
            .collect();

        let mass: f32 = columns
            .iter()
            .map(|&j| {
                coords
                    .column(j)
                    .iter()
                    .filter(|x| x.is_finite())
                    .map(|x| x.abs())
                    .sum::<f32>()
            })
            .sum();

        if mass > 0.0 {
            let scale = factor * w / total / mass;
            for &j in columns.iter() {
                coords.column_mut(j).scale_mut(scale);
            }
        }
    }

    embedding.with_coords(coords)
}
