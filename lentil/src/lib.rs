//! Mosaic integration of single-cell data sets that share only some of
//! their features.
//!
//! Data sets are linked through a feature-overlap topology, projected
//! onto reference embeddings along shortest paths, and then used for
//! neighbour-based label transfer and imputation.

pub mod assay; // feature x cell matrices and collections
pub mod classify; // adaptive k-nearest-neighbour classification
pub mod embed; // path-wise projection onto references
pub mod embedding; // joint coordinates
pub mod error;
pub mod error_matrix; // cross-validated error tables, voting
pub mod impute; // neighbour averaging of assay values
pub mod knn; // named nearest neighbour queries
pub mod lentil_common;
pub mod projection; // PCA, least squares, discriminant models
pub mod topology; // data set overlap graph

pub use assay::{Assay, AssayCollection, AssayData};
pub use classify::{classify_embedding, ClassificationMode, ClassificationOutput, ClassifyArgs};
pub use embed::{reweight_embedding, stab_map, EmbedArgs, PathModel, StabMapOutput};
pub use embedding::JointEmbedding;
pub use error::LentilError;
pub use error_matrix::ErrorMeasure;
pub use impute::{impute_embedding, Aggregator, ImputeArgs, ImputedAssay};
pub use knn::{query_named_knn, KnnArgs, NeighbourTable};
pub use topology::Topology;
