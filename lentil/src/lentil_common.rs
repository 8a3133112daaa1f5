pub use log::{debug, info, warn};

pub use fnv::FnvHashMap as HashMap;
pub use fnv::FnvHashSet as HashSet;

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

pub use crate::error::LentilError;
pub use matrix_util::knn_match::KnnBackend;

/// cell name -> class label
pub type LabelMap = HashMap<Box<str>, Box<str>>;
