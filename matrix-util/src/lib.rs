pub mod dmatrix_rsvd;
pub mod dmatrix_util;
pub mod knn_match;
pub mod traits;
pub mod utils;
