/// Failure and degradation conditions of the integration pipeline
///
/// Fatal conditions come back as `anyhow::Error` wrapping one of these,
/// so callers can `downcast_ref::<LentilError>()`. Recoverable ones are
/// only logged as warnings.
#[derive(thiserror::Error, Debug)]
pub enum LentilError {
    #[error("input contract violation: {0}")]
    InputContractViolation(String),

    #[error("topology has {n_components} components; no path to a reference from {unreachable:?}")]
    DisconnectedTopology {
        n_components: usize,
        unreachable: Vec<Box<str>>,
    },

    #[error("dataset {dataset} has no path to reference {reference}")]
    UnreachableDataset {
        dataset: Box<str>,
        reference: Box<str>,
    },

    #[error("undefined local estimate: {0}")]
    UndefinedLocalEstimate(String),

    #[error("requested {requested} neighbours but only {available} are available")]
    NeighborCountExceeded { requested: usize, available: usize },
}

impl LentilError {
    pub fn contract(msg: impl Into<String>) -> anyhow::Error {
        LentilError::InputContractViolation(msg.into()).into()
    }
}
