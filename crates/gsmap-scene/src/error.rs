use thiserror::Error;

use crate::ParamName;

/// Precondition failures of structural operations. All of them are raised
/// before anything is mutated, so the store is unchanged when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no parameter group named `{0}`")]
    MissingGroup(ParamName),

    #[error("mask has {actual} entries but `{name}` has {expected} rows")]
    MaskLength {
        name: ParamName,
        expected: usize,
        actual: usize,
    },

    #[error("`{name}` expects {expected} rows, got {actual}")]
    RowCount {
        name: ParamName,
        expected: usize,
        actual: usize,
    },

    #[error("`{name}` expects rows of width {expected}, got {actual}")]
    Width {
        name: ParamName,
        expected: usize,
        actual: usize,
    },

    #[error("statistics input has {actual} rows, expected {expected}")]
    StatsRows { expected: usize, actual: usize },

    #[error("depth frame buffers disagree in size: {0:?} vs {1:?}")]
    FrameSize([usize; 2], [usize; 2]),
}
