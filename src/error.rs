use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OveError {
    #[error("Capacity overflow when sizing for `{0}` elements")]
    CapacityOverflow(usize),
    #[error("Allocation of `{0}` bytes failed")]
    AllocFailed(usize),
}

pub type Result<T> = std::result::Result<T, OveError>;
