use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid permission value: {0:?}")]
    InvalidPermission(String),

    #[error("Invalid role: {0:?}")]
    InvalidRole(String),
}
