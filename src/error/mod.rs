#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation Error: {0} should be {1}")]
    Validation(String, String),

    #[error("Compilation Error: {0}")]
    Compilation(String),

    #[error("Allocation Error: {0}")]
    Allocation(String),

    #[error("Device Error: {0}")]
    Device(String),

    #[error("Readback Error: {0}")]
    Readback(String),
}
