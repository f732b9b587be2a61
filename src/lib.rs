#![allow(missing_docs)]

pub mod backend;
pub mod cache;
pub mod error;
pub mod kernel;
pub mod reactive;
pub mod scan;
pub mod stage;
pub mod template;

pub use backend::{Device, HostDevice, WgpuDevice};
pub use error::Error;
pub use scan::{PrefixScan, PrefixScanConfig};
pub use stage::{ScanStage, StageGroup};
pub use template::OperationTemplate;
