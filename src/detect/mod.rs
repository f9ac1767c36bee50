pub mod annotate;
mod backend;
pub mod backends;
pub mod gateway;
pub mod labels;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use gateway::{open_backend, DetectionGateway};
pub use result::{count_by_class, format_counts, non_max_suppression, ClassCounts, Detection};
