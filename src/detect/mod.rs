mod annotate;
mod backend;
pub mod backends;
mod cache;
mod registry;
mod result;

pub use annotate::annotate;
pub use backend::{DetectorLoader, PersonDetector};
pub use backends::{BackendLoader, NullBackend, ScriptedLoader, StubBackend};
pub use cache::{ActiveDetector, ModelCache};
pub use registry::ModelRegistry;
pub use result::{non_max_suppression, BoundingBox, Inference, PersonBox};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
