//! Deferred resource lifecycle: staged uploads and frame-delayed disposal

pub mod disposal;
pub mod upload;

pub use disposal::DisposalQueue;
pub use upload::{BufferUpload, CompletedUpload, TextureUpload, UploadQueue, UploadResource};
