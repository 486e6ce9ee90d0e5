//! Build artifacts.
//!
//! - `image` - Raw disk images assembled from gadget volumes

pub mod image;
