//! Image variants.
//!
//! Each variant contributes its own input-preparation steps and draws the
//! rest from the shared catalog in [`crate::steps`]. Whatever the variant,
//! its preparation steps must leave `gadget_dir` and `rootfs_source` set in
//! the build state; the shared steps rely on nothing else.

mod classic;
mod pack;
mod snap;

pub use classic::{Classic, ClassicArgs};
pub use pack::{Pack, PackArgs};
pub use snap::{Snap, SnapArgs};

use crate::state::Step;

pub trait Variant {
    /// Name recorded in resume metadata.
    fn name(&self) -> &'static str;

    /// Ordered step list.
    fn steps(&self) -> Vec<Step<'_>>;

    /// Host tools needed beyond the disk pipeline's, with their packages.
    fn host_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }
}
