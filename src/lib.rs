//! recimg - gadget-driven disk image builder.
//!
//! Builds raw, bootable disk images from a gadget description: one image per
//! declared volume, each with an MBR, GPT or hybrid partition table and its
//! structures laid out, formatted and populated. Work is split into named
//! steps driven by a resumable [`state::StateMachine`].

pub mod artifact;
pub mod bootloader;
pub mod config;
pub mod error;
pub mod gadget;
pub mod logging;
pub mod process;
pub mod size;
pub mod state;
pub mod steps;
pub mod sysops;
pub mod timing;
pub mod variant;
