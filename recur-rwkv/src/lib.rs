//! RWKV v4 to v7 on recur kernel sets.
//!
//! A [`Model`] is loaded from a msgpack weight file with a
//! `"<device> <precision>"` strategy such as `"cpu fp16"`. Each call to
//! [`Model::run`] consumes one token, advances the per-layer recurrent
//! state and returns the logits. The forward pass is written once against
//! [`recur::Dispatcher`], so the same code computes on the CPU and traces
//! an ncnn graph for [`export_ncnn`].

#![allow(
    clippy::doc_markdown,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_lines
)]

pub mod accelerator;
pub mod config;
pub mod export;
mod forward;
pub mod model;
pub mod registry;
pub mod state;
pub mod strategy;
pub mod version;
pub mod weights;

pub use accelerator::{AcceleratorInfo, AcceleratorSession};
pub use config::RwkvConfig;
pub use export::{export_ncnn, export_ncnn_file};
pub use model::Model;
pub use registry::default_registry;
pub use state::States;
pub use strategy::{Precision, Strategy};
pub use version::Version;
pub use weights::{PackedTensor, WeightFile};
