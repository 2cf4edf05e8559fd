//! Export a model to an ncnn graph.
//!
//! One step for token 0 is traced on [`Device::NcnnMeta`]. The graph takes
//! `input_id` and every `state_<layer>_<slot>` as inputs and produces
//! `output` plus the matching `output_state_<layer>_<slot>` edges.

use std::path::Path;

use recur::{DType, Device, Error, ExportConfig, ExportSession, ExportSummary, Result};

use crate::model::Model;
use crate::strategy::{Precision, Strategy};
use crate::weights::WeightFile;

/// Layout revision of the exported graph, read back by the runtime.
pub const NCNN_IMPL_VERSION: &str = "2";

/// Trace `file` into `<prefix>.param`, `<prefix>.bin` and
/// `<prefix>.config`.
///
/// # Errors
/// Returns `UnsupportedDtype` for f32 export weights, `Resource` when
/// another export is in progress, and propagates load, kernel and IO
/// errors.
pub fn export_ncnn(file: &WeightFile, config: &ExportConfig) -> Result<ExportSummary> {
    let precision = match config.weight_dtype {
        DType::F16 => Precision::Fp16,
        DType::Int8 => Precision::Int8,
        DType::Int4 => Precision::Int4,
        DType::F32 => {
            return Err(Error::UnsupportedDtype(
                "export weights must be fp16, int8 or int4".into(),
            ))
        }
    };
    let model = Model::from_weight_file(file, Strategy::new(Device::NcnnMeta, precision))?;

    let mut session = ExportSession::open(config.clone())?;
    model.run_traced(&mut session, 0)?;

    let mut entries = model.config().config_entries();
    entries.insert(1, ("act_dtype", model.act_dtype().to_string()));
    entries.insert(2, ("weight_dtype", config.weight_dtype.to_string()));
    entries.push(("ncnn_impl_version", NCNN_IMPL_VERSION.to_string()));
    session.finish(&entries)
}

/// Read a weight file from disk and export it.
///
/// # Errors
/// See [`export_ncnn`]; also fails when the weight file cannot be read.
pub fn export_ncnn_file(
    input: impl AsRef<Path>,
    weight_dtype: DType,
    output_prefix: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let file = WeightFile::read(input)?;
    export_ncnn(&file, &ExportConfig::new(output_prefix.as_ref(), weight_dtype))
}
