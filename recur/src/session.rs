//! Graph export sessions.
//!
//! An [`ExportSession`] records the nodes emitted by meta kernels and
//! streams their weights into the `.bin` file as they are produced. On
//! [`ExportSession::finish`] the node list is legalised (every edge gets a
//! single consumer) and written out as an ncnn `.param` text file next to
//! a `key: value` `.config` file.
//!
//! Only one session may be open per process at a time.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::dtype::DType;
use crate::error::{Error, Result};

/// First line of every `.param` file.
pub const PARAM_MAGIC: u32 = 7_767_517;

/// Blob tag preceding fp16 weight data.
pub const TAG_FP16: u32 = 0x0130_6B47;
/// Blob tag preceding int8 weight data.
pub const TAG_INT8: u32 = 0x000D_4B38;
/// Blob tag preceding fp32 weight data.
pub const TAG_FP32: u32 = 0;

static ACTIVE: AtomicBool = AtomicBool::new(false);

struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| Error::Resource("another export session is already active".into()))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

/// What to export and where.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Output path without extension.
    pub prefix: PathBuf,
    /// Storage type for matmul weights.
    pub weight_dtype: DType,
}

impl ExportConfig {
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>, weight_dtype: DType) -> Self {
        Self {
            prefix: prefix.into(),
            weight_dtype,
        }
    }

    /// # Errors
    /// Weights must be exported as fp16, int8 or int4.
    pub fn validate(&self) -> Result<()> {
        match self.weight_dtype {
            DType::F16 | DType::Int8 | DType::Int4 => Ok(()),
            DType::F32 => Err(Error::UnsupportedDtype(
                "export weights must be fp16, int8 or int4".into(),
            )),
        }
    }

    #[must_use]
    pub fn param_path(&self) -> PathBuf {
        with_suffix(&self.prefix, "param")
    }

    #[must_use]
    pub fn bin_path(&self) -> PathBuf {
        with_suffix(&self.prefix, "bin")
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        with_suffix(&self.prefix, "config")
    }
}

fn with_suffix(prefix: &Path, ext: &str) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

/// One recorded layer.
#[derive(Debug, Clone)]
pub struct Node {
    pub op_type: &'static str,
    pub id: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: Vec<(i32, String)>,
}

/// Counts reported after a successful export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub node_count: usize,
    pub edge_count: usize,
    pub weight_bytes: u64,
}

/// An in-progress graph export.
pub struct ExportSession {
    config: ExportConfig,
    nodes: Vec<Node>,
    next_node: usize,
    next_edge: usize,
    weights: BufWriter<File>,
    weight_bytes: u64,
    constants: HashMap<(String, Vec<usize>), String>,
    int4_disabled: bool,
    _guard: ActiveGuard,
}

impl ExportSession {
    /// Open a session and create its weight file.
    ///
    /// # Errors
    /// Returns `Resource` if another session is open, or an IO error if the
    /// weight file cannot be created.
    pub fn open(config: ExportConfig) -> Result<Self> {
        config.validate()?;
        let guard = ActiveGuard::acquire()?;
        let weights = BufWriter::new(File::create(config.bin_path())?);
        info!(prefix = %config.prefix.display(), weight_dtype = %config.weight_dtype, "export session opened");
        Ok(Self {
            config,
            nodes: Vec::new(),
            next_node: 0,
            next_edge: 0,
            weights,
            weight_bytes: 0,
            constants: HashMap::new(),
            int4_disabled: false,
            _guard: guard,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    #[must_use]
    pub fn weight_dtype(&self) -> DType {
        self.config.weight_dtype
    }

    #[must_use]
    pub fn int4_disabled(&self) -> bool {
        self.int4_disabled
    }

    pub fn set_int4_disabled(&mut self, disabled: bool) {
        self.int4_disabled = disabled;
    }

    /// Nodes recorded so far, before fan-out legalisation.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// A new unique edge name.
    pub fn fresh_edge(&mut self) -> String {
        let edge = self.next_edge.to_string();
        self.next_edge += 1;
        edge
    }

    /// Append a node. Output names must be unique across the graph.
    pub fn push_node(
        &mut self,
        op_type: &'static str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        attrs: Vec<(i32, String)>,
    ) {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.push(Node {
            op_type,
            id,
            inputs,
            outputs,
            attrs,
        });
    }

    /// Append a node with `n_outputs` fresh outputs and return their names.
    pub fn emit(
        &mut self,
        op_type: &'static str,
        inputs: Vec<String>,
        n_outputs: usize,
        attrs: Vec<(i32, String)>,
    ) -> Vec<String> {
        let outputs: Vec<String> = (0..n_outputs).map(|_| self.fresh_edge()).collect();
        self.push_node(op_type, inputs, outputs.clone(), attrs);
        outputs
    }

    /// Append a weight blob, preceded by `tag` when given.
    ///
    /// # Errors
    /// Propagates IO errors from the weight file.
    pub fn write_weights(&mut self, bytes: &[u8], tag: Option<u32>) -> Result<()> {
        if let Some(tag) = tag {
            self.weights.write_all(&tag.to_le_bytes())?;
            self.weight_bytes += 4;
        }
        self.weights.write_all(bytes)?;
        self.weight_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Edge already holding constant `name` with `shape`, if emitted.
    #[must_use]
    pub fn constant_edge(&self, name: &str, shape: &[usize]) -> Option<&str> {
        self.constants
            .get(&(name.to_string(), shape.to_vec()))
            .map(String::as_str)
    }

    pub fn remember_constant(&mut self, name: &str, shape: &[usize], edge: &str) {
        self.constants
            .insert((name.to_string(), shape.to_vec()), edge.to_string());
    }

    /// Legalise the graph and write the `.param` and `.config` files.
    ///
    /// # Errors
    /// Propagates IO errors.
    pub fn finish(mut self, config_entries: &[(&str, String)]) -> Result<ExportSummary> {
        self.weights.flush()?;
        let nodes = legalize_fanout(std::mem::take(&mut self.nodes), self.next_node);
        let param = render_param(&nodes);
        std::fs::write(self.config.param_path(), param)?;

        let mut config = String::new();
        for (key, value) in config_entries {
            let _ = writeln!(config, "{key}: {value}");
        }
        std::fs::write(self.config.config_path(), config)?;

        let summary = ExportSummary {
            node_count: nodes.len(),
            edge_count: nodes.iter().map(|n| n.outputs.len()).sum(),
            weight_bytes: self.weight_bytes,
        };
        info!(
            nodes = summary.node_count,
            edges = summary.edge_count,
            weight_bytes = summary.weight_bytes,
            "export finished"
        );
        Ok(summary)
    }
}

/// Give every multiply-consumed edge its own `Split` so each output feeds
/// exactly one input slot.
fn legalize_fanout(nodes: Vec<Node>, mut next_id: usize) -> Vec<Node> {
    let mut uses: HashMap<String, usize> = HashMap::new();
    for node in &nodes {
        for input in &node.inputs {
            *uses.entry(input.clone()).or_default() += 1;
        }
    }

    let mut pending: HashMap<String, VecDeque<String>> = HashMap::new();
    let mut out = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        for input in &mut node.inputs {
            if let Some(queue) = pending.get_mut(input.as_str()) {
                if let Some(branch) = queue.pop_front() {
                    *input = branch;
                }
            }
        }
        let fanned: Vec<(String, usize)> = node
            .outputs
            .iter()
            .filter_map(|o| uses.get(o).filter(|&&n| n > 1).map(|&n| (o.clone(), n)))
            .collect();
        out.push(node);
        for (edge, count) in fanned {
            let branches: Vec<String> = (0..count).map(|i| format!("{edge}_splitncnn_{i}")).collect();
            debug!(edge = %edge, count, "inserting split");
            pending.insert(edge.clone(), branches.iter().cloned().collect());
            out.push(Node {
                op_type: "Split",
                id: next_id,
                inputs: vec![edge],
                outputs: branches,
                attrs: Vec::new(),
            });
            next_id += 1;
        }
    }
    out
}

fn render_param(nodes: &[Node]) -> String {
    let edges: usize = nodes.iter().map(|n| n.outputs.len()).sum();
    let mut text = format!("{PARAM_MAGIC}\n{} {edges}\n", nodes.len());
    for node in nodes {
        let _ = write!(
            text,
            "{:<16} {:<24} {} {}",
            node.op_type,
            node.id,
            node.inputs.len(),
            node.outputs.len()
        );
        for name in node.inputs.iter().chain(&node.outputs) {
            let _ = write!(text, " {name}");
        }
        for (key, value) in &node.attrs {
            let _ = write!(text, " {key}={value}");
        }
        text.push('\n');
    }
    text
}

/// Format like C's `%e`: six fraction digits and an exponent of at least
/// two digits.
#[must_use]
pub fn format_e(value: f32) -> String {
    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => formatted,
    }
}

/// Reversed dims as ncnn `0=w 1=h 2=c` attributes; 4-D shapes put the
/// outermost dim at key 11.
#[must_use]
pub fn shape_attrs(shape: &[usize]) -> Vec<(i32, String)> {
    let mut attrs: Vec<(i32, String)> = shape
        .iter()
        .rev()
        .take(3)
        .enumerate()
        .map(|(i, d)| (i as i32, d.to_string()))
        .collect();
    if shape.len() == 4 {
        attrs.push((11, shape[0].to_string()));
    }
    attrs
}
