//! ncnn export of synthetic models.

mod test_helpers;

use std::collections::HashMap;
use std::path::Path;

use serial_test::serial;

use recur::{DType, Error, ExportConfig, ExportSession, ExportSummary};
use recur_rwkv::{export_ncnn, export_ncnn_file, Model, RwkvConfig, Version};

use test_helpers::{temp_path, weight_file, ALL_VERSIONS, SMALL};

/// Parsed `.param` file.
struct Graph {
    node_count: usize,
    edge_count: usize,
    /// `(op_type, inputs, outputs)` per line.
    nodes: Vec<(String, Vec<String>, Vec<String>)>,
}

fn parse_param(path: &Path) -> Graph {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("7767517"));
    let counts: Vec<usize> = lines
        .next()
        .unwrap()
        .split_whitespace()
        .map(|n| n.parse().unwrap())
        .collect();
    let nodes = lines
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let n_in: usize = fields[2].parse().unwrap();
            let n_out: usize = fields[3].parse().unwrap();
            let inputs = fields[4..4 + n_in].iter().map(ToString::to_string).collect();
            let outputs = fields[4 + n_in..4 + n_in + n_out]
                .iter()
                .map(ToString::to_string)
                .collect();
            (fields[0].to_string(), inputs, outputs)
        })
        .collect();
    Graph {
        node_count: counts[0],
        edge_count: counts[1],
        nodes,
    }
}

fn remove_outputs(config: &ExportConfig) {
    for path in [config.param_path(), config.bin_path(), config.config_path()] {
        std::fs::remove_file(path).ok();
    }
}

fn export(version: Version, weight_dtype: DType, name: &str) -> (ExportConfig, ExportSummary) {
    let file = weight_file(version, &SMALL, 40);
    let config = ExportConfig::new(temp_path(name), weight_dtype);
    let summary = export_ncnn(&file, &config).unwrap();
    (config, summary)
}

#[test]
#[serial]
fn test_header_counts_match_records() {
    for version in ALL_VERSIONS {
        let (config, summary) = export(version, DType::F16, "header");
        let graph = parse_param(&config.param_path());
        let outputs: usize = graph.nodes.iter().map(|n| n.2.len()).sum();

        assert_eq!(graph.node_count, graph.nodes.len(), "version {version}");
        assert_eq!(graph.edge_count, outputs, "version {version}");
        assert_eq!(summary.node_count, graph.node_count);
        assert_eq!(summary.edge_count, graph.edge_count);
        let bin_len = std::fs::metadata(config.bin_path()).unwrap().len();
        assert_eq!(bin_len, summary.weight_bytes);
        remove_outputs(&config);
    }
}

#[test]
#[serial]
fn test_every_edge_has_one_producer_and_one_consumer() {
    for version in ALL_VERSIONS {
        let (config, _) = export(version, DType::Int8, "edges");
        let graph = parse_param(&config.param_path());
        let mut produced: HashMap<&str, usize> = HashMap::new();
        let mut consumed: HashMap<&str, usize> = HashMap::new();
        for (_, inputs, outputs) in &graph.nodes {
            for edge in outputs {
                *produced.entry(edge).or_default() += 1;
            }
            for edge in inputs {
                *consumed.entry(edge).or_default() += 1;
            }
        }
        for (edge, count) in &produced {
            assert_eq!(*count, 1, "version {version}: {edge} produced twice");
        }
        for (edge, count) in &consumed {
            assert_eq!(*count, 1, "version {version}: {edge} consumed {count} times");
            assert!(produced.contains_key(edge), "version {version}: {edge} never produced");
        }
        remove_outputs(&config);
    }
}

#[test]
#[serial]
fn test_graph_inputs_and_outputs_are_named() {
    for version in ALL_VERSIONS {
        let (config, _) = export(version, DType::F16, "names");
        let graph = parse_param(&config.param_path());
        let outputs: Vec<&str> = graph
            .nodes
            .iter()
            .flat_map(|n| n.2.iter().map(String::as_str))
            .collect();
        let slots = if version == Version::V4 { 5 } else { 3 };

        assert!(outputs.contains(&"input_id"));
        assert!(outputs.contains(&"output"));
        for layer in 0..SMALL.n_layer {
            for slot in 0..slots {
                assert!(outputs.contains(&format!("state_{layer}_{slot}").as_str()));
                assert!(outputs.contains(&format!("output_state_{layer}_{slot}").as_str()));
            }
        }
        assert!(!outputs.contains(&format!("state_0_{slots}").as_str()));
        remove_outputs(&config);
    }
}

#[test]
#[serial]
fn test_matmul_lowering_follows_weight_dtype() {
    let count = |graph: &Graph, op: &str| graph.nodes.iter().filter(|n| n.0 == op).count();

    let (config, _) = export(Version::V5_2, DType::Int4, "int4");
    let graph = parse_param(&config.param_path());
    assert!(count(&graph, "GemvA32W4") > 0);
    // The head is exported as int8 even for int4 weights.
    assert_eq!(count(&graph, "GemvA32W8"), 1);
    assert_eq!(count(&graph, "Embed"), 1);
    remove_outputs(&config);

    let (config, _) = export(Version::V5_2, DType::Int8, "int8");
    let graph = parse_param(&config.param_path());
    assert_eq!(count(&graph, "GemvA32W4"), 0);
    assert!(count(&graph, "GemvA32W8") > 1);
    remove_outputs(&config);

    let (config, _) = export(Version::V5_2, DType::F16, "fp16");
    let graph = parse_param(&config.param_path());
    assert_eq!(count(&graph, "GemvA32W4") + count(&graph, "GemvA32W8"), 0);
    assert!(count(&graph, "Gemm") > 0);
    remove_outputs(&config);
}

#[test]
#[serial]
fn test_config_file_reloads() {
    let (config, _) = export(Version::V6, DType::Int8, "config");
    let text = std::fs::read_to_string(config.config_path()).unwrap();
    let keys: Vec<&str> = text.lines().filter_map(|l| l.split_once(": ")).map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        [
            "version",
            "act_dtype",
            "weight_dtype",
            "head_size",
            "n_layer",
            "n_embd",
            "n_att",
            "n_ffn",
            "ncnn_impl_version"
        ]
    );
    assert!(text.contains("act_dtype: fp32\n"));
    assert!(text.contains("weight_dtype: int8\n"));
    assert!(text.contains("ncnn_impl_version: 2\n"));

    let reloaded = RwkvConfig::from_config_text(&text).unwrap();
    assert_eq!(reloaded.version, Version::V6);
    assert_eq!(reloaded.n_head, SMALL.n_head);
    assert_eq!(reloaded.n_att, SMALL.n_att);
    assert_eq!(reloaded.n_ffn, SMALL.n_ffn);
    remove_outputs(&config);
}

#[test]
#[serial]
fn test_export_is_deterministic() {
    let (first, _) = export(Version::V7, DType::Int4, "determinism");
    let param = std::fs::read(first.param_path()).unwrap();
    let bin = std::fs::read(first.bin_path()).unwrap();
    let (second, _) = export(Version::V7, DType::Int4, "determinism");
    assert_eq!(param, std::fs::read(second.param_path()).unwrap());
    assert_eq!(bin, std::fs::read(second.bin_path()).unwrap());
    remove_outputs(&second);
}

#[test]
#[serial]
fn test_export_from_weight_file_on_disk() {
    let file = weight_file(Version::V5, &SMALL, 41);
    let input = temp_path("export-input.msgpack");
    file.write(&input).unwrap();
    let prefix = temp_path("from-disk");
    let summary = export_ncnn_file(&input, DType::F16, &prefix);
    std::fs::remove_file(&input).ok();
    let summary = summary.unwrap();

    let config = ExportConfig::new(&prefix, DType::F16);
    assert_eq!(parse_param(&config.param_path()).node_count, summary.node_count);
    remove_outputs(&config);
}

#[test]
#[serial]
fn test_fp32_export_is_rejected() {
    let file = weight_file(Version::V4, &SMALL, 42);
    let config = ExportConfig::new(temp_path("fp32"), DType::F32);
    assert!(matches!(
        export_ncnn(&file, &config),
        Err(Error::UnsupportedDtype(_))
    ));
    assert!(!config.param_path().exists());
}

#[test]
#[serial]
fn test_tracing_leaves_model_state_alone() {
    let file = weight_file(Version::V5_1, &SMALL, 43);
    let model = Model::from_weight_file(&file, "export-ncnn fp16".parse().unwrap()).unwrap();
    let config = ExportConfig::new(temp_path("untouched"), DType::F16);
    let mut session = ExportSession::open(config.clone()).unwrap();
    let logits = model.run_traced(&mut session, 0).unwrap();
    assert_eq!(logits.shape(), &[SMALL.vocab]);
    assert!(logits.is_placeholder());
    assert!(model.states().iter().flatten().all(|t| !t.is_placeholder()));

    // A second session cannot open while this one is live.
    assert!(matches!(
        ExportSession::open(ExportConfig::new(temp_path("second"), DType::F16)),
        Err(Error::Resource(_))
    ));
    session.finish(&[]).unwrap();
    remove_outputs(&config);
}

#[test]
#[serial]
fn test_cpu_model_cannot_trace() {
    let file = weight_file(Version::V5, &SMALL, 44);
    let model = Model::from_weight_file(&file, "cpu fp32".parse().unwrap()).unwrap();
    let config = ExportConfig::new(temp_path("cpu-trace"), DType::F16);
    let mut session = ExportSession::open(config.clone()).unwrap();
    assert!(matches!(
        model.run_traced(&mut session, 0),
        Err(Error::Dispatch { .. })
    ));
    drop(session);
    remove_outputs(&config);
}
