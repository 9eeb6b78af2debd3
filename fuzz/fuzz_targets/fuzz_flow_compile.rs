#![no_main]

use libfuzzer_sys::fuzz_target;
use std::path::Path;

use chatflow::config::parse_config;
use chatflow::flows::FlowGraph;

/// Parses arbitrary bytes as a JSON5 config and compiles its flows.
///
/// This catches:
/// - Panics in the config parser on malformed input
/// - Panics in the graph compiler on adversarial flow structures
///   (deep nesting, self-jumps, empty ids, bad capture patterns)
fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = parse_config(raw, Path::new("fuzz.json5")) else {
        return;
    };
    if let Ok(graph) = FlowGraph::compile(&config.flows) {
        for route in graph.routes() {
            assert!(graph.get(&route.flow).is_some());
        }
    }
});
