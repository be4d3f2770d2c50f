use std::collections::BTreeMap;

use parley_common::protocol::errors::ErrorCode;
use parley_common::protocol::rpc::PROTOCOL_VERSION;
use parley_common::protocol::rpc_methods::{MethodKind, METHODS, PUSH_METHODS};

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/rpc-methods.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn kind_name(kind: MethodKind) -> &'static str {
    match kind {
        MethodKind::Call => "call",
        MethodKind::Stream => "stream",
        MethodKind::Post => "post",
    }
}

#[test]
fn methods_and_shapes_match_contract() {
    let contract = load_contract();
    let expected: BTreeMap<&str, &str> = contract["methods"]
        .as_object()
        .expect("methods should be an object")
        .iter()
        .map(|(name, kind)| (name.as_str(), kind.as_str().expect("kind should be a string")))
        .collect();

    let actual: BTreeMap<&str, &str> =
        METHODS.iter().map(|(name, kind)| (*name, kind_name(*kind))).collect();
    assert_eq!(actual, expected, "METHODS diverged from contract");
}

#[test]
fn push_methods_match_contract() {
    let contract = load_contract();
    let expected: Vec<&str> = contract["push_methods"]
        .as_array()
        .expect("push_methods should be an array")
        .iter()
        .map(|v| v.as_str().expect("push method should be a string"))
        .collect();

    assert_eq!(PUSH_METHODS, &expected[..], "PUSH_METHODS diverged from contract");
}

#[test]
fn error_codes_match_contract() {
    let contract = load_contract();
    let expected: BTreeMap<&str, u64> = contract["error_codes"]
        .as_object()
        .expect("error_codes should be an object")
        .iter()
        .map(|(name, code)| (name.as_str(), code.as_u64().expect("code should be numeric")))
        .collect();

    let actual: BTreeMap<&str, u64> =
        ErrorCode::ALL.iter().map(|code| (code.as_str(), u64::from(code.code()))).collect();
    assert_eq!(actual, expected, "ErrorCode table diverged from contract");
}

#[test]
fn protocol_version_matches_contract() {
    let contract = load_contract();
    let expected =
        contract["protocol_version"].as_str().expect("protocol_version should be a string");
    assert_eq!(PROTOCOL_VERSION, expected);
}
