//! Unit tests for the glob-based tool filter and tool result types.

use serde_json::json;

use toolpipe::client::{ContentBlock, ToolCallResult, ToolFilter, ToolInfo};
use toolpipe::config::ToolsConfig;

fn filter(allowed: Option<&[&str]>, blocked: &[&str]) -> ToolFilter {
    let config = ToolsConfig {
        allowed: allowed.map(|p| p.iter().map(|s| (*s).to_owned()).collect()),
        blocked: blocked.iter().map(|s| (*s).to_owned()).collect(),
        prefix: None,
    };
    ToolFilter::from_config(&config).expect("patterns compile")
}

#[test]
fn default_filter_allows_everything() {
    let f = ToolFilter::default();
    assert!(f.is_allowed("anything"));
    assert!(f.is_allowed(""));
}

#[test]
fn allow_list_restricts_to_matches() {
    let f = filter(Some(&["read_*", "search"]), &[]);

    assert!(f.is_allowed("read_file"));
    assert!(f.is_allowed("search"));
    assert!(!f.is_allowed("write_file"));
    assert!(!f.is_allowed("search_all"), "patterns match whole names");
}

#[test]
fn block_list_wins_over_allow_list() {
    let f = filter(Some(&["*"]), &["fs_delete*", "secret"]);

    assert!(f.is_allowed("fs_read"));
    assert!(!f.is_allowed("fs_delete"));
    assert!(!f.is_allowed("fs_delete_tree"));
    assert!(!f.is_allowed("secret"));
}

#[test]
fn empty_allow_list_blocks_everything() {
    let f = filter(Some(&[]), &[]);
    assert!(!f.is_allowed("echo"));
}

#[test]
fn invalid_pattern_is_a_config_error() {
    let config = ToolsConfig {
        allowed: None,
        blocked: vec!["[".into()],
        prefix: None,
    };
    let err = ToolFilter::from_config(&config).expect_err("must fail");
    assert!(err.to_string().starts_with("config: invalid tool pattern '['"));
}

// ── Result shapes ───────────────────────────────────────────────────────────

#[test]
fn tool_info_reads_camel_case_schema() {
    let info: ToolInfo = serde_json::from_value(json!({
        "name": "echo",
        "description": "Echo the text argument",
        "inputSchema": { "type": "object" }
    }))
    .expect("valid tool");

    assert_eq!(info.name, "echo");
    assert_eq!(info.input_schema, json!({"type": "object"}));
}

#[test]
fn prefixed_name_is_local_only() {
    let mut info: ToolInfo = serde_json::from_value(json!({
        "name": "echo",
        "prefixedName": "spoofed"
    }))
    .expect("valid tool");
    assert_eq!(info.prefixed_name, "", "never taken from the server");
    assert!(serde_json::to_value(&info).expect("encode").get("prefixedName").is_none());

    info.prefixed_name = "gh_echo".into();
    let encoded = serde_json::to_value(&info).expect("encode");
    assert_eq!(encoded["prefixedName"], "gh_echo");
}

#[test]
fn tool_call_result_collects_text() {
    let result: ToolCallResult = serde_json::from_value(json!({
        "content": [
            { "type": "text", "text": "first" },
            { "type": "image", "data": "AAAA", "mimeType": "image/png" },
            { "type": "text", "text": "second" }
        ],
        "isError": true
    }))
    .expect("valid result");

    assert!(result.is_error);
    assert_eq!(result.text(), "first\nsecond");
    assert_eq!(
        result.content[1],
        ContentBlock::Image {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
        }
    );
}

#[test]
fn missing_fields_default() {
    let result: ToolCallResult = serde_json::from_value(json!({})).expect("empty result");
    assert!(result.content.is_empty());
    assert!(!result.is_error);
}
