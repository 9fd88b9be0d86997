use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const WIDTH: u32 = 32;
const HEIGHT: u32 = 16;
/// One 32x16 yuv420p frame.
const FRAME_BYTES: usize = 32 * 16 * 3 / 2;

fn hwpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hwpipe"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("run hwpipe")
}

fn write_annexb(path: &Path, units: usize) {
    let mut data = Vec::new();
    for i in 0..units {
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, i as u8, 0x42]);
    }
    fs::write(path, data).expect("write annex-b input");
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_else(|| panic!("no stdout JSON; stderr: {}", String::from_utf8_lossy(&output.stderr)));
    serde_json::from_str(line).unwrap_or_else(|e| panic!("stdout is not JSON: {e}\n{stdout}"))
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 in {value}"
    );
}

#[test]
fn help_lists_every_subcommand() {
    let output = hwpipe(&["help"]);
    assert!(
        output.status.success(),
        "help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["decode", "encode", "transcode", "serve", "graph"] {
        assert!(stdout.contains(sub), "missing {sub} in help:\n{stdout}");
    }
}

#[test]
fn transcode_help_lists_remote_options() {
    let output = hwpipe(&["transcode", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--remote", "--transfer", "--graph", "--max-flush-polls", "--json"] {
        assert!(stdout.contains(flag), "missing {flag} in transcode help");
    }
}

#[test]
fn missing_positionals_is_a_usage_error() {
    let output = hwpipe(&["decode", "in.h264"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn decode_writes_one_raw_frame_per_access_unit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.h264");
    write_annexb(&input, 12);
    let prefix = dir.path().join("out");
    let prefix = prefix.to_str().expect("utf-8 path");

    let (w, h) = (WIDTH.to_string(), HEIGHT.to_string());
    let output = hwpipe(&[
        "decode",
        input.to_str().expect("utf-8 path"),
        "h264",
        prefix,
        &w,
        &h,
        "24000",
        "1001",
        "--trailing-unit",
        "emit",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "decode failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "decode");
    assert_eq!(value["ok"], true);
    assert_eq!(value["status"], 0);
    assert_eq!(value["report"]["iterations"], 12);
    assert_eq!(value["input"]["units"], 12);

    let raw = fs::read(format!("{prefix}_0.yuv")).expect("raw output");
    assert_eq!(raw.len(), 12 * FRAME_BYTES);
}

#[test]
fn decode_discards_unterminated_tail_by_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.h264");
    write_annexb(&input, 4);
    let prefix = dir.path().join("out");
    let prefix = prefix.to_str().expect("utf-8 path");

    let (w, h) = (WIDTH.to_string(), HEIGHT.to_string());
    let output = hwpipe(&[
        "decode",
        input.to_str().expect("utf-8 path"),
        "h264",
        prefix,
        &w,
        &h,
        "25",
        "1",
        "--json",
    ]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["input"]["units"], 3);
    assert_eq!(value["input"]["trailing_discarded"], true);

    let raw = fs::read(format!("{prefix}_0.yuv")).expect("raw output");
    assert_eq!(raw.len(), 3 * FRAME_BYTES);
}

#[test]
fn encode_turns_raw_frames_into_a_bitstream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.yuv");
    fs::write(&input, vec![0x80u8; 5 * FRAME_BYTES]).expect("write raw input");
    let prefix = dir.path().join("enc");
    let prefix = prefix.to_str().expect("utf-8 path");

    let (w, h) = (WIDTH.to_string(), HEIGHT.to_string());
    let output = hwpipe(&[
        "encode",
        input.to_str().expect("utf-8 path"),
        "hevc",
        prefix,
        &w,
        &h,
        "--json",
    ]);
    assert!(
        output.status.success(),
        "encode failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_eq!(value["report"]["inputs_read"], 5);
    assert!(value["input"].is_null());

    let encoded = fs::metadata(format!("{prefix}_0.hevc")).expect("encoded output");
    assert!(encoded.len() > 0);
}

#[test]
fn transcode_writes_every_ladder_rung() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.h264");
    write_annexb(&input, 6);
    let prefix = dir.path().join("ladder");
    let prefix = prefix.to_str().expect("utf-8 path");

    let output = hwpipe(&[
        "transcode",
        input.to_str().expect("utf-8 path"),
        "h264",
        prefix,
        "64",
        "32",
    ]);
    assert!(
        output.status.success(),
        "transcode failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    for channel in 0..4 {
        let path = format!("{prefix}_{channel}.h264");
        let len = fs::metadata(&path)
            .unwrap_or_else(|e| panic!("missing {path}: {e}"))
            .len();
        assert!(len > 0, "{path} is empty");
    }
}

#[test]
fn unknown_codec_fails_with_input_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.h264");
    write_annexb(&input, 2);
    let prefix = dir.path().join("out");

    let output = hwpipe(&[
        "decode",
        input.to_str().expect("utf-8 path"),
        "vp9",
        prefix.to_str().expect("utf-8 path"),
        "32",
        "16",
        "25",
        "1",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["status"], 1);
    assert!(value["error"].as_str().is_some_and(|e| e.contains("vp9")));
}

#[test]
fn missing_input_file_fails_with_input_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = hwpipe(&[
        "decode",
        dir.path().join("absent.h264").to_str().expect("utf-8 path"),
        "h264",
        dir.path().join("out").to_str().expect("utf-8 path"),
        "32",
        "16",
        "25",
        "1",
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn graph_command_validates_and_reports_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.json");
    fs::write(
        &path,
        r#"{
            "graph_schema_version": 1,
            "stages": [
                { "kind": "decode" },
                { "kind": "download" }
            ],
            "max_flush_polls": 64
        }"#,
    )
    .expect("write graph");

    let output = hwpipe(&["graph", "--graph", path.to_str().expect("utf-8 path"), "--json"]);
    assert!(
        output.status.success(),
        "graph failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "graph");
    assert_eq!(value["stages"], serde_json::json!(["decode", "download"]));
    assert_eq!(value["max_flush_polls"], 64);
}

#[test]
fn graph_command_rejects_mistyped_chain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.json");
    fs::write(
        &path,
        r#"{ "graph_schema_version": 1, "stages": [ { "kind": "decode" }, { "kind": "encode" } ] }"#,
    )
    .expect("write graph");

    let output = hwpipe(&["graph", "--graph", path.to_str().expect("utf-8 path"), "--json"]);
    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_eq!(value["ok"], false);
    assert!(value["error"].as_str().is_some_and(|e| e.contains("consumes")));
}

#[test]
fn decode_rejects_a_graph_for_another_flow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.h264");
    write_annexb(&input, 2);
    let graph = dir.path().join("graph.json");
    fs::write(
        &graph,
        r#"{ "graph_schema_version": 1, "stages": [ { "kind": "upload" }, { "kind": "encode" } ] }"#,
    )
    .expect("write graph");

    let output = hwpipe(&[
        "decode",
        input.to_str().expect("utf-8 path"),
        "h264",
        dir.path().join("out").to_str().expect("utf-8 path"),
        "32",
        "16",
        "25",
        "1",
        "--graph",
        graph.to_str().expect("utf-8 path"),
    ]);
    assert_eq!(output.status.code(), Some(1));
}
