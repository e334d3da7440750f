//! CLI smoke tests
//!
//! Drive the binary end to end over small on-disk fixtures: parse
//! arguments, read all three inputs, write the kernel file, and map
//! failures to the documented exit codes.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

use cyclescope::profile::write_order1;

struct TestContext {
    bin: PathBuf,
    dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let bin = std::env::var("CARGO_BIN_EXE_cyclescope")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./target/debug/cyclescope"));
        TestContext {
            bin,
            dir: TempDir::new().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// A loop program: 0 -> 1 -> 1 ... -> 2, plus its IR module
    fn write_fixture(&self) -> (PathBuf, PathBuf) {
        let profile = self.path("profile.bin");
        std::fs::write(&profile, write_order1(&[(0, 1, 1), (1, 1, 499), (1, 2, 1)])).unwrap();

        let ir = self.path("module.json");
        std::fs::write(
            &ir,
            serde_json::json!([
                {
                    "name": "main",
                    "blocks": [
                        {"id": 0, "terminator": {"kind": "branch", "targets": [1]}},
                        {"id": 1, "terminator": {"kind": "branch", "targets": [1, 2]}},
                        {"id": 2, "terminator": {"kind": "ret"}}
                    ]
                }
            ])
            .to_string(),
        )
        .unwrap();
        (profile, ir)
    }

    fn run(&self, args: &[&str]) -> std::process::Output {
        Command::new(&self.bin)
            .args(args)
            .output()
            .expect("failed to run cyclescope")
    }
}

#[test]
fn test_structure_writes_kernel_file() {
    let ctx = TestContext::new();
    let (profile, ir) = ctx.write_fixture();
    let out = ctx.path("kernels.json");

    let result = ctx.run(&[
        "structure",
        "-i",
        profile.to_str().unwrap(),
        "-b",
        ir.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
    ]);
    assert!(
        result.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let kernels = value["Kernels"].as_object().unwrap();
    assert_eq!(kernels.len(), 1, "the hot loop is the single task");
    assert!(value["Entropy"]["Start"]["Nodes"].as_u64().unwrap() > 0);
}

#[test]
fn test_structure_writes_dot() {
    let ctx = TestContext::new();
    let (profile, ir) = ctx.write_fixture();
    let out = ctx.path("kernels.json");
    let dot = ctx.path("graph.dot");

    let result = ctx.run(&[
        "structure",
        "-i",
        profile.to_str().unwrap(),
        "-b",
        ir.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "-d",
        dot.to_str().unwrap(),
    ]);
    assert!(result.status.success());

    let rendered = std::fs::read_to_string(&dot).unwrap();
    assert!(rendered.starts_with("digraph dcfg {"));
    assert!(rendered.contains("VOID"), "imaginary anchors are labeled");
}

#[test]
fn test_hotcode_command() {
    let ctx = TestContext::new();
    let (profile, ir) = ctx.write_fixture();
    let out = ctx.path("kernels.json");

    let result = ctx.run(&[
        "hotcode",
        "-i",
        profile.to_str().unwrap(),
        "-b",
        ir.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
    ]);
    assert!(
        result.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let hot = ctx.path("kernels_HotCode.json");
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&hot).unwrap()).unwrap();
    // block 1 carries 500 visits and is the hot region
    let k = &value["Kernels"]["0"];
    assert_eq!(k["Blocks"].as_array().unwrap()[0].as_i64(), Some(1));
}

#[test]
fn test_malformed_profile_exit_code() {
    let ctx = TestContext::new();
    let (_, ir) = ctx.write_fixture();
    let bad = ctx.path("bad.bin");
    std::fs::write(&bad, [1u8, 2, 3]).unwrap();
    let out = ctx.path("kernels.json");

    let result = ctx.run(&[
        "structure",
        "-i",
        bad.to_str().unwrap(),
        "-b",
        ir.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
    ]);
    assert_eq!(result.status.code(), Some(3), "malformed input exit code");
}

#[test]
fn test_unsupported_terminator_exit_code() {
    let ctx = TestContext::new();
    let (profile, _) = ctx.write_fixture();
    let ir = ctx.path("bad_module.json");
    std::fs::write(
        &ir,
        serde_json::json!([
            {
                "name": "main",
                "blocks": [
                    {"id": 0, "terminator": {"kind": "callbr"}}
                ]
            }
        ])
        .to_string(),
    )
    .unwrap();
    let out = ctx.path("kernels.json");

    let result = ctx.run(&[
        "structure",
        "-i",
        profile.to_str().unwrap(),
        "-b",
        ir.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
    ]);
    assert_eq!(result.status.code(), Some(5), "unsupported IR exit code");
}

#[test]
fn test_missing_args_fail() {
    let ctx = TestContext::new();
    let result = ctx.run(&["structure"]);
    assert!(!result.status.success());
}
