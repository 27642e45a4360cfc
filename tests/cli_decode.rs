use assert_cmd::Command;
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SUB_HEADER: usize = 422;

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Tabled capture: count, offset/length table, then one record per frame.
fn write_capture(path: &Path, frames: &[Vec<i16>]) {
    let mut table = Vec::new();
    let mut records = Vec::new();
    table.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for samples in frames {
        let offset = records.len() as u32;
        records.extend_from_slice(&[0u8; SUB_HEADER]);
        for s in samples {
            records.extend_from_slice(&s.to_le_bytes());
        }
        let length = records.len() as u32 - offset;
        table.extend_from_slice(&offset.to_le_bytes());
        table.extend_from_slice(&length.to_le_bytes());
    }
    table.extend_from_slice(&records);
    fs::write(path, table).expect("write capture");
}

fn ramp(len: i16, scale: i16) -> Vec<i16> {
    (0..len).map(|v| v * scale).collect()
}

fn gray_values(png: &Path) -> Vec<u8> {
    let img = image::open(png).expect("decode png").to_rgba8();
    img.pixels().map(|p| p[0]).collect()
}

fn md5_of(path: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(fs::read(path).expect("read input"));
    format!("{:x}", hasher.finalize())
}

fn datframe() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("datframe"))
}

fn sorted_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read out dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn count_prints_frame_total() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    write_capture(&cap, &[ramp(8, 1), ramp(8, 2), ramp(8, 3)]);

    let output = datframe().arg("count").arg(&cap).output().unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "3");
}

#[test]
fn count_rejects_truncated_table() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("bad.dat");
    fs::write(&cap, [5u8, 0, 0, 0, 0, 0]).unwrap();

    let output = datframe().arg("count").arg(&cap).output().unwrap();
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("Truncated frame table"), "{text}");
}

#[test]
fn frame_writes_normalized_png() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    write_capture(&cap, &[vec![7; 4], vec![-10, 0, 10, -10]]);
    let out = tmp.path().join("f1.png");

    let output = datframe()
        .args(["frame"])
        .arg(&cap)
        .arg("1")
        .arg("-o")
        .arg(&out)
        .args(["--rows", "2", "--cols", "2"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(gray_values(&out), vec![0, 128, 255, 0]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("(2x2)"), "{stdout}");
    assert!(stdout.contains(&format!("md5={}", md5_of(&cap))), "{stdout}");

    let flat = tmp.path().join("f0.png");
    let output = datframe()
        .arg("frame")
        .arg(&cap)
        .arg("0")
        .arg("-o")
        .arg(&flat)
        .args(["--rows", "2", "--cols", "2"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(gray_values(&flat), vec![128; 4]);
}

#[test]
fn frame_index_past_end_fails() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    write_capture(&cap, &[ramp(4, 1)]);

    let output = datframe()
        .arg("frame")
        .arg(&cap)
        .arg("1")
        .arg("-o")
        .arg(tmp.path().join("x.png"))
        .args(["--rows", "2", "--cols", "2"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("out of range"));
}

#[test]
fn render_reads_whole_buffer_with_precision() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("single.dat");
    fs::write(&raw, [0u8, 85, 170, 255]).unwrap();
    let out = tmp.path().join("single.png");

    let output = datframe()
        .arg("render")
        .arg(&raw)
        .arg("-o")
        .arg(&out)
        .args(["--rows", "1", "--cols", "4", "--precision", "uint8"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(gray_values(&out), vec![0, 85, 170, 255]);

    let output = datframe()
        .arg("render")
        .arg(&raw)
        .arg("-o")
        .arg(&out)
        .args(["--rows", "1", "--cols", "4"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("Buffer too small"));
}

#[test]
fn list_orders_naturally_and_groups_sub_frames() {
    let tmp = TempDir::new().unwrap();
    write_capture(&tmp.path().join("b.dat"), &[ramp(4, 1)]);
    write_capture(&tmp.path().join("a.dat"), &[ramp(4, 1), ramp(4, 2)]);
    fs::write(tmp.path().join("a.png"), b"raster").unwrap();
    fs::write(tmp.path().join("notes.txt"), b"skip me").unwrap();

    let output = datframe()
        .arg("list")
        .arg(tmp.path())
        .args(["--rows", "2", "--cols", "2", "--progress", "plain"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = stdout.lines().collect();
    assert_eq!(names, vec!["a.dat#0", "a.dat#1", "a.png", "b.dat#0"]);
    assert!(String::from_utf8_lossy(&output.stderr).contains("notes.txt"));
}

#[test]
fn list_json_describes_sub_frames() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("scan.dat");
    write_capture(&cap, &[ramp(4, 1), ramp(4, 1)]);

    let output = datframe()
        .arg("list")
        .arg(&cap)
        .args(["--rows", "2", "--cols", "2", "--json", "--progress", "quiet"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let items = parsed.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1]["display_name"], "scan.dat#1");
    assert_eq!(items[1]["is_sub_frame"], true);
    assert_eq!(items[1]["sub_frame_index"], 1);
    assert_eq!(items[1]["kind"], "capture_frame");
}

#[test]
fn browse_writes_every_visited_frame() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("in");
    let out = tmp.path().join("out");
    fs::create_dir_all(&input).unwrap();
    write_capture(&input.join("f10.dat"), &[ramp(4, 1)]);
    write_capture(&input.join("f2.dat"), &[ramp(4, 1), ramp(4, -1)]);

    let output = datframe()
        .arg("browse")
        .arg(&input)
        .arg("--out-dir")
        .arg(&out)
        .args(["--rows", "2", "--cols", "2", "--workers", "2", "--progress", "plain"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Browse summary:"), "{stdout}");
    assert!(stdout.contains("frames=3 written=3 failed=0"), "{stdout}");
    assert_eq!(
        sorted_entries(&out),
        vec!["00000_f2.dat_0.png", "00001_f2.dat_1.png", "00002_f10.dat_0.png"]
    );
    assert_eq!(gray_values(&out.join("00001_f2.dat_1.png")), vec![255, 170, 85, 0]);
}

#[test]
fn browse_start_and_limit_select_a_window() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    let frames: Vec<Vec<i16>> = (1..=5).map(|s| ramp(4, s)).collect();
    write_capture(&cap, &frames);
    let out = tmp.path().join("out");

    let output = datframe()
        .arg("browse")
        .arg(&cap)
        .arg("--out-dir")
        .arg(&out)
        .args(["--rows", "2", "--cols", "2", "--start", "1", "--limit", "2"])
        .args(["--progress", "quiet"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(
        sorted_entries(&out),
        vec!["00001_a.dat_1.png", "00002_a.dat_2.png"]
    );
}

#[test]
fn browse_skips_corrupt_frames_and_reports_them() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    // Middle record holds 2 samples, too few for 2x2.
    write_capture(&cap, &[ramp(4, 1), ramp(2, 1), ramp(4, 2)]);
    let out = tmp.path().join("out");

    let output = datframe()
        .arg("browse")
        .arg(&cap)
        .arg("--out-dir")
        .arg(&out)
        .args(["--rows", "2", "--cols", "2", "--progress", "plain"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("written=2 failed=1"), "{stdout}");
    assert!(stdout.contains("Frame data too small"), "{stdout}");
    let written: Vec<PathBuf> = sorted_entries(&out).iter().map(|n| out.join(n)).collect();
    assert_eq!(written.len(), 2);
}

#[test]
fn browse_reverse_walks_window_backwards_and_writes_manifest() {
    let tmp = TempDir::new().unwrap();
    let cap = tmp.path().join("a.dat");
    // Frame 2 is short for 2x2.
    write_capture(&cap, &[ramp(4, 1), ramp(4, 2), ramp(2, 1), ramp(4, 3)]);
    let out = tmp.path().join("out");
    let manifest = tmp.path().join("visits.json");

    let output = datframe()
        .arg("browse")
        .arg(&cap)
        .arg("--out-dir")
        .arg(&out)
        .arg("--manifest")
        .arg(&manifest)
        .args(["--rows", "2", "--cols", "2", "--start", "1", "--reverse"])
        .args(["--progress", "quiet"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("frames=4 written=2 failed=1 visited=3 failed_files=0"), "{stdout}");
    assert_eq!(
        sorted_entries(&out),
        vec!["00001_a.dat_1.png", "00003_a.dat_3.png"]
    );

    let parsed: serde_json::Value = serde_json::from_slice(&fs::read(&manifest).unwrap()).unwrap();
    let visits = parsed.as_array().unwrap();
    let order: Vec<u64> = visits.iter().map(|v| v["index"].as_u64().unwrap()).collect();
    assert_eq!(order, vec![3, 2, 1]);
    assert_eq!(visits[0]["md5"], md5_of(&cap).as_str());
    assert_eq!(visits[1]["error_kind"], "frame_data_too_small");
    assert!(visits[1]["output"].is_null());
    assert!(visits[1]["md5"].is_null());
    assert_eq!(visits[2]["display_name"], "a.dat#1");
}

#[test]
fn browse_counts_files_whose_table_is_unreadable() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("in");
    fs::create_dir_all(&input).unwrap();
    write_capture(&input.join("good.dat"), &[ramp(4, 1)]);
    fs::write(input.join("bad.dat"), [7u8, 0, 0, 0, 1, 2]).unwrap();
    let out = tmp.path().join("out");

    let output = datframe()
        .arg("browse")
        .arg(&input)
        .arg("--out-dir")
        .arg(&out)
        .args(["--rows", "2", "--cols", "2", "--progress", "plain"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("frames=1 written=1 failed=0"), "{stdout}");
    assert!(stdout.contains("failed_files=1"), "{stdout}");
    assert!(stdout.contains("bad.dat"), "{stdout}");
}
