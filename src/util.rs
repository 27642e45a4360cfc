use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

pub const CAPTURE_EXTENSION: &str = "dat";

const RASTER_EXTENSIONS: [(&str, &str); 7] = [
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("bmp", "image/bmp"),
    ("gif", "image/gif"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Raster { mime: &'static str },
    Capture,
    Unsupported,
}

pub fn classify(path: &Path) -> FileKind {
    let Some(ext) = path.extension() else {
        return FileKind::Unsupported;
    };
    let ext = ext.to_string_lossy().to_ascii_lowercase();
    if ext == CAPTURE_EXTENSION {
        return FileKind::Capture;
    }
    RASTER_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| FileKind::Raster { mime: *mime })
        .unwrap_or(FileKind::Unsupported)
}

pub fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| p.display().to_string())
}

// Numeric-aware, case-insensitive ordering: "f2" < "f10", "A" == "a".
// Names that compare equal fall back to plain byte order so the result is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_cmp_folded(a, b).then_with(|| a.cmp(b))
}

fn natural_cmp_folded(a: &str, b: &str) -> Ordering {
    let a: Vec<char> = a.chars().flat_map(char::to_lowercase).collect();
    let b: Vec<char> = b.chars().flat_map(char::to_lowercase).collect();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let si = i;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let ord = cmp_digit_runs(&a[si..i], &b[sj..j]);
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            match a[i].cmp(&b[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                ord => return ord,
            }
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

fn cmp_digit_runs(a: &[char], b: &[char]) -> Ordering {
    let a = trim_leading_zeros(a);
    let b = trim_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn trim_leading_zeros(run: &[char]) -> &[char] {
    let zeros = run.iter().take_while(|c| **c == '0').count();
    &run[zeros.min(run.len().saturating_sub(1))..]
}

pub fn expand_inputs(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut out = vec![];
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).min_depth(1).max_depth(1) {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file() {
                    out.push(entry.into_path());
                }
            }
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

pub fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
