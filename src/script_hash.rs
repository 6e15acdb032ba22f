// =============================================================================
// Script-change detection — SHA-256 over the script and its local imports
// =============================================================================
//
// The runner fingerprints the configured strategy script plus every sibling
// `.py` it directly imports, and persists the digests in `.script_hash.csv`
// beside the script. A mismatch between computed and persisted hashes means
// the strategy changed and history-derived state must be reset.
//
// Detection must never fail the runner: any error reading the script or the
// hash file degrades to "no change" (an empty map compares equal to an empty
// map).
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Hashes keyed by file path, hex-encoded SHA-256.
pub type ScriptHashes = BTreeMap<String, String>;

/// Module names directly imported by the script source (`import x`,
/// `import x, y`, `from x import z`).
fn scan_import_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let stripped = line.trim();
        if let Some(rest) = stripped.strip_prefix("import ") {
            for name in rest.split(',') {
                if let Some(first) = name.trim().split_whitespace().next() {
                    names.push(first.to_string());
                }
            }
        } else if let Some(rest) = stripped.strip_prefix("from ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 && parts[1] == "import" {
                names.push(parts[0].to_string());
            }
        }
    }
    names
}

/// Compute hashes for the script and each directly imported sibling `.py`.
/// Unreadable files are skipped; an unreadable script yields the hashes of
/// whatever siblings still resolve.
pub fn compute_script_hashes(script_path: &Path) -> ScriptHashes {
    let mut hashes = ScriptHashes::new();
    let script_dir = script_path.parent().unwrap_or_else(|| Path::new("."));

    let source = std::fs::read_to_string(script_path).unwrap_or_default();

    let mut names = scan_import_names(&source);
    if let Some(stem) = script_path.file_stem() {
        names.push(stem.to_string_lossy().into_owned());
    }
    names.sort();
    names.dedup();

    for name in names {
        let py_file = script_dir.join(format!("{name}.py"));
        if !py_file.exists() {
            continue;
        }
        match std::fs::read(&py_file) {
            Ok(content) => {
                let digest = hex::encode(Sha256::digest(&content));
                hashes.insert(py_file.to_string_lossy().into_owned(), digest);
            }
            Err(e) => {
                warn!(path = %py_file.display(), error = %e, "failed to hash script file");
            }
        }
    }
    hashes
}

/// Load persisted hashes. Any error yields an empty map.
pub fn load_script_hashes(hash_path: &Path) -> ScriptHashes {
    let mut hashes = ScriptHashes::new();
    if !hash_path.exists() {
        return hashes;
    }
    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(hash_path)
    {
        Ok(r) => r,
        Err(_) => return hashes,
    };
    for record in reader.records().flatten() {
        if record.len() == 2 {
            hashes.insert(record[0].to_string(), record[1].to_string());
        }
    }
    hashes
}

/// Persist hashes as `path,digest` rows, sorted by path.
pub fn write_script_hashes(hash_path: &Path, hashes: &ScriptHashes) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(hash_path)?;
    for (path, digest) in hashes {
        writer.write_record([path.as_str(), digest.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_direct_imports() {
        let source = "import helpers\nfrom signals import crossover\nimport a, b\nx = 1\n";
        let names = scan_import_names(source);
        assert_eq!(names, vec!["helpers", "signals", "a", "b"]);
    }

    #[test]
    fn hashes_cover_script_and_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("demo.py");
        std::fs::write(&script, "import helpers\n").unwrap();
        std::fs::write(dir.path().join("helpers.py"), "def f(): pass\n").unwrap();
        // Not imported -- must not be hashed.
        std::fs::write(dir.path().join("unrelated.py"), "zzz\n").unwrap();

        let hashes = compute_script_hashes(&script);
        assert_eq!(hashes.len(), 2);
        assert!(hashes.keys().any(|k| k.ends_with("demo.py")));
        assert!(hashes.keys().any(|k| k.ends_with("helpers.py")));
    }

    #[test]
    fn change_is_detected_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("demo.py");
        let hash_path = dir.path().join(".script_hash.csv");
        std::fs::write(&script, "v1\n").unwrap();

        let first = compute_script_hashes(&script);
        write_script_hashes(&hash_path, &first).unwrap();
        assert_eq!(load_script_hashes(&hash_path), first);

        std::fs::write(&script, "v2\n").unwrap();
        let second = compute_script_hashes(&script);
        assert_ne!(first, second);

        write_script_hashes(&hash_path, &second).unwrap();
        assert_eq!(load_script_hashes(&hash_path), second);
    }

    #[test]
    fn missing_files_degrade_to_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let hashes = compute_script_hashes(&dir.path().join("ghost.py"));
        assert!(hashes.is_empty());
        assert!(load_script_hashes(&dir.path().join(".script_hash.csv")).is_empty());
    }
}
