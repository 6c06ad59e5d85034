//! Standalone repair entry: run corruption recovery against a document
//! and write the result to a `.fixed.json` sibling. The input is never
//! overwritten.

use std::path::Path;

use anyhow::Context;

use crate::exit_codes;

pub fn run(path: &Path) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let (doc, stats) = match quantbench_core::repair_document(&raw) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{}: unrecoverable: {e:#}", path.display());
            return Ok(exit_codes::ERROR);
        }
    };

    let fixed = fixed_path(path);
    let json = serde_json::to_string_pretty(&doc).context("failed to serialize repaired document")?;
    std::fs::write(&fixed, json)
        .with_context(|| format!("failed to write {}", fixed.display()))?;

    println!(
        "repaired {} -> {} ({} variants kept; truncated arrays {}, truncated objects {}, removed bytes {}, fixed closures {})",
        path.display(),
        fixed.display(),
        doc.variants.len(),
        stats.truncated_arrays,
        stats.truncated_objects,
        stats.removed_bytes,
        stats.fixed_closures,
    );
    Ok(exit_codes::SUCCESS)
}

fn fixed_path(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("results.qc.json");
    let fixed = match name.strip_suffix(".json") {
        Some(stem) => format!("{stem}.fixed.json"),
        None => format!("{name}.fixed.json"),
    };
    path.with_file_name(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_path_is_a_sibling() {
        assert_eq!(
            fixed_path(Path::new("out/llama.qc.json")),
            Path::new("out/llama.qc.fixed.json")
        );
        assert_eq!(
            fixed_path(Path::new("weird")),
            Path::new("weird.fixed.json")
        );
    }
}
