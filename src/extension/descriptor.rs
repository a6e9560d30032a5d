//! Descriptor file discovery: `name=target` lines read from the well-known
//! probe directories, one file per interface, named after the interface.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{Error, Result};

/// One parsed line from a descriptor file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLine {
    /// `None` when the line was bare `target` with no `name=` prefix.
    pub name: Option<String>,
    /// The right-hand side — a factory/target identifier, opaque to the
    /// loader itself (the caller's registered factory decides what it means).
    pub target: String,
}

/// Parse one descriptor file's contents. `#` starts a line comment; blank
/// lines are skipped. A line is either `name=target` or bare `target`.
#[must_use]
pub fn parse_descriptor(contents: &str) -> Vec<DescriptorLine> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once('=') {
            Some((name, target)) => DescriptorLine {
                name: Some(name.trim().to_string()),
                target: target.trim().to_string(),
            },
            None => DescriptorLine {
                name: None,
                target: line.to_string(),
            },
        })
        .collect()
}

/// Read and parse the descriptor file for `interface_fqn`, probing
/// `directories` in order (internal, public, standard — first hit wins per
/// directory; later directories are only consulted when the interface's file
/// is absent from an earlier one, but every directory that does carry the
/// file is loaded and merged, names colliding across directories being an
/// error).
///
/// # Errors
///
/// Returns an error if a descriptor file exists but is not valid UTF-8, or
/// if the same name is declared more than once across the probed directories.
pub fn load_descriptor(directories: &[PathBuf], interface_fqn: &str) -> Result<Vec<DescriptorLine>> {
    let mut merged: Vec<DescriptorLine> = Vec::new();
    let mut seen_names = std::collections::HashSet::new();

    for dir in directories {
        let Some(path) = find_descriptor_file(dir, interface_fqn) else {
            continue;
        };
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        for line in parse_descriptor(&contents) {
            if let Some(name) = &line.name {
                if !seen_names.insert(name.clone()) {
                    return Err(Error::Config(format!(
                        "duplicate extension name '{name}' for interface {interface_fqn}"
                    )));
                }
            }
            merged.push(line);
        }
    }

    Ok(merged)
}

fn find_descriptor_file(dir: &Path, interface_fqn: &str) -> Option<PathBuf> {
    if !dir.exists() {
        return None;
    }
    WalkDir::new(dir)
        .max_depth(4)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == interface_fqn)
        .map(walkdir::DirEntry::into_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_bare_lines_skipping_comments() {
        let text = "# a comment\nblack=pkg.BlackCar\n\npkg.DefaultCar\n";
        let lines = parse_descriptor(text);
        assert_eq!(
            lines,
            vec![
                DescriptorLine {
                    name: Some("black".to_string()),
                    target: "pkg.BlackCar".to_string(),
                },
                DescriptorLine {
                    name: None,
                    target: "pkg.DefaultCar".to_string(),
                },
            ]
        );
    }

    #[test]
    fn load_descriptor_merges_directories_and_rejects_duplicate_names() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("Car"), "black=pkg.BlackCar\n").unwrap();
        std::fs::write(dir_b.path().join("Car"), "black=pkg.OtherCar\n").unwrap();

        let dirs = vec![dir_a.path().to_path_buf(), dir_b.path().to_path_buf()];
        let err = load_descriptor(&dirs, "Car").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn load_descriptor_returns_empty_when_no_file_found() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        let lines = load_descriptor(&dirs, "NoSuchInterface").unwrap();
        assert!(lines.is_empty());
    }
}
