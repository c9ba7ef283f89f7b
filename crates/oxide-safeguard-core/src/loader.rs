//! Loading revisions from a directory of TOML files.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::graph::{LoadTarget, RevisionGraph};
use crate::revision::Revision;

/// Extension of revision files.
pub const REVISION_EXTENSION: &str = "toml";

/// Lists revision files in a directory, sorted by file name.
pub fn revision_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_err = |source| GraphError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext == REVISION_EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parses a single revision file.
pub fn parse_revision_file(path: &Path) -> Result<Revision> {
    let text = fs::read_to_string(path).map_err(|source| GraphError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|e| GraphError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Loads every revision in `dir` into a graph.
///
/// Fails on duplicate ids, missing parents, cycles and several roots, and on
/// several heads unless `target` names a revision.
pub fn load(dir: &Path, target: &LoadTarget) -> Result<RevisionGraph> {
    let mut revisions = Vec::new();
    for path in revision_files(dir)? {
        let revision = parse_revision_file(&path)?;
        debug!(revision = %revision.id, path = %path.display(), "Parsed revision");
        revisions.push(revision);
    }

    let graph = RevisionGraph::build(revisions)?;
    let resolved = graph.resolve(target)?;
    info!(
        revisions = graph.len(),
        target = resolved.as_ref().map_or("<none>", |id| id.as_str()),
        "Loaded revision graph"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_initial.toml", "id = \"0001_initial\"\n");
        write(
            dir.path(),
            "0002_next.toml",
            "id = \"0002_next\"\nparents = [\"0001_initial\"]\n",
        );
        write(dir.path(), "README.md", "not a revision");

        let graph = load(dir.path(), &LoadTarget::Head).unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_parse_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_broken.toml", "id = ");

        match load(dir.path(), &LoadTarget::Head) {
            Err(GraphError::Parse { path, .. }) => {
                assert!(path.ends_with("0001_broken.toml"));
            }
            other => panic!("Expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_directory() {
        let result = load(Path::new("/nonexistent/revisions"), &LoadTarget::Head);
        assert!(matches!(result, Err(GraphError::Io { .. })));
    }

    #[test]
    fn test_unknown_named_target() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_initial.toml", "id = \"0001_initial\"\n");

        let result = load(dir.path(), &LoadTarget::Named("0009_missing".into()));
        assert!(matches!(result, Err(GraphError::UnknownRevision(_))));
    }
}
