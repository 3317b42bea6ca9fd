use std::collections::HashMap;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

/// Where module sources can be found when the scheduler asks for a unit that was not given to it
/// up front.
#[derive(Debug, Default)]
pub struct Input {
    module_paths: HashMap<String, Utf8PathBuf>,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `dir` and records every `.mod` file, keyed by file stem. Returns how many modules
    /// were found. The first directory to provide a name wins.
    pub fn add_search_dir(&mut self, dir: &Utf8Path) -> anyhow::Result<usize> {
        let mut found = 0;
        for path in list_module_files(dir)? {
            let Some(stem) = path.file_stem() else {
                continue;
            };
            if let Some(previous) = self.module_paths.get(stem) {
                warn!("module `{stem}` at {path} shadowed by {previous}");
                continue;
            }
            self.module_paths.insert(stem.to_owned(), path);
            found += 1;
        }
        Ok(found)
    }

    pub fn module_exists(&self, name: &str) -> bool {
        self.module_paths.contains_key(name)
    }

    /// Reads the source text of a module, if any search directory provides it. I/O errors are
    /// logged and treated as the module not existing.
    pub fn source(&self, name: &str) -> Option<String> {
        let path = self.module_paths.get(name)?;
        match read_module_file(path) {
            Ok(text) => Some(text),
            Err(error) => {
                warn!("module `{name}` cannot be read: {error:?}");
                None
            }
        }
    }
}

pub fn list_module_files(dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("{dir:?} is not a directory");
    }

    let mut module_file_paths = vec![];
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        let path = entry.path();
        if let Some(path) = Utf8Path::from_path(path) {
            if path.is_file() && path.extension() == Some("mod") {
                module_file_paths.push(path.to_owned());
            }
        } else {
            warn!("path contains invalid UTF-8: {path:?}");
        }
    }
    module_file_paths.sort();
    Ok(module_file_paths)
}

pub fn read_module_file(path: &Utf8Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read module file at {path:?}"))
}
