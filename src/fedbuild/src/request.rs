use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// What a client asks to have built and tested. Stored as a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub client_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Extra flags, split on whitespace and appended to the compiler command.
    #[serde(default)]
    pub compiler_options: String,
    /// Sources the build needs, as paths relative to the repository root.
    #[serde(default)]
    pub build_files: BTreeSet<String>,
    /// Sources that each compile into one test artifact.
    #[serde(default)]
    pub test_drivers: BTreeSet<String>,
}

fn default_language() -> String {
    "rust".to_owned()
}

impl BuildRequest {
    /// Reads a request file. Anything unreadable means there is nothing to do.
    pub fn parse<P: AsRef<Path>>(path: P) -> Option<BuildRequest> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("cannot read build request {}: {}", path.display(), e);
                return None;
            }
        };
        match toml::from_str(&content) {
            Ok(req) => Some(req),
            Err(e) => {
                log::warn!("malformed build request {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }

    /// Every file that has to be fetched before compiling.
    pub fn all_files(&self) -> BTreeSet<String> {
        self.build_files.union(&self.test_drivers).cloned().collect()
    }

    /// One compiler invocation per test driver, or a single one over all
    /// build files when there is no driver.
    pub fn compile_units(&self) -> Vec<Vec<String>> {
        if self.test_drivers.is_empty() {
            let all: Vec<String> = self.build_files.iter().map(|f| file_name(f)).collect();
            if all.is_empty() {
                Vec::new()
            } else {
                vec![all]
            }
        } else {
            self.test_drivers.iter().map(|d| vec![file_name(d)]).collect()
        }
    }

    pub fn options(&self) -> Vec<String> {
        self.compiler_options
            .split_whitespace()
            .map(str::to_owned)
            .collect()
    }
}

/// Uploads are flattened into one directory, so only the last component survives.
pub fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}
