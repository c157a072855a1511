//! Declarative provider configuration (`mcp.json` style, JSON or TOML).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The only provider kind this crate can launch.
pub const STDIO: &str = "stdio";

/// A set of named providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(rename = "mcpServers", default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Directory relative arguments are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// How to launch one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
}

impl HubConfig {
    /// Load from a file; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let mut config = if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
        .map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;

        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

impl ProviderConfig {
    /// A missing `type` means stdio.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(STDIO)
    }

    pub fn is_stdio(&self) -> bool {
        self.kind() == STDIO
    }

    /// Arguments with relative paths resolved against `base_dir` when the
    /// resolved path exists. Everything else is passed through untouched.
    pub fn resolved_args(&self, base_dir: Option<&Path>) -> Vec<String> {
        let Some(base_dir) = base_dir else {
            return self.args.clone();
        };

        self.args
            .iter()
            .map(|arg| {
                if !is_relative_path(arg) {
                    return arg.clone();
                }
                let candidate = base_dir.join(arg);
                if candidate.exists() {
                    candidate.to_string_lossy().into_owned()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}

fn is_relative_path(arg: &str) -> bool {
    if arg.starts_with('-') {
        return false;
    }
    arg.starts_with("..")
        || (Path::new(arg).is_relative() && (arg.contains('/') || arg.contains('\\')))
}
