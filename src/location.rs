//! Location registry: named vantage points and how to reach them.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{ConfigError, ConfigIssue};
use crate::utils;

/// Work-file target that fans a task out to every location; no location
/// may take this name.
pub const ALL_LOCATIONS: &str = "all";

/// How traffic for a location leaves the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMethod {
    /// No tunnel; tasks run on the host network.
    Direct,
    /// Through a tunnel run by an external helper process.
    TunneledVia {
        /// Candidate connection configs, tried round-robin on failure.
        configs: Vec<PathBuf>,
        /// Extra arguments handed to the helper after the config path.
        extra_args: Vec<String>,
    },
}

/// A named network vantage point. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Unique identifier, e.g. `us_east`.
    pub name: String,
    /// Connection method.
    pub method: ConnectionMethod,
}

impl Location {
    /// A location reached without a tunnel.
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: ConnectionMethod::Direct,
        }
    }

    /// A location reached through a tunnel helper with the given candidate configs.
    pub fn tunneled(name: impl Into<String>, configs: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            method: ConnectionMethod::TunneledVia {
                configs,
                extra_args: Vec::new(),
            },
        }
    }

    /// Number of candidate configs; 1 for direct locations.
    pub fn candidate_count(&self) -> usize {
        match &self.method {
            ConnectionMethod::Direct => 1,
            ConnectionMethod::TunneledVia { configs, .. } => configs.len().max(1),
        }
    }

    /// Whether tasks for this location go through a tunnel.
    pub fn is_tunneled(&self) -> bool {
        matches!(self.method, ConnectionMethod::TunneledVia { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Read and parse a location file. Relative glob patterns are resolved
/// against the directory containing the file.
pub fn load_locations(path: &Path) -> Result<Vec<Location>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_locations(&content, base_dir)
}

/// Parse location descriptors, one per line: `name method args...`.
///
/// `direct` takes no arguments. `ovpn` takes a glob pattern over connection
/// configs followed by optional helper arguments; every match becomes a
/// candidate, in sorted order.
pub fn parse_locations(content: &str, base_dir: &Path) -> Result<Vec<Location>, ConfigError> {
    let mut locations = Vec::new();
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for (line, fields) in utils::significant_lines(content) {
        let (name, method, args) = match fields.as_slice() {
            [name, method, args @ ..] => (*name, *method, args),
            [name] => {
                issues.push(ConfigIssue::new(line, format!("location `{name}` has no method")));
                continue;
            }
            [] => continue,
        };

        let mut ok = true;
        if !utils::is_valid_name(name) {
            issues.push(ConfigIssue::new(
                line,
                format!("invalid location name `{name}` (expected lowercase letters, digits, `_` or `-`)"),
            ));
            ok = false;
        } else if name == ALL_LOCATIONS {
            issues.push(ConfigIssue::new(line, format!("location name `{name}` is reserved")));
            ok = false;
        } else if !seen.insert(name.to_string()) {
            issues.push(ConfigIssue::new(line, format!("duplicate location `{name}`")));
            ok = false;
        }

        let method = match method {
            "direct" if args.is_empty() => Some(ConnectionMethod::Direct),
            "direct" => {
                issues.push(ConfigIssue::new(line, "method `direct` takes no arguments"));
                None
            }
            "ovpn" => match args {
                [] => {
                    issues.push(ConfigIssue::new(line, "method `ovpn` needs a config pattern"));
                    None
                }
                [pattern, extra @ ..] => match resolve_configs(pattern, base_dir) {
                    Ok(configs) => Some(ConnectionMethod::TunneledVia {
                        configs,
                        extra_args: extra.iter().map(|s| s.to_string()).collect(),
                    }),
                    Err(message) => {
                        issues.push(ConfigIssue::new(line, message));
                        None
                    }
                },
            },
            other => {
                issues.push(ConfigIssue::new(line, format!("unknown method `{other}`")));
                None
            }
        };

        if let (true, Some(method)) = (ok, method) {
            debug!("Registered location {} ({:?})", name, method);
            locations.push(Location {
                name: name.to_string(),
                method,
            });
        }
    }

    if issues.is_empty() {
        Ok(locations)
    } else {
        Err(ConfigError::Invalid { issues })
    }
}

fn resolve_configs(pattern: &str, base_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base_dir.join(pattern)
    };
    let full = full.to_string_lossy().into_owned();
    let paths = glob::glob(&full).map_err(|e| format!("bad config pattern `{pattern}`: {e}"))?;
    let mut configs: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    if configs.is_empty() {
        return Err(format!("config pattern `{pattern}` matches no files"));
    }
    configs.sort();
    Ok(configs)
}
