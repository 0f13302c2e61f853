use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QuarrelError, Result};

/// The pair of operations used to talk to one agent: where prompts go in
/// and where replies are read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub input: String,
    pub reply: String,
}

impl Route {
    pub fn new(input: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reply: reply.into(),
        }
    }
}

/// One entry of the routing file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Matched case-insensitively as a substring of the agent name.
    pub keyword: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub reply: Option<String>,
}

/// Ordered routing table. The first matching entry wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub selectors: Vec<RouteEntry>,
}

impl RoutingTable {
    /// Read and parse the routing file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| QuarrelError::Routing(e.to_string()))
    }

    /// Resolve the route for an agent name. Fields missing from the matched
    /// entry fall back to the default route field by field.
    pub fn resolve(&self, name: &str, default: &Route) -> Route {
        let name = name.to_lowercase();
        let entry = self.selectors.iter().find(|e| {
            let keyword = e.keyword.trim().to_lowercase();
            !keyword.is_empty() && name.contains(&keyword)
        });

        match entry {
            Some(e) => Route {
                input: e.input.clone().unwrap_or_else(|| default.input.clone()),
                reply: e.reply.clone().unwrap_or_else(|| default.reply.clone()),
            },
            None => default.clone(),
        }
    }
}

/// Resolves routes against a routing file that may be edited at any time.
///
/// The file is re-read on every call, so edits take effect on the next
/// dispatch or poll, even mid-run.
#[derive(Debug, Clone)]
pub struct RouteResolver {
    path: Option<PathBuf>,
    default: Route,
}

impl RouteResolver {
    pub fn new(path: Option<PathBuf>, default: Route) -> Self {
        Self { path, default }
    }

    /// A resolver that always returns the default route.
    pub fn fixed(default: Route) -> Self {
        Self {
            path: None,
            default,
        }
    }

    pub fn default_route(&self) -> &Route {
        &self.default
    }

    pub fn resolve(&self, name: &str) -> Route {
        let Some(ref path) = self.path else {
            return self.default.clone();
        };

        match RoutingTable::load(path) {
            Ok(table) => table.resolve(name, &self.default),
            Err(QuarrelError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No routing file, using default route");
                self.default.clone()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable routing file, using default route");
                self.default.clone()
            }
        }
    }
}
