//! Tool catalog and target list.
//!
//! The catalog maps a category to its tools, and each tool's display name to a
//! command template such as `"subfinder -silent"`. Tools are presented as
//! labels of the form `[category] name`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::args::tokenize;
use crate::error::ValidationError;
use crate::{rlog_debug, Error, Result};

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[([^\]]+)\]\s*(\S.*?)\s*$").unwrap());

/// On-disk shape of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCatalog {
    /// category -> display name -> command template
    #[serde(default)]
    pub tools: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbot: Option<BbotSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BbotSection {
    #[serde(default)]
    pub target: String,
}

/// One tool, as looked up from a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub category: String,
    pub name: String,
    pub template: String,
}

/// A command template split into its executable and fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    /// Absolute path when found on `PATH`, otherwise the program as written.
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        rlog_debug!("ToolCatalog::load path={}", path.display());
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(json)?;
        rlog_debug!(
            "Catalog loaded: {} categories, {} tools",
            catalog.tools.len(),
            catalog.tools.values().map(BTreeMap::len).sum::<usize>()
        );
        Ok(catalog)
    }

    /// All tool labels, sorted by category then name.
    pub fn labels(&self) -> Vec<String> {
        self.tools
            .iter()
            .flat_map(|(category, tools)| tools.keys().map(move |name| label(category, name)))
            .collect()
    }

    pub fn get(&self, category: &str, name: &str) -> Option<CatalogEntry> {
        let template = self.tools.get(category)?.get(name)?;
        Some(CatalogEntry {
            category: category.to_string(),
            name: name.to_string(),
            template: template.clone(),
        })
    }

    /// Look up a `[category] name` label.
    pub fn lookup(&self, display_label: &str) -> Result<CatalogEntry> {
        let (category, name) = parse_label(display_label)?;
        self.get(&category, &name)
            .ok_or_else(|| Error::UnknownTool(display_label.trim().to_string()))
    }

    /// Default scan target from the `bbot` section, if one is configured.
    pub fn default_target(&self) -> Option<&str> {
        self.bbot
            .as_ref()
            .map(|b| b.target.trim())
            .filter(|t| !t.is_empty())
    }
}

impl CatalogEntry {
    pub fn label(&self) -> String {
        label(&self.category, &self.name)
    }

    /// Split the template and locate its program on `PATH`.
    ///
    /// A program that cannot be found is kept verbatim; the failure is then
    /// reported when the task is spawned.
    pub fn resolve(&self) -> Result<ResolvedCommand> {
        let mut words = tokenize(&self.template)?.into_iter();
        let program = words
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ValidationError::EmptyCommand(self.name.clone()))?;

        let program = if program.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(program)
        } else {
            which::which(&program).unwrap_or_else(|_| {
                rlog_debug!("'{}' not found on PATH", program);
                PathBuf::from(&program)
            })
        };

        Ok(ResolvedCommand {
            program,
            args: words.collect(),
        })
    }
}

pub fn label(category: &str, name: &str) -> String {
    format!("[{}] {}", category, name)
}

/// Split `[category] name` into its parts.
pub fn parse_label(display_label: &str) -> std::result::Result<(String, String), ValidationError> {
    let caps = LABEL_RE
        .captures(display_label)
        .ok_or_else(|| ValidationError::MalformedLabel(display_label.to_string()))?;
    Ok((caps[1].trim().to_string(), caps[2].to_string()))
}

/// Domains offered for quick selection, from `target_domains.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetList {
    #[serde(default)]
    pub domains: Vec<String>,
}

impl TargetList {
    pub fn load(path: &Path) -> Result<Self> {
        rlog_debug!("TargetList::load path={}", path.display());
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// The whole list as a raw domain string for the argument builder.
    pub fn joined(&self) -> String {
        self.domains.join(",")
    }
}
