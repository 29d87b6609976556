//! Procfile parsing.
//!
//! A Procfile is a list of `name: command` lines. Order matters: a template's
//! position decides the port block it is assigned.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

/// One named command from the Procfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTemplate {
    /// Template name (`web`, `worker`, ...).
    pub name: String,
    /// Shell command line to run.
    pub command: String,
}

/// Parsed Procfile, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Procfile {
    pub entries: Vec<ProcessTemplate>,
}

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9_-]+):\s*(.+)$").expect("procfile pattern is valid")
    })
}

impl Procfile {
    /// Parses Procfile text. Blank lines and `#` comments are skipped.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(caps) = entry_regex().captures(line) else {
                bail!("invalid Procfile entry on line {}: {}", idx + 1, line);
            };
            let name = caps[1].to_string();
            if !seen.insert(name.clone()) {
                bail!("duplicate process name: {}", name);
            }
            entries.push(ProcessTemplate {
                name,
                command: caps[2].trim().to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// Length of the longest template name, used to pad output labels.
    pub fn longest_name(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.name.len())
            .max()
            .unwrap_or(0)
    }

    pub fn has_process(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }
}

/// Reads and parses the Procfile at `path`.
pub fn read_procfile(path: &Path) -> Result<Procfile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read Procfile {}", path.display()))?;
    Procfile::parse(&raw).with_context(|| format!("failed to parse Procfile {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_in_order() {
        let procfile = Procfile::parse(
            "web: bundle exec rails s -p $PORT\n\n# background jobs\nworker:   rake jobs:work\n",
        )
        .unwrap();
        assert_eq!(procfile.names(), vec!["web", "worker"]);
        assert_eq!(procfile.entries[0].command, "bundle exec rails s -p $PORT");
        assert_eq!(procfile.entries[1].command, "rake jobs:work");
    }

    #[test]
    fn longest_name_and_lookup() {
        let procfile = Procfile::parse("web: a\nscheduler: b\n").unwrap();
        assert_eq!(procfile.longest_name(), "scheduler".len());
        assert!(procfile.has_process("web"));
        assert!(!procfile.has_process("api"));
        assert_eq!(Procfile::default().longest_name(), 0);
    }

    #[test]
    fn rejects_malformed_line() {
        let err = Procfile::parse("web: ok\nthis is not an entry\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Procfile::parse("web: a\nweb: b\n").unwrap_err();
        assert!(err.to_string().contains("duplicate process name: web"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_procfile(&dir.path().join("Procfile")).unwrap_err();
        assert!(err.to_string().contains("failed to read Procfile"));
    }
}
