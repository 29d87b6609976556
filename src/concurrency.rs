//! Replica counts per template, parsed from `name=count[,name=count...]`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

/// Requested replica count per template name. Templates without an entry run
/// a single replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Concurrency {
    counts: HashMap<String, u16>,
}

impl Concurrency {
    /// Parses a concurrency string. Blank input means no overrides.
    pub fn parse(value: &str) -> Result<Self> {
        let mut counts = HashMap::new();
        if value.trim().is_empty() {
            return Ok(Self { counts });
        }

        for part in value.split(',') {
            let (name, count) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid concurrency entry {:?}, expected name=count", part))?;
            let (name, count) = (name.trim(), count.trim());
            if name.is_empty() || count.is_empty() {
                bail!("invalid concurrency entry {:?}, expected name=count", part);
            }
            let count = count
                .parse::<u16>()
                .map_err(|err| anyhow!("invalid replica count {:?} for {}: {}", count, name, err))?;
            counts.insert(name.to_string(), count);
        }
        Ok(Self { counts })
    }

    /// Replica count for `name`, defaulting to 1.
    pub fn replicas(&self, name: &str) -> u16 {
        self.counts.get(name).copied().unwrap_or(1)
    }
}
