//! Environment file (`.env`) loading.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Flat set of variables merged into every child's environment.
pub type Env = HashMap<String, String>;

/// Loads `KEY=VALUE` pairs from `path`.
///
/// When `required` is false a missing file yields an empty environment; this is
/// how the implicit `<procfile dir>/.env` is treated. Parse errors are always
/// reported.
pub fn read_env(path: &Path, required: bool) -> Result<Env> {
    if !required && !path.exists() {
        tracing::debug!(path = %path.display(), "no env file, using empty environment");
        return Ok(Env::new());
    }

    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read env file {}", path.display()))?;
    let mut env = Env::new();
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("failed to parse env file {}", path.display()))?;
        env.insert(key, value);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_pairs_comments_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# database\nDATABASE_URL=postgres://localhost/app\nGREETING=\"hello world\"\n\nEMPTY=\n",
        )
        .unwrap();
        let env = read_env(&path, true).unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env["DATABASE_URL"], "postgres://localhost/app");
        assert_eq!(env["GREETING"], "hello world");
        assert_eq!(env["EMPTY"], "");
    }

    #[test]
    fn missing_optional_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let env = read_env(&dir.path().join(".env"), false).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_env(&dir.path().join(".env.test"), true).unwrap_err();
        assert!(err.to_string().contains("failed to read env file"));
    }
}
