use crate::error::Error;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

lazy_static! {
    static ref PACKAGE_RE: Regex = Regex::new(r"^package\s+([A-Za-z0-9_.]+)").unwrap();
}

/// A policy document together with its declared namespace.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    /// Raw document text, uploaded as-is by the remote backend.
    pub text: String,
    /// Declared package, e.g. `aws.cost.idle_instances`.
    pub namespace: String,
}

/// Extract the declared package name from policy document text.
///
/// The first line matching `package <a.b.c>` wins; the caller never needs
/// to know the convention in advance.
pub fn extract_package_name(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| PACKAGE_RE.captures(line.trim()))
        .map(|caps| caps[1].to_string())
}

/// Map a namespace onto the evaluator's addressing path
/// (`a.b.c` -> `a/b/c`).
pub fn namespace_to_path(namespace: &str) -> String {
    namespace.replace('.', "/")
}

/// Read a policy document from disk and resolve its namespace.
///
/// A document with no recognizable package declaration is a configuration
/// error for that check only.
pub fn load_policy(path: &Path) -> Result<PolicyDocument> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read policy {}: {}", path.display(), e))
    })?;
    let namespace = extract_package_name(&text).ok_or_else(|| {
        Error::Configuration(format!(
            "no package declaration found in {}",
            path.display()
        ))
    })?;
    Ok(PolicyDocument { text, namespace })
}
