//! Name validation utilities.
//!
//! Node names double as namespace names and as the stem of interface
//! names, so they are restricted to what `ip` accepts everywhere.

use regex::Regex;
use std::sync::OnceLock;

/// Linux netdev names are limited to 15 bytes (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

fn node_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid node name regex"))
}

/// Build the name of the `index`-th interface of `node`, e.g. `r0-eth2`
pub fn interface_name(node: &str, index: usize) -> String {
    format!("{}-eth{}", node, index)
}

/// Validate a node name
///
/// # Examples
/// ```
/// use routemesh::utils::validation::validate_node_name;
///
/// assert!(validate_node_name("r0").is_ok());
/// assert!(validate_node_name("web_1").is_ok());
/// assert!(validate_node_name("0r").is_err());
/// assert!(validate_node_name("r-0").is_err());
/// ```
pub fn validate_node_name(name: &str) -> Result<(), String> {
    if node_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "'{}' must start with a letter and contain only letters, digits or '_'",
            name
        ))
    }
}

/// Validate a generated interface name against the kernel limit
pub fn validate_interface_name(name: &str) -> Result<(), String> {
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "interface name '{}' exceeds {} characters",
            name, MAX_INTERFACE_NAME_LEN
        ));
    }
    Ok(())
}
