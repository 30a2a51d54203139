//! Validation for the string identifiers used as query/mutation/action path
//! components on the wire (`query`, `mutation`, `action` message fields).

pub const MAX_IDENTIFIER_LEN: usize = 1024;

pub fn check_valid_path_component(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!("Path component cannot be empty.");
    }
    if s.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!(
            "Path component is too long ({} > maximum {}).",
            s.len(),
            MAX_IDENTIFIER_LEN
        );
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '/' || c == '-')
    {
        anyhow::bail!(
            "Path component {s} can only contain alphanumeric characters, underscores, \
             periods, colons, slashes, or hyphens."
        );
    }
    if !s.chars().any(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("Path component {s} must have at least one alphanumeric character.");
    }
    Ok(())
}
