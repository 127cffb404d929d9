//! Masking of credential material in user-visible text.

use std::sync::LazyLock;

use regex::Regex;

const MASK: &str = "***";

static ASSIGNMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)([a-z_\-]*(?:password|passphrase|passwd|secret|token|private_key|key))(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
    )
    .ok()
});

static KEY_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?(-----END [A-Z ]*PRIVATE KEY-----|$)")
        .ok()
});

/// Replaces secret values in `text` with `***`.
///
/// Masks `name=value` / `name: value` pairs whose name ends in a credential
/// marker (password, passphrase, secret, token, key) and whole PEM private
/// key blocks.
pub fn redact_secrets(text: &str) -> String {
    let (Some(assignment), Some(key_block)) = (ASSIGNMENT.as_ref(), KEY_BLOCK.as_ref()) else {
        return MASK.to_string();
    };

    let without_keys = key_block.replace_all(text, "[private key redacted]");
    assignment
        .replace_all(&without_keys, format!("${{1}}${{2}}{MASK}").as_str())
        .into_owned()
}
