//! Placeholder substitution for backend command lines, URLs and
//! environment values.
//!
//! `${{name}}` tokens are replaced from the backend's input values.
//! Unresolved placeholders are left intact with a warning, since
//! backends may intentionally contain literal unresolved tokens.

use std::collections::HashMap;
use tracing::warn;

/// Replace `${{name}}` tokens in `input` from `values`.
pub fn substitute(input: &str, values: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match values.get(name) {
                    Some(value) => output.push_str(value),
                    None => {
                        warn!(placeholder = %name, "Unresolved placeholder left intact");
                        output.push_str(&rest[start..start + 3 + end + 2]);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token, keep the remainder literally.
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    output.push_str(rest);
    output
}

/// Substitute every value of a map.
pub fn substitute_map(
    input: &HashMap<String, String>,
    values: &HashMap<String, String>,
) -> HashMap<String, String> {
    input
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("token".to_string(), "abc123".to_string());
        map.insert("host".to_string(), "example.com".to_string());
        map
    }

    #[test]
    fn test_simple_substitution() {
        assert_eq!(
            substitute("https://${{host}}/mcp", &values()),
            "https://example.com/mcp"
        );
    }

    #[test]
    fn test_multiple_tokens() {
        assert_eq!(
            substitute("${{host}}:${{token}}", &values()),
            "example.com:abc123"
        );
    }

    #[test]
    fn test_unresolved_left_intact() {
        assert_eq!(
            substitute("Bearer ${{missing}}", &values()),
            "Bearer ${{missing}}"
        );
    }

    #[test]
    fn test_unterminated_token_kept() {
        assert_eq!(substitute("x ${{host", &values()), "x ${{host");
    }

    #[test]
    fn test_no_tokens() {
        assert_eq!(substitute("plain text", &values()), "plain text");
    }

    #[test]
    fn test_whitespace_in_token() {
        assert_eq!(substitute("${{ host }}", &values()), "example.com");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(substitute("", &values()), "");
    }

    #[test]
    fn test_substitute_map() {
        let mut env = HashMap::new();
        env.insert("API_TOKEN".to_string(), "${{token}}".to_string());
        env.insert("PLAIN".to_string(), "keep".to_string());

        let result = substitute_map(&env, &values());
        assert_eq!(result.get("API_TOKEN").unwrap(), "abc123");
        assert_eq!(result.get("PLAIN").unwrap(), "keep");
    }
}
