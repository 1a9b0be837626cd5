//! Utility functions for the line-oriented configuration files.

/// Split the text content into `(line_number, fields)` pairs, skipping blank
/// lines and `#` comment lines. Line numbers are 1-based.
pub(crate) fn significant_lines(content: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    content.lines().enumerate().filter_map(|(idx, line)| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            None
        } else {
            Some((idx + 1, line.split_whitespace().collect()))
        }
    })
}

/// Location and task names: a lowercase letter followed by lowercase
/// letters, digits, `_` or `-`.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
        _ => false,
    }
}

/// Replace every `{key}` in `arg` with its value.
pub(crate) fn expand_placeholders(arg: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(arg.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}
