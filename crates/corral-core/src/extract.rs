//! Helpers for pulling JSON out of untrusted worker output.
//!
//! Workers are asked to return bare JSON, but in practice the text arrives
//! wrapped in markdown fences, prose, or both. These functions strip fences
//! and locate the first balanced bracketed substring with a scanner that is
//! aware of JSON string literals and escapes.

/// Remove markdown code-fence lines (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(raw: &str) -> String {
    if !raw.trim_start().starts_with("```") && !raw.contains("\n```") {
        return raw.to_string();
    }
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the first balanced `[...]` substring, if any.
pub fn first_json_array(text: &str) -> Option<&str> {
    first_balanced(text, '[', ']')
}

/// Extract the first balanced `{...}` substring, if any.
pub fn first_json_object(text: &str) -> Option<&str> {
    first_balanced(text, '{', '}')
}

/// Scan for the first balanced `open…close` region, ignoring brackets that
/// appear inside JSON string literals.
fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = find_outside_strings(text, open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    // Unbalanced input.
    None
}

/// Index of the first occurrence of `needle` that is not inside a string
/// literal.
fn find_outside_strings(text: &str, needle: char) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == needle && !in_string => return Some(idx),
            _ => {}
        }
    }
    None
}
