//! Glob matching for cache rules and cache-key invalidation.
//!
//! Two flavours share one translator:
//! * path globs, where `*` and `?` stop at `/` and `**` crosses segments
//! * key globs (Redis `SCAN MATCH` semantics), where `*` matches anything
use regex::Regex;

/// Compile a path glob such as `/models/*/preview` or `/assets/**`.
pub fn path_glob(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&translate(pattern, Some('/')))
}

/// Compile a key glob such as `gen:GET:*`.
pub fn key_glob(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&translate(pattern, None))
}

fn translate(pattern: &str, separator: Option<char>) -> String {
    let any_in_segment = match separator {
        Some(sep) => format!("[^{}]", regex::escape(&sep.to_string())),
        None => ".".to_string(),
    };

    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => {
                out.push_str(&any_in_segment);
                out.push('*');
            }
            '?' => out.push_str(&any_in_segment),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}
