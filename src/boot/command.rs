//! Word and argument helpers for boot command strings.
//!
//! Commands are whitespace-separated words. Kernel command lines are
//! space-separated `key` or `key=value` tokens.

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Split off the first word. Returns the word and the remainder with its
/// leading blanks removed, or `None` for a blank string.
pub fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(is_blank);
    if s.is_empty() {
        return None;
    }
    match s.find(is_blank) {
        Some(end) => Some((&s[..end], s[end..].trim_start_matches(is_blank))),
        None => Some((s, "")),
    }
}

/// Find the token `key` or `key=...` in a kernel command line.
///
/// Returns the value after `=`, or an empty string for a bare flag.
pub fn find_arg<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline.split(is_blank).find_map(|token| {
        let rest = token.strip_prefix(key)?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('=')
        }
    })
}

/// Value of a `key=value` token.
pub fn arg_value<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline.split(is_blank).find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

/// Whether `key` appears as a flag or `key=value` token.
pub fn has_arg(cmdline: &str, key: &str) -> bool {
    find_arg(cmdline, key).is_some()
}
