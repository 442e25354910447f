//! Glob matching for backends without native wildcard search.
//!
//! `*` and `?` stay inside one path segment, `**` crosses segments and `\`
//! makes the next character literal. Everything else matches literally.

use regex::Regex;

const WILDCARDS: [char; 2] = ['*', '?'];
const ESCAPE: char = '\\';

/// Escape `literal` so every character in it matches itself.
pub(crate) fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if c == ESCAPE || WILDCARDS.contains(&c) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Compile a glob into an anchored regex.
pub(crate) fn to_regex(pattern: &str) -> Regex {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                // A trailing escape matches a literal backslash.
                let literal = chars.next().unwrap_or(ESCAPE);
                re.push_str(&regex::escape(&literal.to_string()));
            }
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories.
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    // Every non-wildcard character is escaped, so the pattern is always valid.
    Regex::new(&re).unwrap()
}

/// Byte offset of the first unescaped wildcard, or the pattern length.
fn wildcard_offset(pattern: &str) -> usize {
    let mut chars = pattern.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            ESCAPE => {
                chars.next();
            }
            c if WILDCARDS.contains(&c) => return i,
            _ => {}
        }
    }
    pattern.len()
}

/// The raw pattern text up to the last `/` before the first wildcard.
fn raw_directory(pattern: &str) -> &str {
    let prefix = &pattern[..wildcard_offset(pattern)];
    prefix.rfind('/').map_or("", |i| &prefix[..i])
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            out.push(chars.next().unwrap_or(ESCAPE));
        } else {
            out.push(c);
        }
    }
    out
}

/// The literal text before the first wildcard, escapes removed.
pub(crate) fn literal_prefix(pattern: &str) -> String {
    unescape(&pattern[..wildcard_offset(pattern)])
}

/// The deepest directory that contains every match: the literal prefix cut
/// back to its last `/`.
pub(crate) fn literal_directory(pattern: &str) -> String {
    unescape(raw_directory(pattern))
}

/// Directory levels a match can sit below the literal directory, or `None`
/// when `**` makes it unbounded.
pub(crate) fn max_depth(pattern: &str) -> Option<usize> {
    if pattern.contains("**") {
        return None;
    }
    let dir = raw_directory(pattern);
    let tail = pattern[dir.len()..].trim_start_matches('/');
    Some(tail.split('/').count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_stays_in_segment() {
        let re = to_regex("/out/a--page-*.tiff");
        assert!(re.is_match("/out/a--page-1.tiff"));
        assert!(re.is_match("/out/a--page-12.tiff"));
        assert!(!re.is_match("/out/sub/a--page-1.tiff"));
        assert!(!re.is_match("/out/b--page-1.tiff"));
        assert!(!re.is_match("/out/a--page-1.tiff.bak"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let re = to_regex("box/**/*.hocr");
        assert!(re.is_match("box/a.hocr"));
        assert!(re.is_match("box/x/y/a.hocr"));
        assert!(!re.is_match("other/a.hocr"));
    }

    #[test]
    fn question_mark_and_literals() {
        let re = to_regex("a?.(1).tiff");
        assert!(re.is_match("ab.(1).tiff"));
        assert!(!re.is_match("ab.(1)xtiff"));
    }

    #[test]
    fn prefixes() {
        assert_eq!(literal_prefix("box/a--page-*.tiff"), "box/a--page-");
        assert_eq!(literal_directory("box/a--page-*.tiff"), "box");
        assert_eq!(literal_directory("*.tiff"), "");
        assert_eq!(literal_prefix("box/a.tiff"), "box/a.tiff");
    }

    #[test]
    fn escaped_wildcards_are_literal() {
        let pattern = format!("{}--page-*.tiff", escape("box/what?*"));
        assert_eq!(pattern, "box/what\\?\\*--page-*.tiff");

        let re = to_regex(&pattern);
        assert!(re.is_match("box/what?*--page-1.tiff"));
        assert!(!re.is_match("box/whatX--page-1.tiff"));
        assert!(!re.is_match("box/what?ab--page-1.tiff"));

        assert_eq!(literal_prefix(&pattern), "box/what?*--page-");
        assert_eq!(literal_directory(&pattern), "box");
        assert_eq!(max_depth(&pattern), Some(1));
    }

    #[test]
    fn escaped_backslash() {
        assert_eq!(escape("a\\b"), "a\\\\b");
        assert!(to_regex(&escape("a\\b")).is_match("a\\b"));
    }

    #[test]
    fn depth() {
        assert_eq!(max_depth("/out/a--page-*.tiff"), Some(1));
        assert_eq!(max_depth("/out/*/x/*.tiff"), Some(3));
        assert_eq!(max_depth("/out/**/*.tiff"), None);
    }
}
