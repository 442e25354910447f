//! Address templates.
//!
//! A template is a URI with placeholders that are filled in from a source
//! URI:
//!
//! | Placeholder | Value for `file:///in/box/a.tiff` |
//! |-------------|-----------------------------------|
//! | `{{ scheme }}` | `file` (or the explicit target scheme) |
//! | `{{ filename }}` | `a.tiff` |
//! | `{{ basename }}` | `a` |
//! | `{{ extension }}` | `.tiff` (or the requested output extension) |
//! | `{{ dir_parts[-1..-1] }}` | `box` |
//!
//! `dir_parts[a..b]` is an inclusive slice of the directory segments.
//! Negative bounds count from the end; bounds outside the segment list give
//! an empty string. A `?query` on the template is carried through untouched.
//!
//! Placeholders that do not match the grammar are left in the output as
//! literal text.

use crate::error::DerivationError;
use crate::uri::{split_extension, LocationUri};
use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};

/// Base-name suffix carried by monochrome intermediates.
///
/// Stripped before substitution so `a.mono.tiff` derives to the same names as
/// `a.tiff`.
pub const MONOCHROME_SUFFIX: &str = ".mono";

static DIR_PARTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*dir_parts\[(?P<left>-?\d+)\.\.(?P<right>-?\d+)\]\s*\}\}").unwrap()
});
static FILENAME: Lazy<Regex> = Lazy::new(|| placeholder("filename"));
static BASENAME: Lazy<Regex> = Lazy::new(|| placeholder("basename"));
static EXTENSION: Lazy<Regex> = Lazy::new(|| placeholder("extension"));
static SCHEME: Lazy<Regex> = Lazy::new(|| placeholder("scheme"));

fn placeholder(name: &str) -> Regex {
    Regex::new(&format!(r"\{{\{{\s*{name}\s*\}}\}}")).unwrap()
}

/// Extension given to a derived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputExtension {
    /// A fixed extension such as `hocr` or `mono.tiff`. The leading dot is optional.
    Literal(String),
    /// Reuse the source file's extension.
    InheritSource,
}

impl OutputExtension {
    pub fn literal(ext: impl Into<String>) -> Self {
        Self::Literal(ext.into())
    }

    /// The extension to substitute, with its leading dot.
    pub fn resolve(&self, source_extension: &str) -> String {
        match self {
            Self::Literal(ext) if ext.starts_with('.') => ext.clone(),
            Self::Literal(ext) => format!(".{ext}"),
            Self::InheritSource => source_extension.to_string(),
        }
    }

    /// The extension without its leading dot, if literal.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(ext) => Some(ext.trim_start_matches('.')),
            Self::InheritSource => None,
        }
    }
}

/// Rewrite `source` through `template`.
///
/// ```rust
/// use edgequake_derivatives::template::rewrite;
///
/// let out = rewrite(
///     "file:///a/b/c/file.pdf",
///     "file:///out/{{dir_parts[-2..-1]}}/{{filename}}",
///     None,
/// )
/// .unwrap();
/// assert_eq!(out, "file:///out/b/c/file.pdf");
/// ```
pub fn rewrite(
    source: &str,
    template: &str,
    target_scheme: Option<&str>,
) -> Result<String, DerivationError> {
    Rewrite::new(source, template)
        .target_scheme(target_scheme)
        .apply()
}

/// A single rewrite with every knob exposed.
#[derive(Debug, Clone)]
pub struct Rewrite<'a> {
    source: &'a str,
    template: &'a str,
    target_scheme: Option<&'a str>,
    extension: Option<&'a OutputExtension>,
    file_name: Option<&'a str>,
    base_name: Option<&'a str>,
    separator: &'a str,
}

impl<'a> Rewrite<'a> {
    pub fn new(source: &'a str, template: &'a str) -> Self {
        Self {
            source,
            template,
            target_scheme: None,
            extension: None,
            file_name: None,
            base_name: None,
            separator: "/",
        }
    }

    /// Value for `{{ scheme }}`. Defaults to the source's scheme.
    pub fn target_scheme(mut self, scheme: Option<&'a str>) -> Self {
        self.target_scheme = scheme;
        self
    }

    /// Value for `{{ extension }}`. Defaults to the source's extension.
    pub fn extension(mut self, extension: Option<&'a OutputExtension>) -> Self {
        self.extension = extension;
        self
    }

    /// Override for `{{ filename }}`.
    pub fn file_name(mut self, name: &'a str) -> Self {
        self.file_name = Some(name);
        self
    }

    /// Override for `{{ basename }}`. Not subject to suffix stripping.
    pub fn base_name(mut self, name: &'a str) -> Self {
        self.base_name = Some(name);
        self
    }

    pub fn separator(mut self, separator: &'a str) -> Self {
        self.separator = separator;
        self
    }

    pub fn apply(&self) -> Result<String, DerivationError> {
        let (source_scheme, rest) =
            LocationUri::split_scheme(self.source).ok_or_else(|| DerivationError::MissingScheme {
                uri: self.source.to_string(),
            })?;
        let path = rest.split_once('?').map_or(rest, |(p, _)| p);

        let mut parts: Vec<&str> = path.split(self.separator).collect();
        let source_file_name = parts.pop().unwrap_or_default();
        let dir_parts = parts;

        let (source_base, source_ext) = split_extension(source_file_name);
        let base_name = match self.base_name {
            Some(name) => name,
            None => source_base
                .strip_suffix(MONOCHROME_SUFFIX)
                .unwrap_or(source_base),
        };
        let file_name = self.file_name.unwrap_or(source_file_name);
        let extension = match self.extension {
            Some(ext) => ext.resolve(source_ext),
            None => source_ext.to_string(),
        };
        let scheme = self.target_scheme.unwrap_or(source_scheme);

        let (body, query) = split_query(self.template);

        let out = DIR_PARTS.replace_all(body, |caps: &Captures| {
            let bounds = (caps["left"].parse::<i64>(), caps["right"].parse::<i64>());
            match bounds {
                (Ok(left), Ok(right)) => slice_inclusive(&dir_parts, left, right).join(self.separator),
                _ => caps[0].to_string(),
            }
        });
        let out = FILENAME.replace_all(&out, NoExpand(file_name));
        let out = BASENAME.replace_all(&out, NoExpand(base_name));
        let out = EXTENSION.replace_all(&out, NoExpand(&extension));
        let out = SCHEME.replace_all(&out, NoExpand(scheme));

        Ok(match query {
            Some(q) => format!("{out}?{q}"),
            None => out.into_owned(),
        })
    }
}

/// The template an upstream generator uses so its outputs sit beside the
/// final derivative: the template's directory followed by
/// `{{ basename }}{{ extension }}`.
pub fn upstream_template(template: &str) -> String {
    let (body, query) = split_query(template);
    let directory = body.rfind('/').map_or("", |i| &body[..i]);
    let mut out = format!("{directory}/{{{{ basename }}}}{{{{ extension }}}}");
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    out
}

/// The literal scheme of a template, when it has one.
pub(crate) fn literal_scheme(template: &str) -> Option<&str> {
    LocationUri::split_scheme(template).map(|(scheme, _)| scheme)
}

fn split_query(template: &str) -> (&str, Option<&str>) {
    match template.split_once('?') {
        Some((body, query)) => (body, Some(query)),
        None => (template, None),
    }
}

/// Inclusive slice with negative indices counting from the end.
///
/// A start before the first or past the last element, or an end before the
/// start, gives an empty slice. The end is clamped to the last element.
fn slice_inclusive<'s, T>(items: &'s [T], left: i64, right: i64) -> &'s [T] {
    let len = items.len() as i64;
    let start = if left < 0 { left + len } else { left };
    let end = if right < 0 { right + len } else { right };
    if start < 0 || start >= len || end < start {
        return &[];
    }
    let end = end.min(len - 1);
    &items[start as usize..=end as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_slice_substitution() {
        let out = rewrite(
            "file:///a/b/c/file.pdf",
            "file:///out/{{dir_parts[-2..-1]}}/{{filename}}",
            None,
        )
        .unwrap();
        assert_eq!(out, "file:///out/b/c/file.pdf");
    }

    #[test]
    fn cross_scheme_substitution() {
        let out = rewrite("aws:///x/y/file.pdf", "{{scheme}}:///dest/{{filename}}", None).unwrap();
        assert_eq!(out, "aws:///dest/file.pdf");
    }

    #[test]
    fn explicit_scheme_wins() {
        let out = rewrite(
            "file:///x/y/file.pdf",
            "{{ scheme }}://bucket.s3.us-east-1.amazonaws.com/{{ filename }}",
            Some("s3"),
        )
        .unwrap();
        assert_eq!(out, "s3://bucket.s3.us-east-1.amazonaws.com/file.pdf");
    }

    #[test]
    fn rewriting_is_idempotent() {
        let source = "s3://scans.s3.us-east-1.amazonaws.com/box/folder/a.tiff";
        let template = "file:///out/{{ dir_parts[1..-1] }}/{{ basename }}{{ extension }}?x=1";
        let first = rewrite(source, template, None).unwrap();
        let second = rewrite(source, template, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "file:///out/box/folder/a.tiff?x=1");
    }

    #[test]
    fn literal_extension_gets_a_dot() {
        let hocr = OutputExtension::literal("hocr");
        let out = Rewrite::new("file:///in/a.tiff", "file:///out/{{basename}}{{extension}}")
            .extension(Some(&hocr))
            .apply()
            .unwrap();
        assert_eq!(out, "file:///out/a.hocr");

        let dotted = OutputExtension::literal(".mono.tiff");
        let out = Rewrite::new("file:///in/a.tiff", "file:///out/{{basename}}{{extension}}")
            .extension(Some(&dotted))
            .apply()
            .unwrap();
        assert_eq!(out, "file:///out/a.mono.tiff");
    }

    #[test]
    fn inherit_source_extension() {
        let out = Rewrite::new("file:///in/a.jp2", "file:///out/{{basename}}{{extension}}")
            .extension(Some(&OutputExtension::InheritSource))
            .apply()
            .unwrap();
        assert_eq!(out, "file:///out/a.jp2");
    }

    #[test]
    fn monochrome_suffix_is_stripped() {
        let hocr = OutputExtension::literal("hocr");
        let from_mono = Rewrite::new("file:///out/a.mono.tiff", "file:///out/{{basename}}{{extension}}")
            .extension(Some(&hocr))
            .apply()
            .unwrap();
        let from_original = Rewrite::new("file:///in/a.tiff", "file:///out/{{basename}}{{extension}}")
            .extension(Some(&hocr))
            .apply()
            .unwrap();
        assert_eq!(from_mono, from_original);
    }

    #[test]
    fn template_query_survives() {
        let out = rewrite(
            "file:///in/a.tiff",
            "sqs://us-east-1.amazonaws.com/1/q/{{filename}}?template=s3%3A%2F%2F{{basename}}",
            None,
        )
        .unwrap();
        // Placeholders in the query are not substituted.
        assert_eq!(
            out,
            "sqs://us-east-1.amazonaws.com/1/q/a.tiff?template=s3%3A%2F%2F{{basename}}"
        );
    }

    #[test]
    fn source_query_is_ignored() {
        let out = rewrite("file:///in/a.tiff?v=2", "file:///out/{{filename}}", None).unwrap();
        assert_eq!(out, "file:///out/a.tiff");
    }

    #[test]
    fn unmatched_placeholders_stay_literal() {
        let out = rewrite("file:///in/a.tiff", "file:///out/{{ nope }}/{{dir_parts[1..}}", None).unwrap();
        assert_eq!(out, "file:///out/{{ nope }}/{{dir_parts[1..}}");
    }

    #[test]
    fn out_of_range_slices_are_empty() {
        let parts = ["", "a", "b", "c"];
        assert_eq!(slice_inclusive(&parts, -2, -1), &["b", "c"]);
        assert_eq!(slice_inclusive(&parts, 1, 10), &["a", "b", "c"]);
        assert!(slice_inclusive(&parts, -9, -1).is_empty());
        assert!(slice_inclusive(&parts, 2, 1).is_empty());
        assert!(slice_inclusive(&parts, 4, 5).is_empty());
    }

    #[test]
    fn custom_separator() {
        let out = Rewrite::new("file://a:b:c.pdf", "file://out:{{dir_parts[-1..-1]}}:{{filename}}")
            .separator(":")
            .apply()
            .unwrap();
        assert_eq!(out, "file://out:b:c.pdf");
    }

    #[test]
    fn missing_scheme() {
        let err = rewrite("/in/a.tiff", "file:///out/{{filename}}", None).unwrap_err();
        assert!(matches!(err, DerivationError::MissingScheme { .. }));
    }

    #[test]
    fn upstream_template_keeps_directory_and_query() {
        assert_eq!(
            upstream_template("file:///out/{{dir_parts[-1..-1]}}/{{basename}}{{extension}}?q=1"),
            "file:///out/{{dir_parts[-1..-1]}}/{{ basename }}{{ extension }}?q=1"
        );
    }
}
