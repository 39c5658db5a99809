//! Templated reference patterns.
//!
//! A pattern is a sequence of segments, each either a literal or a
//! single-name wildcard written `{name}`. Matching is greedy-left: a
//! wildcard absorbs input until the next literal matches, and the final
//! wildcard absorbs the remainder. Patterns without a `:` get `:latest`
//! appended before parsing, mirroring reference defaulting.

use std::cmp::Ordering;
use std::collections::HashMap;

use stratum_core::{Error, Result};

/// One pattern segment: a literal run or a named wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Literal text, or the wildcard's parameter name.
    pub text: String,
    pub wildcard: bool,
}

/// A parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse a pattern string. `{}` and an unbalanced `{` are errors.
    pub fn parse(s: &str) -> Result<Self> {
        let normalized = if s.contains(':') {
            s.to_string()
        } else {
            format!("{s}:latest")
        };

        Ok(Self {
            segments: parse_segments(&normalized)?,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Match `input` against the pattern, returning captured parameters.
    ///
    /// The match succeeds only when the input is fully consumed.
    pub fn matches(&self, input: &str) -> Option<HashMap<String, String>> {
        match_segments(&self.segments, input)
    }

    /// Specificity comparison: `Less` sorts first and is matched first.
    ///
    /// Single-segment patterns are special-cased: a lone literal is an
    /// exact reference (most specific), a lone wildcard matches anything
    /// (most general). Otherwise literal-first patterns beat
    /// wildcard-first ones, longer paired literals beat shorter ones, and
    /// more segments beat fewer.
    pub fn specificity(&self, other: &Pattern) -> Ordering {
        let a = &self.segments;
        let b = &other.segments;

        if a.len() != b.len() {
            if a.len() == 1 {
                return single_segment_order(&a[0]);
            }
            if b.len() == 1 {
                return single_segment_order(&b[0]).reverse();
            }
        }

        if a[0].wildcard != b[0].wildcard {
            return if a[0].wildcard {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        for (sa, sb) in a.iter().zip(b.iter()) {
            if !sa.wildcard && !sb.wildcard && sa.text.len() != sb.text.len() {
                return sb.text.len().cmp(&sa.text.len());
            }
        }

        b.len().cmp(&a.len())
    }
}

fn single_segment_order(segment: &Segment) -> Ordering {
    if segment.wildcard {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

fn parse_segments(s: &str) -> Result<Vec<Segment>> {
    let bytes = s.as_bytes();
    let mut segments = Vec::new();
    let mut off = 0;

    while off < bytes.len() {
        // Literal run up to the next '{'.
        let start = off;
        while off < bytes.len() && bytes[off] != b'{' {
            off += 1;
        }
        if off > start {
            segments.push(Segment {
                text: s[start..off].to_string(),
                wildcard: false,
            });
        }
        if off == bytes.len() {
            break;
        }

        // Wildcard name up to the matching '}'.
        let start = off;
        while off < bytes.len() && bytes[off] != b'}' {
            off += 1;
        }
        if off == bytes.len() {
            return Err(Error::ConfigInvalid(format!("unmatched '{{' in {s:?}")));
        }
        if off == start + 1 {
            return Err(Error::ConfigInvalid(format!("empty '{{}}' in {s:?}")));
        }
        segments.push(Segment {
            text: s[start + 1..off].to_string(),
            wildcard: true,
        });
        off += 1;
    }

    Ok(segments)
}

fn match_segments(segments: &[Segment], input: &str) -> Option<HashMap<String, String>> {
    let bytes = input.as_bytes();
    let mut params = HashMap::new();
    let mut off = 0;

    for (i, segment) in segments.iter().enumerate() {
        if !segment.wildcard {
            if !bytes[off..].starts_with(segment.text.as_bytes()) {
                return None;
            }
            off += segment.text.len();
            continue;
        }

        if i == segments.len() - 1 {
            params.insert(
                segment.text.clone(),
                String::from_utf8_lossy(&bytes[off..]).into_owned(),
            );
            return Some(params);
        }

        // Advance until the next literal matches at the current offset.
        let next = segments[i + 1].text.as_bytes();
        let mut end = off;
        while end < bytes.len() && !bytes[end..].starts_with(next) {
            end += 1;
        }
        params.insert(
            segment.text.clone(),
            String::from_utf8_lossy(&bytes[off..end]).into_owned(),
        );
        off = end;
    }

    if off == bytes.len() {
        Some(params)
    } else {
        None
    }
}

/// Replace every `{name}` occurrence in `template` with its parameter.
pub fn substitute(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
