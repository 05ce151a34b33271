//! Placeholder scanning for command and path templates.
//!
//! Templates use single-brace placeholders: `{name}`, `{name[0]}`,
//! `{name.attr}` or `{name:spec}`. Doubled braces (`{{`, `}}`) are literal
//! escapes. A placeholder counts only when it starts with an identifier
//! (`[A-Za-z_][A-Za-z0-9_]*`); anything else between braces is ignored by
//! the scanner and rejected by the renderer.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::{SubstitutionTable, is_reserved_substitution};

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").expect("identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    /// Text between a placeholder's braces.
    Field(&'a str),
}

/// Split a template into literal runs and placeholder fields.
///
/// Never fails: an opening brace without a matching close is literal text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let bytes = template.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let escaped = match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => Some("{"),
            b'}' if bytes.get(i + 1) == Some(&b'}') => Some("}"),
            _ => None,
        };
        if let Some(escape) = escaped {
            push_literal(&mut out, &template[literal_start..i]);
            out.push(Segment::Literal(escape));
            i += 2;
            literal_start = i;
            continue;
        }
        if bytes[i] == b'{'
            && let Some(end) = closing_brace(bytes, i)
        {
            push_literal(&mut out, &template[literal_start..i]);
            out.push(Segment::Field(&template[i + 1..end]));
            i = end + 1;
            literal_start = i;
            continue;
        }
        i += 1;
    }
    push_literal(&mut out, &template[literal_start..]);
    out
}

fn push_literal<'a>(out: &mut Vec<Segment<'a>>, text: &'a str) {
    if !text.is_empty() {
        out.push(Segment::Literal(text));
    }
}

/// Index of the brace closing the one at `open`, honoring nested fields in
/// format specs (`{value:{width}}`).
fn closing_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, byte) in bytes[open..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn leading_identifier(field: &str) -> Option<&str> {
    IDENTIFIER_RE.find(field).map(|m| m.as_str())
}

/// Distinct placeholder names referenced by `template`.
pub fn extract_variables(template: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_variables(template, &mut names);
    names
}

fn collect_variables(template: &str, names: &mut BTreeSet<String>) {
    for segment in segments(template) {
        let Segment::Field(field) = segment else {
            continue;
        };
        if let Some(name) = leading_identifier(field) {
            names.insert(name.to_string());
        }
        if let Some((_, format_spec)) = field.split_once(':') {
            collect_variables(format_spec, names);
        }
    }
}

/// Placeholder names referenced across `templates`, minus the reserved
/// names every run provides on its own.
pub fn variable_closure<'a, I>(templates: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names = BTreeSet::new();
    for template in templates {
        collect_variables(template, &mut names);
    }
    names.retain(|name| !is_reserved_substitution(name));
    names
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder '{name}' in '{template}'")]
    Unknown { name: String, template: String },
    #[error("unsupported placeholder '{{{field}}}' in '{template}'")]
    Unsupported { field: String, template: String },
    #[error("index {index} out of range for placeholder '{name}' ({len} value(s))")]
    IndexOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },
}

/// Substitute `{name}` and `{name[i]}` placeholders from `table`.
///
/// Multi-valued substitutions without an index are joined with spaces.
/// Attribute access, conversions and format specs are rejected.
pub fn render_template(template: &str, table: &SubstitutionTable) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    for segment in segments(template) {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Field(field) => rendered.push_str(&render_field(field, template, table)?),
        }
    }
    Ok(rendered)
}

fn render_field(
    field: &str,
    template: &str,
    table: &SubstitutionTable,
) -> Result<String, TemplateError> {
    let unsupported = || TemplateError::Unsupported {
        field: field.to_string(),
        template: template.to_string(),
    };
    let name = leading_identifier(field).ok_or_else(unsupported)?;
    let rest = &field[name.len()..];
    let index = if rest.is_empty() {
        None
    } else {
        let inner = rest
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(unsupported)?;
        Some(inner.parse::<usize>().map_err(|_| unsupported())?)
    };

    let value = table.get(name).ok_or_else(|| TemplateError::Unknown {
        name: name.to_string(),
        template: template.to_string(),
    })?;
    let values = value.values();
    match index {
        None => Ok(values.join(" ")),
        Some(index) => values
            .get(index)
            .cloned()
            .ok_or_else(|| TemplateError::IndexOutOfRange {
                name: name.to_string(),
                index,
                len: values.len(),
            }),
    }
}
