//! `{{NAME}}` placeholder substitution for installer-definition templates.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Placeholder values. Text values are XML-escaped on insertion; markup
/// values are inserted verbatim.
#[derive(Debug, Default, Clone)]
pub struct TemplateValues {
    values: BTreeMap<&'static str, String>,
}

impl TemplateValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &'static str, value: &str) -> Self {
        self.values.insert(name, xml_escape(value));
        self
    }

    pub fn markup(mut self, name: &'static str, value: String) -> Self {
        self.values.insert(name, value);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &&'static str> {
        self.values.keys()
    }
}

/// Substitute every placeholder in `template`.
///
/// Unknown or unterminated placeholders are errors, reported with the
/// 1-based line they start on.
pub fn render(template: &str, values: &TemplateValues) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 1024);
    let mut rest = template;
    let mut consumed = 0usize;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let line = line_of(template, consumed + start);
        let Some(end) = after_open.find("}}") else {
            bail!("unterminated placeholder on line {}", line);
        };
        let name = after_open[..end].trim();
        match values.values.get(name) {
            Some(value) => out.push_str(value),
            None => {
                let known = values.names().copied().collect::<Vec<_>>().join(", ");
                bail!(
                    "unknown placeholder '{{{{{}}}}}' on line {}; known placeholders: {}",
                    name,
                    line,
                    known
                );
            }
        }
        let advance = start + 2 + end + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}
