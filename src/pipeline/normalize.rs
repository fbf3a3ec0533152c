// src/pipeline/normalize.rs

//! HTML normalization.
//!
//! Turns a fetched document into its canonical text form: one line per
//! block of visible text, volatile regions removed, whitespace collapsed.
//! Two fetches of an unchanged page must produce byte-identical content,
//! so everything here is deterministic and free of I/O.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, Result};
use crate::models::{CanonicalForm, ExtractedFields, ExtractionRules, SuppressRule};
use crate::utils::{collapse_whitespace, content_hash};

/// Elements whose content is never visible text.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Elements that start and end a line.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "caption", "dd", "div", "dl", "dt",
    "fieldset", "figcaption", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hr", "li", "main", "nav", "ol", "option", "p", "pre", "section", "table", "title", "tr",
    "ul",
];

/// Elements whose text is separated from its neighbours on the same line.
const CELL_TAGS: &[&str] = &["td", "th"];

struct CompiledField {
    name: String,
    selector: Selector,
    attr: Option<String>,
    pattern: Option<Regex>,
}

/// Compiled extraction rules for one target.
pub struct Normalizer {
    suppress_selectors: Vec<Selector>,
    suppress_patterns: Vec<(Regex, String)>,
    fields: Vec<CompiledField>,
}

impl Normalizer {
    /// Compile the rules, failing on the first invalid regex or CSS selector.
    pub fn new(rules: &ExtractionRules) -> Result<Self> {
        let mut suppress_selectors = Vec::new();
        let mut suppress_patterns = Vec::new();

        for rule in &rules.suppress {
            match rule {
                SuppressRule::Selector { css } => suppress_selectors.push(parse_selector(css)?),
                SuppressRule::Regex {
                    pattern,
                    replacement,
                } => suppress_patterns.push((Regex::new(pattern)?, replacement.clone())),
            }
        }

        let fields = rules
            .fields
            .iter()
            .map(|field| -> Result<CompiledField> {
                Ok(CompiledField {
                    name: field.name.clone(),
                    selector: parse_selector(&field.selector)?,
                    attr: field.attr.clone(),
                    pattern: field.pattern.as_deref().map(Regex::new).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            suppress_selectors,
            suppress_patterns,
            fields,
        })
    }

    /// Produce the canonical form of a raw HTML document.
    pub fn normalize(&self, raw: &str) -> CanonicalForm {
        let document = Html::parse_document(raw);

        let mut lines = Vec::new();
        let mut current = String::new();
        self.collect_text(document.root_element(), &mut lines, &mut current);
        self.flush(&mut current, &mut lines);

        let content = lines.join("\n");
        let hash = content_hash(&content);

        CanonicalForm {
            content,
            hash,
            extracted_fields: self.extract_fields(&document),
        }
    }

    fn collect_text(&self, element: ElementRef<'_>, lines: &mut Vec<String>, current: &mut String) {
        for child in element.children() {
            if let Some(text) = child.value().as_text() {
                current.push_str(text);
                continue;
            }

            let Some(child) = ElementRef::wrap(child) else {
                continue;
            };
            let name = child.value().name();
            if SKIPPED_TAGS.contains(&name) || self.is_suppressed(&child) {
                continue;
            }

            if name == "br" {
                self.flush(current, lines);
                continue;
            }

            let block = BLOCK_TAGS.contains(&name);
            let cell = CELL_TAGS.contains(&name);
            if block {
                self.flush(current, lines);
            } else if cell {
                current.push(' ');
            }

            self.collect_text(child, lines, current);

            if block {
                self.flush(current, lines);
            } else if cell {
                current.push(' ');
            }
        }
    }

    fn is_suppressed(&self, element: &ElementRef<'_>) -> bool {
        self.suppress_selectors.iter().any(|s| s.matches(element))
    }

    /// Emit the pending text as one canonical line, if anything survives.
    fn flush(&self, current: &mut String, lines: &mut Vec<String>) {
        if current.is_empty() {
            return;
        }

        let mut line = collapse_whitespace(current);
        current.clear();

        for (pattern, replacement) in &self.suppress_patterns {
            if pattern.is_match(&line) {
                line = collapse_whitespace(&pattern.replace_all(&line, replacement.as_str()));
            }
        }

        if !line.is_empty() {
            lines.push(line);
        }
    }

    fn extract_fields(&self, document: &Html) -> ExtractedFields {
        self.fields
            .iter()
            .map(|field| {
                let value = extract_field(document, field);
                if value.is_none() {
                    log::debug!("Field '{}' not found", field.name);
                }
                (field.name.clone(), value)
            })
            .collect()
    }
}

fn extract_field(document: &Html, field: &CompiledField) -> Option<String> {
    let element = document.select(&field.selector).next()?;

    let raw = match &field.attr {
        Some(attr) => element.value().attr(attr)?.trim().to_string(),
        None => collapse_whitespace(&element.text().collect::<String>()),
    };

    let value = match &field.pattern {
        Some(pattern) => {
            let captures = pattern.captures(&raw)?;
            captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().trim().to_string())?
        }
        None => raw,
    };

    (!value.is_empty()).then_some(value)
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| AppError::selector(css, format!("{e:?}")))
}

/// Normalize a document with freshly compiled rules.
pub fn normalize(raw: &str, rules: &ExtractionRules) -> Result<CanonicalForm> {
    Ok(Normalizer::new(rules)?.normalize(raw))
}
