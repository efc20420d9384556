use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Selectors;
use crate::fetcher::RenderedDocument;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Which parts of a row a field group was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    LabelValue,
    Label,
    Value,
    /// Row had neither label nor value; its whole text was taken.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldGroup {
    pub kind: FieldKind,
    pub values: Vec<String>,
}

impl FieldGroup {
    /// Build a group from a row's parts; `None` when every part is empty.
    pub fn from_parts(
        label: Option<String>,
        value: Option<String>,
        raw: Option<String>,
    ) -> Option<Self> {
        let label = label.filter(|s| !s.is_empty());
        let value = value.filter(|s| !s.is_empty());
        let (kind, values) = match (label, value) {
            (Some(l), Some(v)) => (FieldKind::LabelValue, vec![l, v]),
            (Some(l), None) => (FieldKind::Label, vec![l]),
            (None, Some(v)) => (FieldKind::Value, vec![v]),
            (None, None) => (FieldKind::Raw, vec![raw.filter(|s| !s.is_empty())?]),
        };
        Some(FieldGroup { kind, values })
    }

    pub fn label(&self) -> Option<&str> {
        match self.kind {
            FieldKind::LabelValue | FieldKind::Label => self.values.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self.kind {
            FieldKind::LabelValue => self.values.get(1).map(String::as_str),
            FieldKind::Value | FieldKind::Raw => self.values.first().map(String::as_str),
            FieldKind::Label => None,
        }
    }
}

/// Ordered field groups pulled from one page. Empty means "nothing found".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub groups: Vec<FieldGroup>,
}

impl Record {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

/// Pulls label/value rows out of the details container of a page.
pub struct FieldExtractor {
    container: Selector,
    row: Selector,
    label: Selector,
    value: Selector,
    link: Selector,
}

impl FieldExtractor {
    pub fn new(selectors: &Selectors) -> Result<Self> {
        Ok(FieldExtractor {
            container: parse_selector(&selectors.container)?,
            row: parse_selector(&selectors.row)?,
            label: parse_selector(&selectors.label)?,
            value: parse_selector(&selectors.value)?,
            link: parse_selector("a")?,
        })
    }

    pub fn extract(&self, document: &RenderedDocument) -> Record {
        let record = self.extract_html(&document.html);
        debug!(address = %document.address, groups = record.len(), "extracted");
        record
    }

    pub fn extract_html(&self, html: &str) -> Record {
        let doc = Html::parse_document(html);
        let Some(container) = doc.select(&self.container).next() else {
            return Record::default();
        };

        let groups = container
            .select(&self.row)
            .filter_map(|row| self.read_row(row))
            .collect();
        Record { groups }
    }

    fn read_row(&self, row: ElementRef) -> Option<FieldGroup> {
        let label = row
            .select(&self.label)
            .next()
            .map(element_text)
            .filter(|s| !s.is_empty());
        // A link inside the value wins over the value's own text.
        let value = row
            .select(&self.value)
            .next()
            .map(|v| match v.select(&self.link).next() {
                Some(link) => element_text(link),
                None => element_text(v),
            })
            .filter(|s| !s.is_empty());

        if label.is_none() && value.is_none() {
            return FieldGroup::from_parts(None, None, Some(element_text(row)));
        }
        FieldGroup::from_parts(label, value, None)
    }
}

pub fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {:?}: {:?}", css, e))
}

fn element_text(el: ElementRef) -> String {
    let text: String = el.text().collect();
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FieldExtractor {
        FieldExtractor::new(&Selectors::default()).unwrap()
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    #[test]
    fn three_rows_with_raw_fallback() {
        let html = r#"
            <section class="pod" data-name="details">
              <div class="detail-row">
                <span class="detail-label">Type</span><span class="detail-text">Whitepaper</span>
              </div>
              <div class="detail-row">
                <span class="detail-label">Region</span><span class="detail-text">EMEA</span>
              </div>
              <div class="detail-row"><p>Owner: Alice</p></div>
            </section>"#;
        let record = extractor().extract_html(html);
        assert_eq!(record.len(), 3);
        assert_eq!(record.groups[0].values, vec!["Type", "Whitepaper"]);
        assert_eq!(record.groups[1].values, vec!["Region", "EMEA"]);
        assert_eq!(record.groups[2].kind, FieldKind::Raw);
        assert_eq!(record.groups[2].values, vec!["Owner: Alice"]);
    }

    #[test]
    fn sidebar_fixture() {
        let record = extractor().extract_html(&fixture("details"));
        let rows: Vec<Vec<&str>> = record
            .groups
            .iter()
            .map(|g| g.values.iter().map(String::as_str).collect())
            .collect();
        assert_eq!(
            rows,
            vec![
                vec!["Content Type", "Customer Presentation"],
                vec!["Author", "Jane Doe"],
                vec!["Last Updated", "Mar 3, 2024"],
                vec!["Confidential"],
                vec!["Internal use only, do not share."],
            ]
        );
        assert_eq!(record.groups[1].kind, FieldKind::LabelValue);
        assert_eq!(record.groups[3].kind, FieldKind::Label);
        assert_eq!(record.groups[4].kind, FieldKind::Raw);
    }

    #[test]
    fn no_group_is_ever_empty() {
        let record = extractor().extract_html(&fixture("details"));
        assert!(record
            .groups
            .iter()
            .all(|g| g.values.iter().any(|v| !v.is_empty())));
    }

    #[test]
    fn missing_container_is_empty_record() {
        let record = extractor().extract_html(&fixture("no_details"));
        assert!(record.is_empty());
    }

    #[test]
    fn link_text_replaces_value_text() {
        let html = r#"
            <section class="pod" data-name="details">
              <div class="detail-row">
                <span class="detail-label">Source</span>
                <span class="detail-text">see <a href="/x">Partner   Portal</a> for details</span>
              </div>
            </section>"#;
        let record = extractor().extract_html(html);
        assert_eq!(record.groups[0].label(), Some("Source"));
        assert_eq!(record.groups[0].value(), Some("Partner Portal"));
    }

    #[test]
    fn invalid_selector_rejected() {
        let selectors = Selectors {
            row: "div[[".to_string(),
            ..Selectors::default()
        };
        assert!(FieldExtractor::new(&selectors).is_err());
    }

    #[test]
    fn from_parts_drops_blank_rows() {
        assert!(FieldGroup::from_parts(Some(String::new()), None, None).is_none());
        assert!(FieldGroup::from_parts(None, None, Some(String::new())).is_none());
        let g = FieldGroup::from_parts(None, Some("v".into()), None).unwrap();
        assert_eq!(g.kind, FieldKind::Value);
        assert_eq!(g.label(), None);
    }
}
