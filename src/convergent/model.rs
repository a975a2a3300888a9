//! Records stored in an annotation document

use crate::resolve::TriState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DocumentError;

pub type HighlightId = Uuid;
pub type TagId = Uuid;
pub type GroupId = Uuid;
pub type BlockId = Uuid;

/// A logical position in the document content.
///
/// Positions are relative to a block (paragraph) identifier rather than the
/// whole text, so inserting or deleting another paragraph never moves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub block: BlockId,
    pub offset: u32,
}

impl Anchor {
    pub fn new(block: BlockId, offset: u32) -> Self {
        Self { block, offset }
    }

    /// Anchor into the root block, used before the document has paragraphs
    pub fn root(offset: u32) -> Self {
        Self::new(Uuid::nil(), offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: HighlightId,
    pub start: Anchor,
    pub end: Anchor,
    pub tag: TagId,
}

impl Highlight {
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.start.block == self.end.block && self.start.offset > self.end.offset {
            return Err(DocumentError::Validation(format!(
                "highlight {} ends before it starts ({} > {})",
                self.id, self.start.offset, self.end.offset
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub group: Option<GroupId>,
    pub color: Option<String>,
    /// Drawn from the workspace tag counter at creation, never reassigned
    pub order: u64,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn validate(&self) -> Result<(), DocumentError> {
        validate_name("tag", &self.name)?;
        if let Some(color) = &self.color {
            validate_color(color)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGroup {
    pub id: GroupId,
    pub name: String,
    pub color: String,
    pub order: u64,
    pub created_at: DateTime<Utc>,
}

impl TagGroup {
    pub fn validate(&self) -> Result<(), DocumentError> {
        validate_name("tag group", &self.name)?;
        validate_color(&self.color)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParagraphKind {
    Body,
    Heading,
}

/// One block of document content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paragraph {
    pub id: BlockId,
    pub kind: ParagraphKind,
    pub text: String,
}

impl Paragraph {
    pub fn body(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ParagraphKind::Body,
            text: text.into(),
        }
    }

    pub fn heading(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ParagraphKind::Heading,
            text: text.into(),
        }
    }

    /// Explicit number written at the start of the text: `12.`, `12)` or `[12]`
    pub fn explicit_number(&self) -> Option<u32> {
        let text = self.text.trim_start();
        if let Some(rest) = text.strip_prefix('[') {
            let (digits, tail) = split_digits(rest);
            return if tail.starts_with(']') { digits } else { None };
        }
        let (digits, tail) = split_digits(text);
        if tail.starts_with('.') || tail.starts_with(')') {
            digits
        } else {
            None
        }
    }
}

fn split_digits(text: &str) -> (Option<u32>, &str) {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    (text[..end].parse().ok(), &text[end..])
}

/// Document-level fields resolved last-writer-wins
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarField {
    Title,
    Paragraphs,
    AutoNumberParagraphs,
    SharedWithClass,
    AnonymousSharing,
    CopyProtection,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Text(String),
    Paragraphs(Vec<Paragraph>),
    Flag(bool),
    Override(TriState),
}

impl ScalarField {
    /// Check that `value` has the shape this field stores
    pub fn validate(&self, value: &ScalarValue) -> Result<(), DocumentError> {
        match (self, value) {
            (ScalarField::Title, ScalarValue::Text(_)) => Ok(()),
            (ScalarField::AutoNumberParagraphs, ScalarValue::Flag(_)) => Ok(()),
            (
                ScalarField::SharedWithClass
                | ScalarField::AnonymousSharing
                | ScalarField::CopyProtection,
                ScalarValue::Override(_),
            ) => Ok(()),
            (ScalarField::Paragraphs, ScalarValue::Paragraphs(paragraphs)) => {
                let mut seen = std::collections::HashSet::new();
                for p in paragraphs {
                    if !seen.insert(p.id) {
                        return Err(DocumentError::Validation(format!(
                            "paragraph {} appears twice",
                            p.id
                        )));
                    }
                }
                Ok(())
            }
            (field, value) => Err(DocumentError::Validation(format!(
                "{:?} cannot hold {:?}",
                field, value
            ))),
        }
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), DocumentError> {
    if name.trim().is_empty() {
        return Err(DocumentError::Validation(format!("{} name is empty", kind)));
    }
    Ok(())
}

/// Accepts `#rgb` and `#rrggbb` hex colors
pub fn validate_color(color: &str) -> Result<(), DocumentError> {
    let invalid = || DocumentError::Validation(format!("invalid hex color {:?}", color));
    let digits = color.strip_prefix('#').ok_or_else(invalid)?;
    let expanded: String = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect(),
        6 => digits.to_string(),
        _ => return Err(invalid()),
    };
    hex::decode(expanded).map(|_| ()).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_validation() {
        assert!(validate_color("#1f77b4").is_ok());
        assert!(validate_color("#ABC").is_ok());

        assert!(validate_color("1f77b4").is_err());
        assert!(validate_color("#1f77b").is_err());
        assert!(validate_color("#zzzzzz").is_err());
        assert!(validate_color("").is_err());
    }

    #[test]
    fn test_inverted_highlight_rejected() {
        let block = Uuid::new_v4();
        let highlight = Highlight {
            id: Uuid::new_v4(),
            start: Anchor::new(block, 9),
            end: Anchor::new(block, 3),
            tag: Uuid::new_v4(),
        };
        assert!(highlight.validate().is_err());

        // Spanning two blocks is fine whatever the offsets
        let spanning = Highlight {
            end: Anchor::new(Uuid::new_v4(), 0),
            ..highlight
        };
        assert!(spanning.validate().is_ok());
    }

    #[test]
    fn test_explicit_paragraph_numbers() {
        assert_eq!(Paragraph::body("12. The facts").explicit_number(), Some(12));
        assert_eq!(Paragraph::body("[3] Held").explicit_number(), Some(3));
        assert_eq!(Paragraph::body("  7) indented").explicit_number(), Some(7));

        assert_eq!(Paragraph::body("1984 was a year").explicit_number(), None);
        assert_eq!(Paragraph::body("[4 unclosed").explicit_number(), None);
        assert_eq!(Paragraph::body("no number").explicit_number(), None);
    }

    #[test]
    fn test_scalar_shape_mismatch() {
        assert!(ScalarField::Title
            .validate(&ScalarValue::Text("Case notes".into()))
            .is_ok());
        assert!(ScalarField::Title.validate(&ScalarValue::Flag(true)).is_err());

        let p = Paragraph::body("dup");
        let dup = ScalarValue::Paragraphs(vec![p.clone(), p]);
        assert!(ScalarField::Paragraphs.validate(&dup).is_err());
    }
}
