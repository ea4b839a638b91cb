//! Stored payload of one object version.
//!
//! The template schema language validating these documents is an external
//! collaborator; the core only needs the shape: named properties plus a list
//! of template-driven elements, some of which carry binary file keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content of one object version as persisted in the objects bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDocument {
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub elements: Vec<Element>,
}

/// One template-driven element of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub template_code: String,
    pub content: ElementContent,
}

/// Element payload, discriminated by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementContent {
    Text { value: String },
    Binary { file_key: String },
}

impl ObjectDocument {
    /// `(template_code, file_key)` for every binary-valued element.
    pub fn binary_references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.elements.iter().filter_map(|element| {
            match &element.content {
                ElementContent::Binary { file_key } => {
                    Some((element.template_code.as_str(), file_key.as_str()))
                }
                ElementContent::Text { .. } => None,
            }
        })
    }
}
