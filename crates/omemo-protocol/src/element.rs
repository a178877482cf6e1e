//! A small structured-element tree for wire payloads.
//!
//! Accessors that read required fields return `ProtocolError::Malformed`, so
//! every parser built on them fails closed.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Text child holding `bytes` as standard base64.
    pub fn base64(self, bytes: &[u8]) -> Self {
        self.text(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Name and namespace both match.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn required_attr(&self, key: &str) -> Result<&str, ProtocolError> {
        self.get_attr(key).ok_or_else(|| {
            ProtocolError::Malformed(format!("<{}> missing attribute '{key}'", self.name))
        })
    }

    /// Parse a required attribute.
    pub fn parse_attr<T: FromStr>(&self, key: &str) -> Result<T, ProtocolError> {
        self.required_attr(key)?.parse().map_err(|_| {
            ProtocolError::Malformed(format!("<{}> attribute '{key}' is invalid", self.name))
        })
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn required(&self, name: &str) -> Result<&Element, ProtocolError> {
        self.find(name).ok_or_else(|| {
            ProtocolError::Malformed(format!("<{}> missing child <{name}>", self.name))
        })
    }

    /// Decode the element's text as base64. Empty or absent text is an error.
    pub fn base64_text(&self) -> Result<Vec<u8>, ProtocolError> {
        let text = self
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProtocolError::Malformed(format!("<{}> has no content", self.name)))?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| ProtocolError::Malformed(format!("<{}> is not base64: {e}", self.name)))
    }
}
