//! Response documents
//! Parses an XML response into an owned tree that can be edited and written back

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::str;
use thiserror::Error;

/// Document errors
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("document is not valid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),

    #[error("document has no root element")]
    MissingRoot,
}

/// A node in the document tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element with ordered attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, keeping its position if it already exists
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// First child element with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// Child elements, skipping text
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn push(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    /// Concatenated text content of direct text children
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Replace all children with a single text node
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }

    /// Depth-first search for the first descendant element with the given name
    pub fn find(&self, name: &str) -> Option<&Element> {
        for e in self.elements() {
            if e.name == name {
                return Some(e);
            }
            if let Some(found) = e.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), DocumentError> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        for child in &self.children {
            match child {
                Node::Element(e) => e.write(writer)?,
                Node::Text(t) => {
                    writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(t))))?
                }
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

/// A parsed XML document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub root: Element,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    /// Parse a UTF-8 XML document. Comments and processing instructions are dropped.
    pub fn parse(bytes: &[u8]) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(str::from_utf8(bytes)?);

        // elements still open; the bottom one becomes the root
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(Self::element_from(&e)?),
                Event::Empty(e) => {
                    let element = Self::element_from(&e)?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    if let Some(element) = stack.pop() {
                        Self::attach(&mut stack, &mut root, element);
                    }
                }
                Event::Text(t) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(t.unescape()?.into_owned()));
                    }
                }
                Event::CData(c) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(str::from_utf8(&c)?.to_string()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        root.map(Self::new).ok_or(DocumentError::MissingRoot)
    }

    fn element_from(start: &BytesStart<'_>) -> Result<Element, DocumentError> {
        let mut element = Element::new(str::from_utf8(start.name().as_ref())?);
        for attr in start.attributes() {
            let attr = attr?;
            let key = str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr.unescape_value()?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
        match stack.last_mut() {
            Some(parent) => parent.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    /// Serialize with a UTF-8 XML declaration
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.root.write(&mut writer)?;
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><response><total_count>1</total_count><items><item action="UPLOAD" is_incremental="false" key="NONE" priority="1600" sequence="0" type="SNAP" url="https://a.example/x?a=1&amp;b=2"/></items></response>"#;

    #[test]
    fn test_parse_and_write_back() {
        let doc = Document::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(doc.root.name, "response");

        let item = doc.root.child("items").unwrap().child("item").unwrap();
        assert_eq!(item.attr("url"), Some("https://a.example/x?a=1&b=2"));
        assert_eq!(item.attributes[0].0, "action");

        assert_eq!(String::from_utf8(doc.to_bytes().unwrap()).unwrap(), SAMPLE);
    }

    #[test]
    fn test_edit_tree() {
        let mut doc = Document::parse(SAMPLE.as_bytes()).unwrap();
        doc.root.child_mut("total_count").unwrap().set_text("2");

        let items = doc.root.child_mut("items").unwrap();
        let mut item = Element::new("item").with_attr("action", "SET").with_attr("type", "SCFG");
        item.set_text("a=1\nb=<2>");
        items.push(item);

        let out = String::from_utf8(doc.to_bytes().unwrap()).unwrap();
        assert!(out.contains("<total_count>2</total_count>"));
        assert!(out.contains(r#"<item action="SET" type="SCFG">a=1
b=&lt;2&gt;</item></items>"#));

        let reparsed = Document::parse(out.as_bytes()).unwrap();
        assert_eq!(reparsed.root.child("items").unwrap().elements().count(), 2);
    }

    #[test]
    fn test_set_attr_keeps_position() {
        let mut e = Element::new("item").with_attr("a", "1").with_attr("b", "2");
        e.set_attr("a", "3");
        assert_eq!(e.attributes, vec![("a".into(), "3".into()), ("b".into(), "2".into())]);
    }

    #[test]
    fn test_find_nested_element() {
        let doc = Document::parse(b"<snapshot><device><serial>B0123</serial></device></snapshot>").unwrap();
        assert_eq!(doc.root.find("serial").map(|e| e.text()), Some("B0123".to_string()));
        assert!(doc.root.find("missing").is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Document::parse(b"").is_err());
        assert!(Document::parse(b"<a><b></a>").is_err());
        assert!(Document::parse(&[0xff, 0xfe]).is_err());
    }
}
