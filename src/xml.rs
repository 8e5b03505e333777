//! Minimal XML-to-JSON tree decoding for OData/Atom payloads.
//!
//! Attributes are merged into the element object, single children stay
//! scalar, repeated children become arrays, and text next to attributes or
//! children lands under `_`. Element names keep their namespace prefix.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use thiserror::Error;

pub const TEXT_KEY: &str = "_";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("invalid XML: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("XML document has no root element")]
    Empty,
    #[error("XML element <{0}> is never closed")]
    Unclosed(String),
}

struct Node {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut fields = Map::new();

        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            insert_merged(&mut fields, key, Value::String(value));
        }

        Ok(Self {
            name,
            fields,
            text: String::new(),
        })
    }

    fn into_value(self) -> (String, Value) {
        if self.fields.is_empty() {
            return (self.name, Value::String(self.text));
        }

        let mut fields = self.fields;
        if !self.text.is_empty() {
            fields.insert(TEXT_KEY.to_string(), Value::String(self.text));
        }
        (self.name, Value::Object(fields))
    }
}

/// Parse `xml` into `{ <root name>: <root value> }`.
pub fn parse(xml: &str) -> Result<Value, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Node::open(&start)?),
            Event::Empty(start) => {
                let node = Node::open(&start)?;
                attach(node, &mut stack, &mut root);
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    attach(node, &mut stack, &mut root);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(XmlError::Unclosed(open.name));
    }

    let (name, value) = root.ok_or(XmlError::Empty)?;
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}

fn attach(node: Node, stack: &mut [Node], root: &mut Option<(String, Value)>) {
    let (name, value) = node.into_value();
    match stack.last_mut() {
        Some(parent) => insert_merged(&mut parent.fields, name, value),
        None => {
            if root.is_none() {
                *root = Some((name, value));
            }
        }
    }
}

fn insert_merged(fields: &mut Map<String, Value>, key: String, value: Value) {
    match fields.get_mut(&key) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(key, value);
        }
    }
}

/// Local part of a possibly prefixed element name.
pub fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

/// First child of `value` whose local name is `local`.
pub fn child<'a>(value: &'a Value, local: &str) -> Option<&'a Value> {
    value
        .as_object()?
        .iter()
        .find(|(key, _)| local_name(key) == local)
        .map(|(_, child)| child)
}

/// Walk a chain of local names.
pub fn path<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(value, |current, segment| child(current, segment))
}

/// Text content of an element, whether it decoded to a plain string or an
/// object carrying attributes.
pub fn text(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) => Some(text.as_str()),
        Value::Object(fields) => fields.get(TEXT_KEY).and_then(Value::as_str),
        Value::Array(items) => items.first().and_then(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_nested_elements_with_prefixes() {
        let tree = parse(
            r#"<?xml version="1.0" encoding="utf-8"?>
            <entry xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices">
              <content type="application/xml">
                <m:properties>
                  <d:Success>true</d:Success>
                  <d:MatDoc>4900012345</d:MatDoc>
                </m:properties>
              </content>
            </entry>"#,
        )
        .unwrap();

        let properties = path(&tree, &["entry", "content", "properties"]).unwrap();
        assert_eq!(child(properties, "Success").and_then(text), Some("true"));
        assert_eq!(child(properties, "MatDoc").and_then(text), Some("4900012345"));

        let content = path(&tree, &["entry", "content"]).unwrap();
        assert_eq!(content["type"], json!("application/xml"));
    }

    #[test]
    fn text_next_to_attributes_goes_under_underscore() {
        let tree = parse(r#"<error><message xml:lang="en">Batch locked</message></error>"#).unwrap();

        let message = path(&tree, &["error", "message"]).unwrap();
        assert_eq!(message["xml:lang"], json!("en"));
        assert_eq!(text(message), Some("Batch locked"));
    }

    #[test]
    fn repeated_children_become_arrays() {
        let tree = parse("<feed><entry>a</entry><entry>b</entry><id>x</id></feed>").unwrap();

        assert_eq!(tree["feed"]["entry"], json!(["a", "b"]));
        assert_eq!(tree["feed"]["id"], json!("x"));
    }

    #[test]
    fn empty_elements_decode_to_empty_strings() {
        let tree = parse("<properties><d:MatDoc/></properties>").unwrap();
        assert_eq!(tree["properties"]["d:MatDoc"], json!(""));
    }

    #[test]
    fn unescapes_entities() {
        let tree = parse("<m>A &amp; B</m>").unwrap();
        assert_eq!(tree["m"], json!("A & B"));
    }

    #[test]
    fn rejects_unbalanced_documents() {
        assert!(parse("<a><b></a>").is_err());
        assert!(parse("<a><b>").is_err());
        assert!(matches!(parse(""), Err(XmlError::Empty)));
    }

    #[test]
    fn local_name_strips_prefix() {
        assert_eq!(local_name("m:properties"), "properties");
        assert_eq!(local_name("properties"), "properties");
    }
}
