//! Structural XML comparison built on a normalized event stream: documents
//! are equal when they produce the same elements, attributes (order
//! independent) and trimmed text, regardless of formatting.

use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum XmlNode {
    Start {
        name: String,
        attributes: Vec<(String, String)>,
    },
    End(String),
    Text(String),
}

/// Parses a document into its normalized node sequence. Comments, the XML
/// declaration and processing instructions are ignored; empty elements
/// expand to a start/end pair.
pub(crate) fn normalize(xml: &str) -> Result<Vec<XmlNode>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut nodes = Vec::new();
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(start) => nodes.push(start_node(&start)?),
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                nodes.push(start_node(&start)?);
                nodes.push(XmlNode::End(name));
            }
            Event::End(end) => {
                nodes.push(XmlNode::End(
                    String::from_utf8_lossy(end.name().as_ref()).to_string(),
                ));
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| e.to_string())?;
                if !text.trim().is_empty() {
                    nodes.push(XmlNode::Text(text.trim().to_string()));
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).to_string();
                if !text.is_empty() {
                    nodes.push(XmlNode::Text(text));
                }
            }
            Event::Eof => break,
            // declaration, comments, processing instructions, doctype
            _ => {}
        }
    }

    if nodes.is_empty() {
        return Err("document contains no XML content".to_string());
    }

    Ok(nodes)
}

fn start_node(start: &quick_xml::events::BytesStart) -> Result<XmlNode, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();

    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| e.to_string())?
            .to_string();
        attributes.push((key, value));
    }
    attributes.sort();

    Ok(XmlNode::Start { name, attributes })
}

/// Compares two normalized node sequences and returns
/// `(mismatched, total)` where `total` is the longer sequence length.
pub(crate) fn compare(expected: &[XmlNode], actual: &[XmlNode]) -> (usize, usize) {
    let total = expected.len().max(actual.len());

    let mismatched = (0..total)
        .filter(|&i| expected.get(i) != actual.get(i))
        .count();

    (mismatched, total)
}
