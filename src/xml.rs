//! The two XML operations the core owns (spec.md §1): `parse_device_description`
//! (via the generic tree walker here, consumed by [`crate::device`]) and
//! `build_soap_envelope` (in [`crate::soap::envelope`]). Everything else that
//! needs to look inside an XML document — SCPD action lists, DIDL-Lite
//! items, GENA propertysets, SOAP faults — is built on the same small,
//! hand-rolled tree reader rather than pulling in a general derive-based
//! XML binding framework, which spec.md marks out of scope.

use crate::error::{Error, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// A minimal XML element tree. Namespace prefixes are kept as part of the
/// tag name (`"u:Browse"`) since UPnP documents use a handful of fixed
/// prefixes and the core never needs general namespace resolution.
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn find(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    pub fn find_all<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.local_name() == local_name)
    }

    pub fn child_text(&self, local_name: &str) -> Option<&str> {
        self.find(local_name).map(|c| c.text.as_str())
    }

    /// Text value, trimmed, defaulting to empty string.
    pub fn text_trimmed(&self) -> &str {
        self.text.trim()
    }
}

/// Parses `xml` into a tree rooted at its single top-level element.
pub fn parse_xml_tree(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for attr in e.attributes() {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr.unescape_value()?.into_owned();
                    attrs.push((key, value));
                }
                stack.push(XmlElement {
                    name,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                });
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut attrs = Vec::new();
                for attr in e.attributes() {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr.unescape_value()?.into_owned();
                    attrs.push((key, value));
                }
                let elem = XmlElement {
                    name,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                };
                push_completed(&mut stack, &mut root, elem);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(t.as_ref()));
                }
            }
            Event::End(_) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| Error::XmlDecode("unbalanced end tag".into()))?;
                push_completed(&mut stack, &mut root, elem);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or_else(|| Error::XmlDecode("empty document".into()))
}

fn push_completed(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, elem: XmlElement) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(elem);
    } else {
        *root = Some(elem);
    }
}

/// Escapes `&`, `<`, `>`, `"` for safe inclusion as XML text/attribute
/// content.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_tree() {
        let xml = r#"<root><a x="1"><b>hello</b><b>world</b></a></root>"#;
        let tree = parse_xml_tree(xml).unwrap();
        assert_eq!(tree.local_name(), "root");
        let a = tree.find("a").unwrap();
        assert_eq!(a.attr("x"), Some("1"));
        let bs: Vec<_> = a.find_all("b").collect();
        assert_eq!(bs.len(), 2);
        assert_eq!(bs[0].text_trimmed(), "hello");
        assert_eq!(bs[1].text_trimmed(), "world");
    }

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(xml_escape("<a & b>"), "&lt;a &amp; b&gt;");
    }
}
