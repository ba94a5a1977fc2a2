//! Arena storage for the parsed MPD document.
//!
//! Elements are stored in a flat `Vec` and refer to each other by [`NodeId`], so the tree can be
//! patched in place while xlink elements are resolved and shared read-only afterwards.

use quick_xml::{events::Event, Reader};

use crate::error::{PlayerError, PlayerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    /// Local name, without namespace prefix.
    pub name: String,
    /// Attributes with their qualified names, e.g. `xlink:href`.
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct XmlArena {
    nodes: Vec<XmlElement>,
    root: Option<NodeId>,
}

impl XmlArena {
    pub fn parse(xml: &str) -> PlayerResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut arena = XmlArena::default();
        let mut stack: Vec<NodeId> = Vec::new();
        loop {
            let event = reader
                .read_event()
                .map_err(|e| PlayerError::MpdParsing(format!("{e} at {}", reader.buffer_position())))?;
            match event {
                Event::Start(start) => {
                    let id = arena.push_element(&start, stack.last().copied())?;
                    stack.push(id);
                }
                Event::Empty(start) => {
                    arena.push_element(&start, stack.last().copied())?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(text) => {
                    if let Some(&current) = stack.last() {
                        let text = text
                            .unescape()
                            .map_err(|e| PlayerError::MpdParsing(e.to_string()))?;
                        arena.nodes[current.index()].text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(&current) = stack.last() {
                        let data = data.into_inner();
                        arena.nodes[current.index()]
                            .text
                            .push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(PlayerError::MpdParsing("Unexpected end of document".to_string()));
        }
        if arena.root.is_none() {
            return Err(PlayerError::MpdParsing("Document has no root element".to_string()));
        }
        Ok(arena)
    }

    /// Parses a remote element entity, which may hold several top level elements.
    ///
    /// The elements become the children of a synthetic `XlinkFragment` root.
    pub fn parse_fragment(xml: &str) -> PlayerResult<Self> {
        let mut body = xml.trim_start_matches('\u{feff}').trim();
        if body.starts_with("<?xml") {
            body = body
                .find("?>")
                .map(|end| &body[end + 2..])
                .unwrap_or_default();
        }
        Self::parse(&format!("<XlinkFragment>{body}</XlinkFragment>"))
    }

    fn push_element(
        &mut self,
        start: &quick_xml::events::BytesStart<'_>,
        parent: Option<NodeId>,
    ) -> PlayerResult<NodeId> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| PlayerError::MpdParsing(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| PlayerError::MpdParsing(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(XmlElement {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            text: String::new(),
            children: Vec::new(),
            parent,
        });
        match parent {
            Some(parent) => self.nodes[parent.index()].children.push(id),
            None if self.root.is_none() => self.root = Some(id),
            None => {
                return Err(PlayerError::MpdParsing(
                    "Document has more than one root element".to_string(),
                ))
            }
        }
        Ok(id)
    }

    pub fn root(&self) -> Option<Element<'_>> {
        self.root.map(|id| self.element(id))
    }

    pub fn element(&self, id: NodeId) -> Element<'_> {
        Element { arena: self, id }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visits every element reachable from the root in document order.
    pub fn descendants(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id.index()].children.iter().rev());
        }
        out
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) {
        self.nodes[id.index()].attributes.retain(|(key, _)| key != name);
    }

    /// Unlinks an element from its parent. The storage stays allocated but unreachable.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.index()].parent.take() {
            self.nodes[parent.index()].children.retain(|child| *child != id);
        }
    }

    /// Replaces `target` with the top level elements of `fragment`, in place.
    ///
    /// Returns the ids of the inserted elements.
    pub fn replace_with_fragment(&mut self, target: NodeId, fragment: &XmlArena) -> Vec<NodeId> {
        let Some(parent) = self.nodes[target.index()].parent else {
            return Vec::new();
        };
        let Some(fragment_root) = fragment.root else {
            return Vec::new();
        };

        let inserted: Vec<NodeId> = fragment.nodes[fragment_root.index()]
            .children
            .iter()
            .map(|child| self.graft(fragment, *child, parent))
            .collect();

        let siblings = &mut self.nodes[parent.index()].children;
        // graft() appended the new elements, move them to where the target was.
        siblings.retain(|child| !inserted.contains(child));
        if let Some(position) = siblings.iter().position(|child| *child == target) {
            siblings.splice(position..=position, inserted.iter().copied());
        }
        self.nodes[target.index()].parent = None;
        inserted
    }

    fn graft(&mut self, source: &XmlArena, node: NodeId, parent: NodeId) -> NodeId {
        let element = &source.nodes[node.index()];
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(XmlElement {
            name: element.name.clone(),
            attributes: element.attributes.clone(),
            text: element.text.clone(),
            children: Vec::new(),
            parent: Some(parent),
        });
        self.nodes[parent.index()].children.push(id);
        for child in &element.children {
            self.graft(source, *child, id);
        }
        id
    }
}

/// Borrowed view of one element.
#[derive(Clone, Copy)]
pub struct Element<'a> {
    arena: &'a XmlArena,
    id: NodeId,
}

impl<'a> Element<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn node(&self) -> &'a XmlElement {
        &self.arena.nodes[self.id.index()]
    }

    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    pub fn text(&self) -> &'a str {
        self.node().text.trim()
    }

    pub fn parent(&self) -> Option<Element<'a>> {
        self.node().parent.map(|id| self.arena.element(id))
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.node()
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name)?.trim().parse().ok()
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name)?.trim().parse().ok()
    }

    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attr(name)?.trim().parse().ok()
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        match self.attr(name)?.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = Element<'a>> + 'a {
        let arena = self.arena;
        self.node().children.iter().map(move |id| arena.element(*id))
    }

    pub fn children_named(&self, name: &'a str) -> impl Iterator<Item = Element<'a>> + 'a {
        self.children().filter(move |child| child.name() == name)
    }

    pub fn child(&self, name: &str) -> Option<Element<'a>> {
        self.children().find(|child| child.name() == name)
    }
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let arena = XmlArena::parse(
            r#"<?xml version="1.0"?>
            <MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
              <BaseURL>http://cdn/a/</BaseURL>
              <Period id="p0"><AdaptationSet mimeType="video/mp4"/></Period>
            </MPD>"#,
        )
        .unwrap();
        let root = arena.root().unwrap();
        assert_eq!(root.name(), "MPD");
        assert_eq!(root.attr("type"), Some("static"));
        assert_eq!(root.child("BaseURL").unwrap().text(), "http://cdn/a/");
        let period = root.child("Period").unwrap();
        assert_eq!(period.parent().unwrap().id(), root.id());
        assert_eq!(period.children_named("AdaptationSet").count(), 1);
    }

    #[test]
    fn test_replace_with_fragment() {
        let mut arena = XmlArena::parse(
            r#"<MPD><Period id="a"/><Period xlink:href="http://x/p" id="remote"/><Period id="c"/></MPD>"#,
        )
        .unwrap();
        let target = arena.root().unwrap().children().nth(1).unwrap().id();
        let fragment =
            XmlArena::parse_fragment(r#"<?xml version="1.0"?><Period id="b1"/><Period id="b2"/>"#)
                .unwrap();
        let inserted = arena.replace_with_fragment(target, &fragment);
        assert_eq!(inserted.len(), 2);

        let ids: Vec<_> = arena
            .root()
            .unwrap()
            .children()
            .filter_map(|p| p.attr("id"))
            .collect();
        assert_eq!(ids, ["a", "b1", "b2", "c"]);
    }

    #[test]
    fn test_unbalanced_document_is_error() {
        assert!(XmlArena::parse("<MPD><Period></MPD>").is_err());
    }
}
