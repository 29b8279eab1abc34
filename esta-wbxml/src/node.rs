//! The logical tree the protocol handlers build and inspect.

/// One node of a parsed or to-be-encoded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Elem(Element),
    Text(String),
    Opaque(Vec<u8>),
}

/// An element, addressed by code page and tag name. Children preserve
/// document order, which the EAS dialect cares about (`MoreAvailable`
/// before `Commands`, the fixed `Body` child sequence, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub page: u8,
    pub tag: &'static str,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(page: u8, tag: &'static str) -> Self {
        Self {
            page,
            tag,
            children: Vec::new(),
        }
    }

    // ---- builders (consuming, for literal tree construction)

    pub fn node(mut self, child: Element) -> Self {
        self.children.push(Node::Elem(child));
        self
    }

    /// Child element on the same page carrying inline text.
    pub fn str(self, tag: &'static str, text: impl Into<String>) -> Self {
        let page = self.page;
        self.str_on(page, tag, text)
    }

    pub fn str_on(mut self, page: u8, tag: &'static str, text: impl Into<String>) -> Self {
        let mut child = Element::new(page, tag);
        child.children.push(Node::Text(text.into()));
        self.children.push(Node::Elem(child));
        self
    }

    /// Empty self-closing child on the same page (`<MoreAvailable/>`).
    pub fn empty(self, tag: &'static str) -> Self {
        let page = self.page;
        self.empty_on(page, tag)
    }

    pub fn empty_on(mut self, page: u8, tag: &'static str) -> Self {
        self.children.push(Node::Elem(Element::new(page, tag)));
        self
    }

    /// Child element carrying an OPAQUE blob (body `Data`, MIME payloads).
    pub fn opaque(self, tag: &'static str, bytes: Vec<u8>) -> Self {
        let page = self.page;
        self.opaque_on(page, tag, bytes)
    }

    pub fn opaque_on(mut self, page: u8, tag: &'static str, bytes: Vec<u8>) -> Self {
        let mut child = Element::new(page, tag);
        child.children.push(Node::Opaque(bytes));
        self.children.push(Node::Elem(child));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Elem(child));
    }

    // ---- accessors (for walking decoded requests)

    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Elem(e) if e.tag == tag => Some(e),
            _ => None,
        })
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |n| match n {
            Node::Elem(e) if e.tag == tag => Some(e),
            _ => None,
        })
    }

    /// First inline-text child, if any.
    pub fn text(&self) -> Option<&str> {
        self.children.iter().find_map(|n| match n {
            Node::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// OPAQUE payload, falling back to inline text bytes; clients are
    /// inconsistent about which encoding they use for blobs they send.
    pub fn opaque_bytes(&self) -> Option<&[u8]> {
        self.children.iter().find_map(|n| match n {
            Node::Opaque(b) => Some(b.as_slice()),
            Node::Text(s) => Some(s.as_bytes()),
            _ => None,
        })
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(|e| e.text())
    }

    pub fn has_child(&self, tag: &str) -> bool {
        self.child(tag).is_some()
    }

    /// Depth-first search for the first descendant with this tag.
    pub fn descendant(&self, tag: &str) -> Option<&Element> {
        for n in &self.children {
            if let Node::Elem(e) = n {
                if e.tag == tag {
                    return Some(e);
                }
                if let Some(found) = e.descendant(tag) {
                    return Some(found);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages;

    #[test]
    fn builders_and_accessors() {
        let el = Element::new(pages::AIRSYNC, "Collection")
            .str("SyncKey", "3")
            .empty("GetChanges")
            .node(Element::new(pages::AIRSYNCBASE, "BodyPreference").str("Type", "2"));

        assert_eq!(el.child_text("SyncKey"), Some("3"));
        assert!(el.has_child("GetChanges"));
        assert!(!el.has_child("WindowSize"));
        assert_eq!(
            el.descendant("Type").and_then(|e| e.text()),
            Some("2")
        );
        assert_eq!(el.children_named("SyncKey").count(), 1);
    }
}
