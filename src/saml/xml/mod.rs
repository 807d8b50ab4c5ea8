//! DOM helpers over `roxmltree`.
//!
//! SAML values are always read through [`text_content`], which concatenates
//! every descendant text node. Reading only the first text node lets an
//! attacker split a signed value with a comment and have the two halves
//! interpreted differently by the verifier and the consumer.

mod c14n;

use roxmltree::{Attribute, Document, Node, NodeType};

pub use c14n::{C14nOptions, canonicalize};

use super::{constants::NS_XML, error::SamlError};

/// Parse an XML document. DTDs are refused.
pub fn parse(xml: &str) -> Result<Document<'_>, SamlError> {
    Document::parse(xml).map_err(|e| SamlError::Decode(format!("invalid XML: {}", e)))
}

pub fn is_element(node: Node<'_, '_>, ns: &str, local: &str) -> bool {
    node.is_element() && node.tag_name().name() == local && node.tag_name().namespace() == Some(ns)
}

/// First element child with the given expanded name.
pub fn child_element<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    local: &str,
) -> Option<Node<'a, 'input>> {
    node.children().find(|c| is_element(*c, ns, local))
}

/// All element children with the given expanded name, in document order.
pub fn child_elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    ns: &'a str,
    local: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |c| is_element(*c, ns, local))
}

/// First descendant element (excluding `node` itself) with the given name.
pub fn descendant_element<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    local: &str,
) -> Option<Node<'a, 'input>> {
    node.descendants()
        .skip(1)
        .find(|c| is_element(*c, ns, local))
}

/// Concatenation of all descendant text nodes.
pub fn text_content(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

/// Text content with surrounding whitespace removed.
pub fn trimmed_text(node: Node<'_, '_>) -> String {
    text_content(node).trim().to_string()
}

/// Text content with every whitespace character removed (base64 payloads).
pub fn compact_text(node: Node<'_, '_>) -> String {
    text_content(node)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Every element in the document whose `ID` attribute equals `id`.
pub fn elements_with_id<'a, 'input>(doc: &'a Document<'input>, id: &str) -> Vec<Node<'a, 'input>> {
    doc.descendants()
        .filter(|n| n.is_element() && n.attribute("ID") == Some(id))
        .collect()
}

/// Prefix of an element's qualified name as written in the source.
pub fn element_prefix<'a, 'input>(node: Node<'a, 'input>) -> Option<&'input str> {
    let input = node.document().input_text();
    let rest = input.get(node.range().start + 1..)?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    rest[..end].split_once(':').map(|(prefix, _)| prefix)
}

/// Prefix of `attr` as written in the source, which is the one to keep when
/// several prefixes are bound to its namespace.
pub fn attribute_prefix<'a, 'input>(
    node: Node<'a, 'input>,
    attr: &Attribute<'a, 'input>,
) -> Option<&'input str> {
    let input = node.document().input_text();
    input
        .get(attr.range_qname())?
        .split_once(':')
        .map(|(prefix, _)| prefix)
}

/// A prefix bound to `uri` in the scope of `node`.
pub fn prefix_for<'a, 'input>(node: Node<'a, 'input>, uri: &str) -> Option<&'input str> {
    if uri == NS_XML {
        return Some("xml");
    }
    node.namespaces()
        .find(|ns| ns.name().is_some() && ns.uri() == uri)
        .and_then(|ns| ns.name())
}

/// Find an element in the subtree that mixes a comment with non-blank text.
///
/// Returns the local name of the first offending element and skips
/// `exclude` (the signature being checked).
pub fn find_comment_in_text<'a, 'input>(
    node: Node<'a, 'input>,
    exclude: Option<roxmltree::NodeId>,
) -> Option<&'a str> {
    for element in node.descendants().filter(|n| n.is_element()) {
        if exclude.is_some_and(|id| element.ancestors().any(|a| a.id() == id)) {
            continue;
        }
        let has_comment = element.children().any(|c| c.node_type() == NodeType::Comment);
        let has_text = element
            .children()
            .any(|c| c.is_text() && c.text().is_some_and(|t| !t.trim().is_empty()));
        if has_comment && has_text {
            return Some(element.tag_name().name());
        }
    }
    None
}

/// Re-parent an XML fragment under a synthetic element that declares every
/// namespace in scope at `context`, so prefixes bound by ancestors of the
/// original location still resolve.
pub fn wrap_in_scope(context: Node<'_, '_>, fragment: &str) -> String {
    let mut decls = String::new();
    for ns in context.namespaces() {
        match ns.name() {
            Some("xml") => {}
            Some(prefix) => {
                decls.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape_attr(ns.uri())));
            }
            None => decls.push_str(&format!(" xmlns=\"{}\"", escape_attr(ns.uri()))),
        }
    }
    // Strip a leading XML declaration if the plaintext carries one
    let body = match fragment.trim_start().strip_prefix("<?xml") {
        Some(rest) => rest.split_once("?>").map(|(_, b)| b).unwrap_or(rest),
        None => fragment,
    };
    format!("<ScopeWrapper{}>{}</ScopeWrapper>", decls, body)
}

/// Escape a value for use inside a double-quoted attribute.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape character data.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_concatenates_around_comments() {
        let xml = r#"<a><b>bburke@redhat.com<!--comment-->.additional.domain</b></a>"#;
        let doc = parse(xml).unwrap();
        let b = doc.root_element().first_element_child().unwrap();
        assert_eq!(text_content(b), "bburke@redhat.com.additional.domain");
        assert_eq!(find_comment_in_text(doc.root_element(), None), Some("b"));
    }

    #[test]
    fn test_comment_between_elements_is_not_in_text() {
        let xml = "<a>\n  <!-- note -->\n  <b>x</b>\n</a>";
        let doc = parse(xml).unwrap();
        assert_eq!(find_comment_in_text(doc.root_element(), None), None);
    }

    #[test]
    fn test_element_prefix_from_source() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:p" xmlns="urn:d"><Inner/></samlp:Response>"#;
        let doc = parse(xml).unwrap();
        let root = doc.root_element();
        assert_eq!(element_prefix(root), Some("samlp"));
        assert_eq!(element_prefix(root.first_element_child().unwrap()), None);

        let doc = parse(r#"<r xmlns:a="urn:same" xmlns:b="urn:same" b:x="1" y="2"/>"#).unwrap();
        let root = doc.root_element();
        let prefixes: Vec<_> = root
            .attributes()
            .map(|attr| attribute_prefix(root, &attr))
            .collect();
        assert_eq!(prefixes, vec![Some("b"), None]);
    }

    #[test]
    fn test_elements_with_id_finds_duplicates() {
        let xml = r#"<r><a ID="x"/><b><c ID="x"/></b><d ID="y"/></r>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(elements_with_id(&doc, "x").len(), 2);
        assert_eq!(elements_with_id(&doc, "y").len(), 1);
    }

    #[test]
    fn test_dtd_is_rejected() {
        let xml = r#"<!DOCTYPE r [<!ENTITY x "boom">]><r>&x;</r>"#;
        assert!(matches!(parse(xml), Err(SamlError::Decode(_))));
    }

    #[test]
    fn test_wrap_in_scope_keeps_ancestor_prefixes() {
        let xml = r#"<p:outer xmlns:p="urn:p" xmlns:q="urn:q"><p:inner/></p:outer>"#;
        let doc = parse(xml).unwrap();
        let inner = doc.root_element().first_element_child().unwrap();
        let wrapped = wrap_in_scope(inner, r#"<?xml version="1.0"?><q:frag>v</q:frag>"#);
        let reparsed = parse(&wrapped).unwrap();
        let frag = reparsed.root_element().first_element_child().unwrap();
        assert!(is_element(frag, "urn:q", "frag"));
        assert_eq!(text_content(frag), "v");
    }

    #[test]
    fn test_escape_attr() {
        assert_eq!(escape_attr(r#"a<b>&"c""#), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
