//! Exclusive XML Canonicalization 1.0, with and without comments.
//!
//! Only element subtrees are canonicalized (the apex is the signed element
//! or `SignedInfo`). Namespace declarations are emitted where they are
//! visibly utilized and not already rendered by an output ancestor, plus any
//! prefix named in the `InclusiveNamespaces` PrefixList.

use std::collections::BTreeMap;

use roxmltree::{Node, NodeId, NodeType};

use super::{attribute_prefix, element_prefix, prefix_for};
use crate::saml::constants::NS_XML;

#[derive(Debug, Clone, Default)]
pub struct C14nOptions {
    /// Keep comment nodes (`#WithComments`).
    pub with_comments: bool,
    /// Prefixes treated as inclusive; `#default` names the default namespace.
    pub inclusive_prefixes: Vec<String>,
    /// Subtree omitted from the output (enveloped signature).
    pub exclude: Option<NodeId>,
}

/// Canonicalize the subtree rooted at `node`.
pub fn canonicalize(node: Node<'_, '_>, opts: &C14nOptions) -> String {
    let mut out = String::new();
    write_element(node, opts, &BTreeMap::new(), &mut out);
    out
}

fn write_element(
    node: Node<'_, '_>,
    opts: &C14nOptions,
    parent_rendered: &BTreeMap<String, String>,
    out: &mut String,
) {
    let prefix = element_prefix(node).unwrap_or("");
    let local = node.tag_name().name();
    let qname = if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{}:{}", prefix, local)
    };

    // Visibly utilized namespaces, keyed by prefix ("" = default)
    let mut utilized: BTreeMap<String, String> = BTreeMap::new();
    utilized.insert(
        prefix.to_string(),
        node.tag_name().namespace().unwrap_or("").to_string(),
    );
    for attr in node.attributes() {
        if let Some(ns) = attr.namespace()
            && ns != NS_XML
            && let Some(p) = attribute_prefix(node, &attr).or_else(|| prefix_for(node, ns))
        {
            utilized.insert(p.to_string(), ns.to_string());
        }
    }
    for p in &opts.inclusive_prefixes {
        let key = if p == "#default" { "" } else { p.as_str() };
        let lookup = if key.is_empty() { None } else { Some(key) };
        if let Some(uri) = node.lookup_namespace_uri(lookup) {
            utilized
                .entry(key.to_string())
                .or_insert_with(|| uri.to_string());
        }
    }

    let mut rendered = parent_rendered.clone();
    out.push('<');
    out.push_str(&qname);

    for (p, uri) in &utilized {
        let current = rendered.get(p).map(String::as_str);
        let already = if p.is_empty() {
            current.unwrap_or("") == uri
        } else {
            current == Some(uri.as_str())
        };
        if already {
            continue;
        }
        out.push_str(" xmlns");
        if !p.is_empty() {
            out.push(':');
            out.push_str(p);
        }
        out.push_str("=\"");
        escape_attr_value(uri, out);
        out.push('"');
        rendered.insert(p.clone(), uri.clone());
    }

    let mut attrs: Vec<(&str, &str, String, &str)> = node
        .attributes()
        .map(|attr| {
            let ns = attr.namespace().unwrap_or("");
            let prefix = attr
                .namespace()
                .and_then(|uri| attribute_prefix(node, &attr).or_else(|| prefix_for(node, uri)));
            let name = match prefix {
                Some(p) => format!("{}:{}", p, attr.name()),
                None => attr.name().to_string(),
            };
            (ns, attr.name(), name, attr.value())
        })
        .collect();
    attrs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    for (_, _, name, value) in &attrs {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_attr_value(value, out);
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        if Some(child.id()) == opts.exclude {
            continue;
        }
        match child.node_type() {
            NodeType::Element => write_element(child, opts, &rendered, out),
            NodeType::Text => escape_text_value(child.text().unwrap_or(""), out),
            NodeType::Comment => {
                if opts.with_comments {
                    out.push_str("<!--");
                    out.push_str(child.text().unwrap_or(""));
                    out.push_str("-->");
                }
            }
            NodeType::PI => {
                if let Some(pi) = child.pi() {
                    out.push_str("<?");
                    out.push_str(pi.target);
                    if let Some(value) = pi.value
                        && !value.is_empty()
                    {
                        out.push(' ');
                        out.push_str(value);
                    }
                    out.push_str("?>");
                }
            }
            NodeType::Root => {}
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}

fn escape_attr_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_text_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::xml::parse;

    fn c14n_first_child(xml: &str, opts: &C14nOptions) -> String {
        let doc = parse(xml).unwrap();
        let child = doc.root_element().first_element_child().unwrap();
        canonicalize(child, opts)
    }

    #[test]
    fn test_pushes_down_used_namespaces_and_sorts_attributes() {
        let xml = r#"<root xmlns:a="urn:a" xmlns:b="urn:b" xmlns:c="urn:c"><a:child z="2" b:attr="1" y="3">text &amp; more</a:child></root>"#;
        assert_eq!(
            c14n_first_child(xml, &C14nOptions::default()),
            r#"<a:child xmlns:a="urn:a" xmlns:b="urn:b" y="3" z="2" b:attr="1">text &amp; more</a:child>"#
        );
    }

    #[test]
    fn test_empty_element_and_unused_namespace() {
        let xml = r#"<x:root xmlns:x="urn:x" xmlns:unused="urn:u"><x:c/></x:root>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(
            canonicalize(doc.root_element(), &C14nOptions::default()),
            r#"<x:root xmlns:x="urn:x"><x:c></x:c></x:root>"#
        );
    }

    #[test]
    fn test_default_namespace_inherited_and_undeclared() {
        let xml = r#"<root xmlns="urn:d"><inner xmlns=""><leaf/></inner><child/></root>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(
            canonicalize(doc.root_element(), &C14nOptions::default()),
            r#"<root xmlns="urn:d"><inner xmlns=""><leaf></leaf></inner><child></child></root>"#
        );
        assert_eq!(
            c14n_first_child(r#"<root xmlns="urn:d"><child/></root>"#, &C14nOptions::default()),
            r#"<child xmlns="urn:d"></child>"#
        );
    }

    #[test]
    fn test_comments_depend_on_algorithm() {
        let xml = r#"<r><v>a<!--x-->b</v></r>"#;
        assert_eq!(
            c14n_first_child(xml, &C14nOptions::default()),
            "<v>ab</v>"
        );
        let with = C14nOptions {
            with_comments: true,
            ..Default::default()
        };
        assert_eq!(c14n_first_child(xml, &with), "<v>a<!--x-->b</v>");
    }

    #[test]
    fn test_escaping() {
        let xml = "<r><e a=\"x&quot;&lt;&gt;&#x9;\">1 &gt; 0 &lt; 2&#xD;</e></r>";
        assert_eq!(
            c14n_first_child(xml, &C14nOptions::default()),
            "<e a=\"x&quot;&lt;>&#x9;\">1 &gt; 0 &lt; 2&#xD;</e>"
        );
    }

    #[test]
    fn test_excluded_subtree_is_omitted() {
        let xml = r#"<r><s:a xmlns:s="urn:s"><s:keep/><s:drop>gone</s:drop></s:a></r>"#;
        let doc = parse(xml).unwrap();
        let a = doc.root_element().first_element_child().unwrap();
        let drop = a.last_element_child().unwrap();
        let opts = C14nOptions {
            exclude: Some(drop.id()),
            ..Default::default()
        };
        assert_eq!(
            canonicalize(a, &opts),
            r#"<s:a xmlns:s="urn:s"><s:keep></s:keep></s:a>"#
        );
    }

    #[test]
    fn test_inclusive_prefix_list() {
        let xml = r#"<root xmlns:xs="urn:xs" xmlns:a="urn:a"><a:v/></root>"#;
        let opts = C14nOptions {
            inclusive_prefixes: vec!["xs".to_string()],
            ..Default::default()
        };
        assert_eq!(
            c14n_first_child(xml, &opts),
            r#"<a:v xmlns:a="urn:a" xmlns:xs="urn:xs"></a:v>"#
        );
    }

    #[test]
    fn test_attribute_keeps_its_source_prefix() {
        let xml = r#"<root xmlns:a="urn:same" xmlns:b="urn:same"><e b:attr="1"/></root>"#;
        assert_eq!(
            c14n_first_child(xml, &C14nOptions::default()),
            r#"<e xmlns:b="urn:same" b:attr="1"></e>"#
        );
    }

    #[test]
    fn test_xml_prefix_attribute_never_declared() {
        let xml = r#"<r><e xml:lang="en"/></r>"#;
        assert_eq!(
            c14n_first_child(xml, &C14nOptions::default()),
            r#"<e xml:lang="en"></e>"#
        );
    }
}
