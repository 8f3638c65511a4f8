//! `%{name}` macro expansion for template-derived text.

use crate::node::NodeContextView;

/// Expand `%{node_id}`, `%{node_name}` and `%{node_primary_ip}` in `text`.
///
/// Unknown macros expand to nothing. Without a node every macro expands to
/// `(error)`. An unterminated `%{` is copied as is.
pub fn expand_macros(text: &str, node: Option<&dyn NodeContextView>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        match node {
            Some(node) => match name {
                "node_id" => out.push_str(&node.node_id().to_string()),
                "node_name" => out.push_str(node.name()),
                "node_primary_ip" => {
                    if let Some(ip) = node.primary_ip() {
                        out.push_str(&ip.to_string());
                    }
                }
                other => tracing::warn!("Unknown macro '{}' in '{}'", other, text),
            },
            None => out.push_str("(error)"),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
