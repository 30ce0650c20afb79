//! Typed accessors over raw KDL nodes.

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

/// First positional string argument.
pub(crate) fn first_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Integer property, range-checked into the target type.
pub(crate) fn int_prop<T>(node: &KdlNode, name: &str) -> ConfigResult<Option<T>>
where
    T: TryFrom<i128>,
{
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let field = format!("{}.{}", node.name().value(), name);
    let raw = value
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(&field, "expected an integer"))?;
    T::try_from(raw)
        .map(Some)
        .map_err(|_| ConfigError::invalid(&field, format!("{} is out of range", raw)))
}

/// Children named `name`, in document order.
pub(crate) fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> Vec<&'a KdlNode> {
    node.children()
        .map(|doc| {
            doc.nodes()
                .iter()
                .filter(|child| child.name().value() == name)
                .collect()
        })
        .unwrap_or_default()
}
