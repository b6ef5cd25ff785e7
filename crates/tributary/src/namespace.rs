//! Maps declared stream identities to the destination's internal ones.

use serde::{Deserialize, Serialize};
use tributary_types::StreamDescriptor;

/// Placeholder replaced by the source namespace in a custom format.
pub const SOURCE_NAMESPACE_PLACEHOLDER: &str = "${SOURCE_NAMESPACE}";

/// Where destination namespaces come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NamespaceDefinition {
    /// Keep the namespace the source declared.
    #[default]
    Source,
    /// Always use the destination's default namespace.
    Destination { default_namespace: Option<String> },
    /// Render a format string, substituting the source namespace.
    CustomFormat { format: String },
}

/// Resolves a declared [`StreamDescriptor`] to the internal one used as the
/// key in every store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMapper {
    pub definition: NamespaceDefinition,
    /// Prepended to every stream name.
    pub stream_prefix: Option<String>,
}

impl NamespaceMapper {
    /// Mapper that returns descriptors unchanged.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new(definition: NamespaceDefinition, stream_prefix: Option<String>) -> Self {
        Self {
            definition,
            stream_prefix,
        }
    }

    pub fn map(&self, declared: &StreamDescriptor) -> StreamDescriptor {
        let namespace = match &self.definition {
            NamespaceDefinition::Source => declared.namespace().map(str::to_owned),
            NamespaceDefinition::Destination { default_namespace } => default_namespace.clone(),
            NamespaceDefinition::CustomFormat { format } => {
                let source = declared.namespace().unwrap_or("");
                let rendered = format.replace(SOURCE_NAMESPACE_PLACEHOLDER, source);
                // An empty rendering falls back to the source namespace
                if rendered.is_empty() {
                    declared.namespace().map(str::to_owned)
                } else {
                    Some(rendered)
                }
            }
        };
        let name = match &self.stream_prefix {
            Some(prefix) => format!("{prefix}{}", declared.name()),
            None => declared.name().to_owned(),
        };
        StreamDescriptor::new(namespace, name)
    }
}
