//! Merged tool catalogue
//!
//! Built-in core tools plus the contributions of every running provider.
//! Core names shadow provider tools; conflicts between providers resolve
//! first-registration-wins, with the loser logged.

use parking_lot::RwLock;

use crate::protocol::{ToolDef, WireTool};

/// Who resolves a tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOrigin {
    /// Built-in, in-process implementation
    Core,
    /// Named provider subprocess
    Provider(String),
}

impl std::fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Provider(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Default)]
struct Inner {
    core: Vec<ToolDef>,
    // Registration order is the tie-break order.
    providers: Vec<(String, Vec<ToolDef>)>,
}

impl Inner {
    fn first_claim(&self, tool: &str, until_provider: Option<&str>) -> Option<ToolOrigin> {
        if self.core.iter().any(|t| t.name == tool) {
            return Some(ToolOrigin::Core);
        }
        for (name, defs) in &self.providers {
            if until_provider == Some(name.as_str()) {
                break;
            }
            if defs.iter().any(|t| t.name == tool) {
                return Some(ToolOrigin::Provider(name.clone()));
            }
        }
        None
    }
}

/// Tool catalogue (C3)
#[derive(Default)]
pub struct ToolCatalog {
    inner: RwLock<Inner>,
}

impl ToolCatalog {
    /// Create an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the built-in tool set. Called once at startup; core names are
    /// immutable for the lifetime of the process.
    pub fn publish_core(&self, defs: Vec<ToolDef>) {
        let mut inner = self.inner.write();
        if !inner.core.is_empty() {
            tracing::warn!("core tool set already published, ignoring");
            return;
        }
        inner.core = defs;
    }

    /// Replace a provider's contribution. Call after every start or restart.
    pub fn publish_provider(&self, provider: &str, defs: Vec<ToolDef>) {
        let mut inner = self.inner.write();

        for def in &defs {
            if let Some(winner) = inner.first_claim(&def.name, Some(provider)) {
                tracing::warn!(
                    tool = %def.name,
                    provider = %provider,
                    shadowed_by = %winner,
                    "tool name conflict, earlier registration wins"
                );
            }
        }

        if let Some(slot) = inner.providers.iter_mut().find(|(n, _)| n == provider) {
            slot.1 = defs;
        } else {
            inner.providers.push((provider.to_string(), defs));
        }
    }

    /// Remove every contribution of a provider.
    pub fn retract_provider(&self, provider: &str) {
        self.inner.write().providers.retain(|(n, _)| n != provider);
    }

    /// Resolve a tool name to its owning origin and definition.
    #[must_use]
    pub fn resolve(&self, tool: &str) -> Option<(ToolOrigin, ToolDef)> {
        let inner = self.inner.read();
        if let Some(def) = inner.core.iter().find(|t| t.name == tool) {
            return Some((ToolOrigin::Core, def.clone()));
        }
        for (name, defs) in &inner.providers {
            if let Some(def) = defs.iter().find(|t| t.name == tool) {
                return Some((ToolOrigin::Provider(name.clone()), def.clone()));
            }
        }
        None
    }

    /// Flattened catalogue with shadowed names elided, in announcement order:
    /// core first, then providers in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ToolOrigin, ToolDef)> {
        let inner = self.inner.read();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for def in &inner.core {
            if seen.insert(def.name.clone()) {
                out.push((ToolOrigin::Core, def.clone()));
            }
        }
        for (name, defs) in &inner.providers {
            for def in defs {
                if seen.insert(def.name.clone()) {
                    out.push((ToolOrigin::Provider(name.clone()), def.clone()));
                }
            }
        }
        out
    }

    /// The snapshot in the wire shape used by `register_tools`.
    #[must_use]
    pub fn wire_snapshot(&self) -> Vec<WireTool> {
        self.snapshot()
            .into_iter()
            .map(|(origin, def)| WireTool {
                name: def.name,
                description: def.description,
                parameters: def.input_schema,
                server_name: match origin {
                    ToolOrigin::Core => None,
                    ToolOrigin::Provider(name) => Some(name),
                },
            })
            .collect()
    }

    /// Number of tools a provider currently contributes.
    #[must_use]
    pub fn provider_tool_count(&self, provider: &str) -> usize {
        self.inner
            .read()
            .providers
            .iter()
            .find(|(n, _)| n == provider)
            .map_or(0, |(_, defs)| defs.len())
    }
}
