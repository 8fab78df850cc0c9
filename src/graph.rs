//! Signing-graph traversal.
//!
//! The graph is never stored. An edge `parent -> child` exists when the
//! child's latest version names the parent as its CA.

use std::collections::HashSet;

use crate::credential::name_key;
use crate::error::CredvaultError;
use crate::store::StoreData;

/// Read access to the derived signing graph.
pub trait SigningGraph {
    /// Whether a credential with this name exists.
    fn has_node(&self, name: &str) -> bool;

    /// Names of the certificates directly signed by `name`, in any order.
    fn children_of(&self, name: &str) -> Vec<String>;
}

impl SigningGraph for StoreData {
    fn has_node(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    fn children_of(&self, name: &str) -> Vec<String> {
        self.signed_by(name)
    }
}

/// Computes the regeneration order below a CA.
pub struct CertificateGraphResolver<'g, G: SigningGraph + ?Sized> {
    graph: &'g G,
}

impl<'g, G: SigningGraph + ?Sized> CertificateGraphResolver<'g, G> {
    pub fn new(graph: &'g G) -> Self {
        Self { graph }
    }

    /// Every certificate transitively signed by `ca_name`, excluding the CA.
    ///
    /// Breadth first; each level is sorted by name before it is emitted and
    /// before its children are looked up, so parents always precede their
    /// children and siblings come out in a stable order.
    pub fn resolve_descendants(&self, ca_name: &str) -> Result<Vec<String>, CredvaultError> {
        if !self.graph.has_node(ca_name) {
            tracing::error!(ca = %ca_name, "signing graph root does not exist");
            return Err(CredvaultError::Integrity(format!("missing signing CA {ca_name}")));
        }

        let mut visited: HashSet<String> = HashSet::from([name_key(ca_name)]);
        let mut ordered = Vec::new();
        let mut level = self.graph.children_of(ca_name);
        level.sort();

        let mut depth = 1usize;
        while !level.is_empty() {
            for name in &level {
                if !visited.insert(name_key(name)) {
                    tracing::error!(ca = %ca_name, credential = %name, "cycle in signing graph");
                    return Err(CredvaultError::Integrity(format!(
                        "signing graph below {ca_name} revisits {name}"
                    )));
                }
            }
            tracing::debug!(ca = %ca_name, depth, width = level.len(), "resolved signing graph level");

            let mut next: Vec<String> = level
                .iter()
                .flat_map(|name| self.graph.children_of(name))
                .collect();
            next.sort();

            ordered.append(&mut level);
            level = next;
            depth += 1;
        }

        Ok(ordered)
    }
}
