//! The identity stamped onto every outbound frame.

/// Immutable identity of the local client, stamped onto every outbound frame
/// that carries identity fields (Subscribe/Unsubscribe, Command).
///
/// Created once at channel construction; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// A unique id for this client instance within the cluster.
    pub client_id: String,
    /// The logical component name this client presents as.
    pub component_name: String,
}

impl ClientIdentity {
    /// Builds a new identity.
    pub fn new(client_id: impl Into<String>, component_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            component_name: component_name.into(),
        }
    }
}

/// Mints a fresh instruction id.
///
/// Isolated behind a function rather than inlined `Uuid::new_v4()` calls so
/// the id-generation strategy stays swappable.
#[must_use]
pub fn fresh_instruction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
