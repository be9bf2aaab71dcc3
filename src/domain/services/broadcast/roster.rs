use crate::domain::models::{Client, ClientRef};

use super::error::{RegistryError, RegistryResult};

/// Canonical list of registered clients.
///
/// Only the registry's control loop owns a roster, so it needs no locking.
#[derive(Debug, Default)]
pub struct Roster {
    clients: Vec<Client>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: Client) {
        self.clients.push(client);
    }

    /// Removes a client by mailbox identity.
    ///
    /// The last client takes the removed one's slot, so order is not kept.
    ///
    /// # Returns
    /// * `Ok(Client)` - The removed client
    /// * `Err(RegistryError::ClientNotFound)` - If no registered client matches
    pub fn remove(&mut self, target: &ClientRef) -> RegistryResult<Client> {
        let position = self
            .clients
            .iter()
            .position(|client| target.refers_to(client))
            .ok_or(RegistryError::ClientNotFound)?;

        Ok(self.clients.swap_remove(position))
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drops every client, which closes their mailboxes.
    pub fn clear(&mut self) {
        self.clients.clear();
    }
}
