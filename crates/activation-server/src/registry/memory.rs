//! In-memory registry implementation.

use super::{Registration, RegistrationStatus};
use crate::error::ActivationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registration counts, reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub activated: usize,
}

/// In-memory registration registry.
///
/// Every mutating operation either applies completely or leaves the record
/// untouched, so callers can snapshot a record before and restore it after a
/// failed write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RegistrySnapshot")]
pub struct Registry {
    /// Registrations indexed by id
    records: HashMap<String, Registration>,

    /// Live and consumed token digests to registration id
    #[serde(skip)]
    token_index: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RegistrySnapshot {
    records: HashMap<String, Registration>,
}

impl From<RegistrySnapshot> for Registry {
    fn from(snapshot: RegistrySnapshot) -> Self {
        let mut token_index = HashMap::new();
        for registration in snapshot.records.values() {
            index_digests(&mut token_index, registration);
        }
        Self {
            records: snapshot.records,
            token_index,
        }
    }
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a registration by id.
    pub fn get(&self, id: &str) -> Option<&Registration> {
        self.records.get(id)
    }

    /// Get a registration by normalized email.
    pub fn get_by_email(&self, email: &str) -> Option<&Registration> {
        self.records.values().find(|r| r.email == email)
    }

    /// Insert a new registration. Ids and emails are unique.
    pub fn insert(&mut self, registration: Registration) -> Result<(), ActivationError> {
        if self.records.contains_key(&registration.id) {
            return Err(ActivationError::InvalidRegistration(format!(
                "duplicate id {}",
                registration.id
            )));
        }
        if self.get_by_email(&registration.email).is_some() {
            return Err(ActivationError::InvalidRegistration(
                "email already registered".into(),
            ));
        }
        if !registration.is_consistent() {
            return Err(ActivationError::InvalidRegistration(
                "activated registration must have activated_at and no live token".into(),
            ));
        }
        if digests(&registration).any(|digest| self.token_index.contains_key(digest)) {
            return Err(ActivationError::InvalidRegistration(
                "activation token already in use".into(),
            ));
        }

        index_digests(&mut self.token_index, &registration);
        self.records.insert(registration.id.clone(), registration);
        Ok(())
    }

    /// Put back a previously captured copy of a record (or remove it if it
    /// did not exist before).
    pub fn restore(&mut self, id: &str, previous: Option<Registration>) {
        if let Some(current) = self.records.remove(id) {
            unindex_digests(&mut self.token_index, &current);
        }
        if let Some(registration) = previous {
            index_digests(&mut self.token_index, &registration);
            self.records.insert(id.to_string(), registration);
        }
    }

    /// Find the registration whose live or consumed token digest matches.
    pub fn find_by_token_hash(&self, token_hash: &str) -> Option<&Registration> {
        self.token_index
            .get(token_hash)
            .and_then(|id| self.records.get(id))
            .filter(|registration| digests(registration).any(|digest| digest == token_hash))
    }

    /// Record approval. A no-op for registrations already past pending.
    pub fn approve(&mut self, id: &str) -> Result<(), ActivationError> {
        let registration = self.get_mut(id)?;
        if registration
            .status
            .can_transition_to(RegistrationStatus::Approved)
        {
            registration.status = RegistrationStatus::Approved;
        }
        Ok(())
    }

    /// Attach a fresh activation link to a registration that is not yet
    /// activated, replacing any previous one.
    ///
    /// Refused while an activation holds the consumed token: replacing it
    /// then would strand that attempt with nothing to restore. A stranded
    /// registration keeps refusing until an operator clears the consumed
    /// digest.
    pub fn attach_token(
        &mut self,
        id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        if self
            .token_index
            .get(token_hash)
            .is_some_and(|owner| owner != id)
        {
            return Err(ActivationError::InvalidRegistration(
                "activation token already in use".into(),
            ));
        }

        let Self {
            records,
            token_index,
        } = self;
        let registration = records
            .get_mut(id)
            .ok_or_else(|| ActivationError::NotFound(id.to_string()))?;
        if registration.is_activated() {
            return Err(ActivationError::InvalidRegistration(
                "registration already activated".into(),
            ));
        }
        if registration.consumed_token_hash.is_some() {
            return Err(ActivationError::InvalidRegistration(
                "activation in progress".into(),
            ));
        }

        unindex_digests(token_index, registration);
        registration.activation_token_hash = Some(token_hash.to_string());
        registration.activation_token_expires_at = Some(expires_at);
        index_digests(token_index, registration);
        Ok(())
    }

    /// Replace the live token digest with `new`, only if it currently equals
    /// `expected`. Returns whether the swap happened.
    ///
    /// Clearing a token remembers it as consumed. Restoring a token is
    /// refused once the registration is activated.
    pub fn compare_and_swap_token(
        &mut self,
        id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> bool {
        let Self {
            records,
            token_index,
        } = self;
        let Some(registration) = records.get_mut(id) else {
            return false;
        };

        if registration.activation_token_hash.as_deref() != expected {
            return false;
        }
        if new.is_some() && registration.is_activated() {
            return false;
        }

        unindex_digests(token_index, registration);
        match (expected, new) {
            (Some(consumed), None) => {
                registration.consumed_token_hash = Some(consumed.to_string());
            }
            (_, Some(restored)) => {
                if registration.consumed_token_hash.as_deref() == Some(restored) {
                    registration.consumed_token_hash = None;
                }
            }
            (None, None) => {}
        }

        registration.activation_token_hash = new.map(str::to_string);
        index_digests(token_index, registration);
        true
    }

    /// Mark a registration activated. The live token must already be cleared.
    pub fn mark_activated(
        &mut self,
        id: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        let registration = self.get_mut(id)?;

        if !registration
            .status
            .can_transition_to(RegistrationStatus::Activated)
        {
            return Err(ActivationError::InvalidRegistration(
                "registration already activated".into(),
            ));
        }
        if registration.activation_token_hash.is_some() {
            return Err(ActivationError::InvalidRegistration(
                "activation token must be consumed before activation".into(),
            ));
        }

        registration.status = RegistrationStatus::Activated;
        registration.activated_at = Some(at);
        registration.account_id = Some(account_id.to_string());
        Ok(())
    }

    /// Get the number of registrations.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn stats(&self) -> RegistryStats {
        self.records
            .values()
            .fold(RegistryStats::default(), |mut stats, r| {
                stats.total += 1;
                match r.status {
                    RegistrationStatus::Pending => stats.pending += 1,
                    RegistrationStatus::Approved => stats.approved += 1,
                    RegistrationStatus::Activated => stats.activated += 1,
                }
                stats
            })
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Registration, ActivationError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| ActivationError::NotFound(id.to_string()))
    }
}

/// Live and consumed digests of a registration.
fn digests(registration: &Registration) -> impl Iterator<Item = &str> {
    registration
        .activation_token_hash
        .as_deref()
        .into_iter()
        .chain(registration.consumed_token_hash.as_deref())
}

fn index_digests(index: &mut HashMap<String, String>, registration: &Registration) {
    for digest in digests(registration) {
        index.insert(digest.to_string(), registration.id.clone());
    }
}

fn unindex_digests(index: &mut HashMap<String, String>, registration: &Registration) {
    for digest in digests(registration) {
        if index.get(digest) == Some(&registration.id) {
            index.remove(digest);
        }
    }
}
