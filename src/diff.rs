//! Add-then-delete reconciliation of an actual object set against a desired one.
//!
//! Every actual member starts as a delete candidate. Desired members already
//! present are un-marked, missing ones become creates. Whatever is still
//! marked is deleted after all creates have been issued, so an empty desired
//! set degrades into deleting every member one by one.

use std::collections::BTreeSet;

/// Operations needed to move a backend from its actual set to the desired one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<T> {
    /// Members to create, in desired order
    pub create: Vec<T>,
    /// Members to delete once every create has been applied
    pub delete: Vec<T>,
}

impl<T> ReconcilePlan<T> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

impl<T> Default for ReconcilePlan<T> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// Compute creates (`desired \ actual`) and deletes (`actual \ desired`)
pub fn plan<T, A, D>(actual: A, desired: D) -> ReconcilePlan<T>
where
    T: Ord + Clone,
    A: IntoIterator<Item = T>,
    D: IntoIterator<Item = T>,
{
    let mut candidates: BTreeSet<T> = actual.into_iter().collect();
    let mut seen = BTreeSet::new();
    let mut result = ReconcilePlan::default();

    for member in desired {
        if !seen.insert(member.clone()) {
            continue;
        }
        if !candidates.remove(&member) {
            result.create.push(member);
        }
    }

    result.delete = candidates.into_iter().collect();
    result
}
