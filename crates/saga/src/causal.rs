//! Causal graph of a saga, reconstructed from its step records.

use std::collections::{BTreeSet, HashMap, HashSet};

use common::MessageId;
use saga_store::SagaStepMetadata;

/// Parent/child links between the messages of one saga.
///
/// Built from a snapshot of step records; every record contributes its
/// `message_id -> parent_message_id` edge.
#[derive(Debug, Clone, Default)]
pub struct CausalGraph {
    steps: Vec<SagaStepMetadata>,
    by_message: HashMap<MessageId, Vec<usize>>,
    parents: HashMap<MessageId, MessageId>,
    children: HashMap<MessageId, BTreeSet<MessageId>>,
}

impl CausalGraph {
    pub fn new(steps: Vec<SagaStepMetadata>) -> Self {
        let mut graph = Self::default();
        for (index, step) in steps.iter().enumerate() {
            graph
                .by_message
                .entry(step.message_id)
                .or_default()
                .push(index);
            if let Some(parent) = step.parent_message_id {
                graph.parents.insert(step.message_id, parent);
                graph
                    .children
                    .entry(parent)
                    .or_default()
                    .insert(step.message_id);
            }
        }
        graph.steps = steps;
        graph
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.by_message.contains_key(&message_id)
    }

    /// Records driven by the message, across all handlers.
    pub fn steps_for(&self, message_id: MessageId) -> impl Iterator<Item = &SagaStepMetadata> {
        self.by_message
            .get(&message_id)
            .into_iter()
            .flatten()
            .map(|&index| &self.steps[index])
    }

    /// Wire type name of the message, if any record mentions it.
    pub fn message_type_of(&self, message_id: MessageId) -> Option<&str> {
        self.steps_for(message_id)
            .next()
            .map(|step| step.message_type_name.as_str())
    }

    pub fn parent_of(&self, message_id: MessageId) -> Option<MessageId> {
        self.parents.get(&message_id).copied()
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors_of(&self, message_id: MessageId) -> Vec<MessageId> {
        let mut seen = HashSet::from([message_id]);
        let mut ancestors = Vec::new();
        let mut current = message_id;
        while let Some(parent) = self.parent_of(current) {
            if !seen.insert(parent) {
                break;
            }
            ancestors.push(parent);
            current = parent;
        }
        ancestors
    }

    pub fn children_of(&self, message_id: MessageId) -> Vec<MessageId> {
        self.children
            .get(&message_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tracked messages without a parent.
    pub fn roots(&self) -> Vec<MessageId> {
        let mut roots: Vec<_> = self
            .by_message
            .keys()
            .filter(|id| !self.parents.contains_key(id))
            .copied()
            .collect();
        roots.sort();
        roots
    }
}
