// Chat message tree with a distinguished head node.
//
// Invariants:
// - every `children` entry of a node names a node whose `parent` is that node
// - following `parent` links from any node ends at exactly one root
// - `head`, when set, names an existing node

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Message, MessageNode, NodeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("parent node `{0}` does not exist in this chat")]
    UnknownParent(NodeId),

    #[error("node `{0}` does not exist in this chat")]
    UnknownNode(NodeId),

    #[error("node `{child}` lists child whose parent is not `{parent}`")]
    BrokenChildLink { parent: NodeId, child: NodeId },

    #[error("node `{0}` is part of a parent cycle")]
    Cycle(NodeId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TreeHistory {
    nodes: BTreeMap<NodeId, MessageNode>,
    head: Option<NodeId>,
}

impl TreeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&NodeId> {
        self.head.as_ref()
    }

    pub fn get(&self, id: &str) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MessageNode> {
        self.nodes.values()
    }

    /// Append a message under `parent` (or as a new root) and make it the head.
    pub fn append(
        &mut self,
        message: Message,
        parent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<NodeId, HistoryError> {
        if let Some(parent_id) = parent {
            if !self.nodes.contains_key(parent_id) {
                return Err(HistoryError::UnknownParent(parent_id.to_string()));
            }
        }

        let id = Uuid::new_v4().to_string();
        if let Some(parent_node) = parent.and_then(|parent_id| self.nodes.get_mut(parent_id)) {
            parent_node.children.push(id.clone());
        }
        self.nodes.insert(
            id.clone(),
            MessageNode {
                id: id.clone(),
                message,
                parent: parent.map(ToOwned::to_owned),
                children: Vec::new(),
                created_at: now,
            },
        );
        self.head = Some(id.clone());
        Ok(id)
    }

    /// Messages from the root down to `id`, inclusive.
    pub fn lineage(&self, id: &str) -> Result<Vec<&Message>, HistoryError> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let node =
                self.nodes.get(&current).ok_or_else(|| HistoryError::UnknownNode(current.clone()))?;
            if chain.len() > self.nodes.len() {
                return Err(HistoryError::Cycle(current));
            }
            chain.push(&node.message);
            cursor = node.parent.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Check the structural invariants listed at the top of this module.
    pub fn validate(&self) -> Result<(), HistoryError> {
        for node in self.nodes.values() {
            if let Some(parent) = &node.parent {
                if !self.nodes.contains_key(parent) {
                    return Err(HistoryError::UnknownParent(parent.clone()));
                }
            }
            for child in &node.children {
                let linked = self
                    .nodes
                    .get(child)
                    .is_some_and(|child_node| child_node.parent.as_deref() == Some(&node.id));
                if !linked {
                    return Err(HistoryError::BrokenChildLink {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                }
            }
            self.lineage(&node.id)?;
        }
        if let Some(head) = &self.head {
            if !self.nodes.contains_key(head) {
                return Err(HistoryError::UnknownNode(head.clone()));
            }
        }
        Ok(())
    }
}
