use crate::{error::RebacError, models::*};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Permission schema: which relations satisfy each action, and what an
/// ancestor's relation implies on its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub actions: HashMap<Action, Vec<Relation>>,
    pub inheritance: Vec<InheritanceRule>,
}

/// Relation held on an ancestor and what it implies on every descendant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InheritanceRule {
    pub ancestor: Relation,
    pub implies: Relation,
    pub description: String,
}

impl Default for Schema {
    fn default() -> Self {
        Self::filesystem_schema()
    }
}

impl Schema {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            inheritance: Vec::new(),
        }
    }

    /// Schema for the virtual filesystem
    pub fn filesystem_schema() -> Self {
        let readers = vec![
            Relation::Viewer,
            Relation::Editor,
            Relation::Owner,
            Relation::SharedWith,
        ];

        let mut actions = HashMap::new();
        actions.insert(Action::Read, readers.clone());
        actions.insert(Action::List, readers);
        actions.insert(Action::Write, vec![Relation::Editor, Relation::Owner]);
        actions.insert(Action::Delete, vec![Relation::Owner]);
        actions.insert(Action::Share, vec![Relation::Owner]);

        let inheritance = vec![
            InheritanceRule {
                ancestor: Relation::Owner,
                implies: Relation::Editor,
                description: "Owning a directory grants edit on its contents".to_string(),
            },
            InheritanceRule {
                ancestor: Relation::Editor,
                implies: Relation::Editor,
                description: "Editing a directory grants edit on its contents".to_string(),
            },
            InheritanceRule {
                ancestor: Relation::Viewer,
                implies: Relation::Viewer,
                description: "Viewing a directory grants view on its contents".to_string(),
            },
            InheritanceRule {
                ancestor: Relation::SharedWith,
                implies: Relation::Viewer,
                description: "A shared directory is viewable below".to_string(),
            },
        ];

        Self { actions, inheritance }
    }

    /// Relations that satisfy `action`; empty when the action is unknown
    pub fn required_relations(&self, action: Action) -> &[Relation] {
        self.actions.get(&action).map(Vec::as_slice).unwrap_or(&[])
    }

    /// What `relation` on an ancestor implies on a descendant, if anything
    pub fn inherited(&self, relation: Relation) -> Option<Relation> {
        self.inheritance
            .iter()
            .find(|rule| rule.ancestor == relation)
            .map(|rule| rule.implies)
    }

    /// Validate that a tuple is shaped correctly for its relation
    pub fn validate_tuple(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        match tuple.relation {
            Relation::MemberOf => {
                if tuple.object.object_type != ObjectType::Group {
                    return Err(RebacError::InvalidTuple(format!(
                        "member_of must point at a group, got {}",
                        tuple.object
                    )));
                }
                if tuple.subject.as_group_object().as_ref() == Some(&tuple.object) {
                    return Err(RebacError::CycleDetected(format!(
                        "{} cannot be a member of itself",
                        tuple.subject
                    )));
                }
            }
            relation => {
                if tuple.object.object_type == ObjectType::Group {
                    return Err(RebacError::InvalidTuple(format!(
                        "Relation '{}' is not defined on groups",
                        relation
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<(), RebacError> {
        for action in [Action::Read, Action::Write, Action::Delete, Action::Share, Action::List] {
            let required = self.required_relations(action);
            if required.is_empty() {
                return Err(RebacError::InvalidSchema(format!(
                    "Action '{}' has no satisfying relation",
                    action
                )));
            }
            if required.contains(&Relation::MemberOf) {
                return Err(RebacError::InvalidSchema(format!(
                    "Action '{}' cannot be satisfied by member_of",
                    action
                )));
            }
        }

        for (i, rule) in self.inheritance.iter().enumerate() {
            if rule.ancestor == Relation::MemberOf || rule.implies == Relation::MemberOf {
                return Err(RebacError::InvalidSchema(
                    "member_of does not inherit down the directory tree".to_string(),
                ));
            }
            if self.inheritance.iter().skip(i + 1).any(|r| r.ancestor == rule.ancestor) {
                return Err(RebacError::InvalidSchema(format!(
                    "Relation '{}' has more than one inheritance rule",
                    rule.ancestor
                )));
            }
        }
        Ok(())
    }
}
