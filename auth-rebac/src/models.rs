use crate::error::{RebacError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of entity that can hold a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Agent,
    Group,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Agent => "agent",
            SubjectType::Group => "group",
        }
    }
}

impl FromStr for SubjectType {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(SubjectType::User),
            "agent" => Ok(SubjectType::Agent),
            "group" => Ok(SubjectType::Group),
            other => Err(RebacError::InvalidTuple(format!("Unknown subject type: {}", other))),
        }
    }
}

/// Kind of entity a relation points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    File,
    Directory,
    Zone,
    Group,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::Directory => "directory",
            ObjectType::Zone => "zone",
            ObjectType::Group => "group",
        }
    }
}

impl FromStr for ObjectType {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(ObjectType::File),
            "directory" => Ok(ObjectType::Directory),
            "zone" => Ok(ObjectType::Zone),
            "group" => Ok(ObjectType::Group),
            other => Err(RebacError::InvalidTuple(format!("Unknown object type: {}", other))),
        }
    }
}

/// Relation between a subject and an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Owner,
    Editor,
    Viewer,
    MemberOf,
    SharedWith,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Owner => "owner",
            Relation::Editor => "editor",
            Relation::Viewer => "viewer",
            Relation::MemberOf => "member_of",
            Relation::SharedWith => "shared_with",
        }
    }
}

impl FromStr for Relation {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Relation::Owner),
            "editor" => Ok(Relation::Editor),
            "viewer" => Ok(Relation::Viewer),
            "member_of" => Ok(Relation::MemberOf),
            "shared_with" => Ok(Relation::SharedWith),
            other => Err(RebacError::InvalidTuple(format!("Unknown relation: {}", other))),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenancy boundary identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl ZoneId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user, agent or group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub subject_type: SubjectType,
    pub id: String,
}

impl SubjectRef {
    pub fn user(id: &str) -> Self {
        Self { subject_type: SubjectType::User, id: id.to_string() }
    }

    pub fn agent(id: &str) -> Self {
        Self { subject_type: SubjectType::Agent, id: id.to_string() }
    }

    pub fn group(id: &str) -> Self {
        Self { subject_type: SubjectType::Group, id: id.to_string() }
    }

    /// The object side of a group, i.e. what `member_of` tuples point at
    pub fn as_group_object(&self) -> Option<ObjectRef> {
        match self.subject_type {
            SubjectType::Group => Some(ObjectRef::group(&self.id)),
            _ => None,
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type.as_str(), self.id)
    }
}

/// A file, directory, zone or group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub id: String,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, id: &str) -> Self {
        Self { object_type, id: id.to_string() }
    }

    pub fn file(path: &str) -> Self {
        Self::new(ObjectType::File, path)
    }

    pub fn directory(path: &str) -> Self {
        Self::new(ObjectType::Directory, path)
    }

    pub fn zone(zone: &ZoneId) -> Self {
        Self::new(ObjectType::Zone, zone.as_str())
    }

    pub fn group(id: &str) -> Self {
        Self::new(ObjectType::Group, id)
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.object_type, ObjectType::File | ObjectType::Directory)
    }

    /// Groups appear on both sides of `member_of`
    pub fn as_group_subject(&self) -> Option<SubjectRef> {
        match self.object_type {
            ObjectType::Group => Some(SubjectRef::group(&self.id)),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TupleId(pub Uuid);

impl TupleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TupleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a tuple is in its life. `Revoked` and `Deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Revoked { at: DateTime<Utc> },
    Deleted { at: DateTime<Utc> },
}

impl LifecycleState {
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Revoked { .. } => "revoked",
            LifecycleState::Deleted { .. } => "deleted",
        }
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self {
            LifecycleState::Active => None,
            LifecycleState::Revoked { at } | LifecycleState::Deleted { at } => Some(*at),
        }
    }

    /// Rebuild from the persisted `lifecycle_state` / `revoked_at` column pair.
    pub fn from_columns(state: &str, revoked_at: Option<DateTime<Utc>>) -> Result<Self> {
        match (state, revoked_at) {
            ("active", None) => Ok(LifecycleState::Active),
            ("revoked", Some(at)) => Ok(LifecycleState::Revoked { at }),
            ("deleted", Some(at)) => Ok(LifecycleState::Deleted { at }),
            (state, at) => Err(RebacError::Storage(format!(
                "Inconsistent lifecycle columns: state={} revoked_at={:?}",
                state, at
            ))),
        }
    }

    /// Active is the only state that may transition.
    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState> {
        match (self, next) {
            (LifecycleState::Active, LifecycleState::Revoked { .. })
            | (LifecycleState::Active, LifecycleState::Deleted { .. }) => Ok(next),
            (from, to) => Err(RebacError::InvalidTuple(format!(
                "Invalid lifecycle transition {} -> {}",
                from.as_str(),
                to.as_str()
            ))),
        }
    }
}

/// Identity of an Active tuple: at most one Active row per key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleKey {
    pub subject: SubjectRef,
    pub relation: Relation,
    pub object: ObjectRef,
}

impl TupleKey {
    pub fn new(subject: SubjectRef, relation: Relation, object: ObjectRef) -> Self {
        Self { subject, relation, object }
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.relation, self.object)
    }
}

/// A relationship fact: subject has relation to object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTuple {
    pub id: TupleId,
    pub subject: SubjectRef,
    pub relation: Relation,
    pub object: ObjectRef,
    pub zone_id: ZoneId,
    pub created_at: DateTime<Utc>,
    pub state: LifecycleState,
}

impl RelationTuple {
    pub fn new(subject: SubjectRef, relation: Relation, object: ObjectRef, zone_id: ZoneId) -> Self {
        Self {
            id: TupleId::new(),
            subject,
            relation,
            object,
            zone_id,
            created_at: Utc::now(),
            state: LifecycleState::Active,
        }
    }

    pub fn key(&self) -> TupleKey {
        TupleKey::new(self.subject.clone(), self.relation, self.object.clone())
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} @{}", self.subject, self.relation, self.object, self.zone_id)
    }
}

/// Filesystem operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    Share,
    List,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Share => "share",
            Action::List => "list",
        }
    }
}

impl FromStr for Action {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "delete" => Ok(Action::Delete),
            "share" => Ok(Action::Share),
            "list" => Ok(Action::List),
            other => Err(RebacError::InvalidTuple(format!("Unknown action: {}", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// A file or directory as seen by the authorization core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub path: String,
    pub object_type: ObjectType,
    pub zone_id: ZoneId,
    /// `None` for a zone root
    pub parent: Option<String>,
}

impl ResourceNode {
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.object_type, &self.path)
    }
}

/// What a cascade revoke is sweeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeTarget {
    Object(ObjectRef),
    Subject(SubjectRef),
}

impl fmt::Display for CascadeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeTarget::Object(o) => write!(f, "{}", o),
            CascadeTarget::Subject(s) => write!(f, "{}", s),
        }
    }
}

/// What happens to a row on revoke or cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokePolicy {
    /// Mark the row Revoked / Deleted and keep it as audit history
    #[default]
    Retain,
    /// Remove the row
    Purge,
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: SubjectRef,
    pub action: Action,
    pub resource: String,
    pub zone_id: ZoneId,
}

/// Authorization check response. `error` is set only when a fault forced a Deny.
#[derive(Debug)]
pub struct CheckResponse {
    pub decision: Decision,
    pub error: Option<RebacError>,
    pub cached: bool,
}

impl CheckResponse {
    pub fn allow(cached: bool) -> Self {
        Self { decision: Decision::Allow, error: None, cached }
    }

    pub fn deny(cached: bool) -> Self {
        Self { decision: Decision::Deny, error: None, cached }
    }

    pub fn fault(error: RebacError) -> Self {
        Self { decision: Decision::Deny, error: Some(error), cached: false }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(RebacError::code)
    }
}
