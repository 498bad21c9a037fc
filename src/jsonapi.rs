use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// `{type, id}` reference to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

impl ResourceIdentifier {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

/// Relationship data: a single identifier or a collection of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(ResourceIdentifier),
    Many(Vec<ResourceIdentifier>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RelationshipData>,
}

impl Relationship {
    pub fn one(identifier: ResourceIdentifier) -> Self {
        Self {
            data: Some(RelationshipData::One(identifier)),
        }
    }

    pub fn many(identifiers: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: Some(RelationshipData::Many(identifiers)),
        }
    }

    /// All identifiers referenced by this relationship, regardless of arity.
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match &self.data {
            Some(RelationshipData::One(id)) => vec![id],
            Some(RelationshipData::Many(ids)) => ids.iter().collect(),
            None => Vec::new(),
        }
    }

    /// Declared type of the relationship's target, taken from its first identifier.
    pub fn target_type(&self) -> Option<&str> {
        match &self.data {
            Some(RelationshipData::One(id)) => Some(&id.resource_type),
            Some(RelationshipData::Many(ids)) => ids.first().map(|i| i.resource_type.as_str()),
            None => None,
        }
    }
}

/// Full resource body as carried in documents and response-cache entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub relationships: HashMap<String, Relationship>,
}

impl ResourceObject {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            attributes: Map::new(),
            relationships: HashMap::new(),
        }
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.resource_type.clone(), self.id.clone())
    }
}

/// Primary data: one resource or a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    One(ResourceObject),
    Many(Vec<ResourceObject>),
}

/// Resource document as exchanged with backends. Unknown top-level members
/// (meta, links) survive a parse/serialize round trip via `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included: Option<Vec<ResourceObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }

    pub fn has_data(&self) -> bool {
        match &self.data {
            Some(PrimaryData::One(_)) => true,
            Some(PrimaryData::Many(items)) => !items.is_empty(),
            None => false,
        }
    }

    pub fn primary_resources(&self) -> Vec<&ResourceObject> {
        match &self.data {
            Some(PrimaryData::One(r)) => vec![r],
            Some(PrimaryData::Many(items)) => items.iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn primary_resources_mut(&mut self) -> Vec<&mut ResourceObject> {
        match &mut self.data {
            Some(PrimaryData::One(r)) => vec![r],
            Some(PrimaryData::Many(items)) => items.iter_mut().collect(),
            None => Vec::new(),
        }
    }
}
