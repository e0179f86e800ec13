//! Entity descriptors.
//!
//! A [`Schema`] is built once from the application's entity descriptors.
//! Building it validates the relationship graph and decides, for every
//! relationship, whether it is written into remote records. Exactly one
//! side of each inverse pair is serialized; the other side is rebuilt
//! locally from the inverse.

use crate::error::{SyncError, SyncResult};
use cloudstore_codec::{ScalarKind, Value};
use std::collections::BTreeMap;

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one target.
    ToOne,
    /// Any number of targets.
    ToMany,
}

/// What happens to related rows when a row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRule {
    /// Delete the related rows too.
    Cascade,
    /// Remove the deleted row from the related rows' inverse.
    #[default]
    Nullify,
    /// Leave the related rows untouched.
    NoAction,
}

/// A typed attribute of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    /// Attribute name, also the remote field name.
    pub name: String,
    /// Declared scalar kind.
    pub kind: ScalarKind,
    /// Value used when the remote field is missing or unusable.
    pub default: Value,
    /// Whether binary values go through the store's byte transform.
    pub transformed: bool,
}

impl AttributeDescriptor {
    /// Creates an attribute with a null default.
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Value::Null,
            transformed: kind == ScalarKind::Binary,
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    /// Stores binary values without the byte transform.
    pub fn untransformed(mut self) -> Self {
        self.transformed = false;
        self
    }
}

/// A relationship from one entity to another.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    /// Relationship name, also the remote field name.
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Cardinality.
    pub cardinality: Cardinality,
    /// Whether a to-many relationship keeps its order.
    pub ordered: bool,
    /// Name of the inverse relationship on the target entity.
    pub inverse: Option<String>,
    /// Delete rule.
    pub delete_rule: DeleteRule,
    serialize: bool,
}

impl RelationshipDescriptor {
    /// Creates a to-one relationship.
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name.into(), target.into(), Cardinality::ToOne)
    }

    /// Creates an unordered to-many relationship.
    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name.into(), target.into(), Cardinality::ToMany)
    }

    fn new(name: String, target: String, cardinality: Cardinality) -> Self {
        Self {
            name,
            target,
            cardinality,
            ordered: false,
            inverse: None,
            delete_rule: DeleteRule::default(),
            serialize: true,
        }
    }

    /// Marks a to-many relationship as ordered.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Sets the inverse relationship.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    /// Sets the delete rule.
    pub fn with_delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Returns true if this side is written into remote records.
    pub fn should_serialize(&self) -> bool {
        self.serialize
    }

    /// Returns true for a to-many relationship.
    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }
}

/// Describes one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    /// Entity name, also the remote record type.
    pub name: String,
    /// Attributes in declaration order.
    pub attributes: Vec<AttributeDescriptor>,
    /// Relationships in declaration order.
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    /// Creates an entity without properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Adds an attribute.
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds a relationship.
    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Looks up an attribute.
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up an attribute, failing if it is not declared.
    pub fn require_attribute(&self, name: &str) -> SyncResult<&AttributeDescriptor> {
        self.find_attribute(name)
            .ok_or_else(|| SyncError::unknown_attribute(&self.name, name))
    }

    /// Looks up a relationship.
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Looks up a relationship, failing if it is not declared.
    pub fn require_relationship(&self, name: &str) -> SyncResult<&RelationshipDescriptor> {
        self.find_relationship(name)
            .ok_or_else(|| SyncError::unknown_relationship(&self.name, name))
    }

    /// Relationships written into remote records.
    pub fn serialized_relationships(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.relationships.iter().filter(|r| r.should_serialize())
    }
}

/// A validated set of entity descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl Schema {
    /// Validates `entities` and resolves relationship ownership.
    pub fn new(entities: Vec<EntityDescriptor>) -> SyncResult<Self> {
        let mut map = BTreeMap::new();
        for entity in entities {
            validate_entity(&entity)?;
            let name = entity.name.clone();
            if map.insert(name.clone(), entity).is_some() {
                return Err(SyncError::InvalidSchema(format!(
                    "entity {name} declared twice"
                )));
            }
        }

        let mut ownership = Vec::new();
        for entity in map.values() {
            for relationship in &entity.relationships {
                let target = map.get(&relationship.target).ok_or_else(|| {
                    SyncError::InvalidSchema(format!(
                        "{}.{} targets unknown entity {}",
                        entity.name, relationship.name, relationship.target
                    ))
                })?;
                let inverse = match &relationship.inverse {
                    Some(inverse_name) => {
                        let inverse = target.find_relationship(inverse_name).ok_or_else(|| {
                            SyncError::InvalidSchema(format!(
                                "{}.{} names missing inverse {}.{}",
                                entity.name, relationship.name, target.name, inverse_name
                            ))
                        })?;
                        if inverse.target != entity.name
                            || inverse.inverse.as_deref() != Some(relationship.name.as_str())
                        {
                            return Err(SyncError::InvalidSchema(format!(
                                "{}.{} and {}.{} are not inverses of each other",
                                entity.name, relationship.name, target.name, inverse_name
                            )));
                        }
                        Some(inverse)
                    }
                    None => None,
                };
                let serialize = owns_serialization(&entity.name, relationship, inverse);
                ownership.push((entity.name.clone(), relationship.name.clone(), serialize));
            }
        }

        for (entity, relationship, serialize) in ownership {
            if let Some(descriptor) = map
                .get_mut(&entity)
                .and_then(|e| e.relationships.iter_mut().find(|r| r.name == relationship))
            {
                descriptor.serialize = serialize;
            }
        }

        Ok(Self { entities: map })
    }

    /// Looks up an entity.
    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    /// Looks up an entity, failing if it is not declared.
    pub fn require_entity(&self, name: &str) -> SyncResult<&EntityDescriptor> {
        self.entity(name)
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))
    }

    /// Returns the inverse of `relationship` declared on `entity`.
    pub fn inverse_of(
        &self,
        relationship: &RelationshipDescriptor,
    ) -> SyncResult<Option<&RelationshipDescriptor>> {
        match &relationship.inverse {
            Some(inverse) => Ok(Some(
                self.require_entity(&relationship.target)?
                    .require_relationship(inverse)?,
            )),
            None => Ok(None),
        }
    }

    /// Iterates over all entities ordered by name.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if no entity is declared.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn validate_entity(entity: &EntityDescriptor) -> SyncResult<()> {
    if entity.name.is_empty() {
        return Err(SyncError::InvalidSchema("entity without a name".into()));
    }
    let mut names = std::collections::BTreeSet::new();
    let properties = entity
        .attributes
        .iter()
        .map(|a| a.name.as_str())
        .chain(entity.relationships.iter().map(|r| r.name.as_str()));
    for name in properties {
        if name.is_empty() || !names.insert(name) {
            return Err(SyncError::InvalidSchema(format!(
                "entity {} has an empty or duplicate property name {name:?}",
                entity.name
            )));
        }
    }
    for attribute in &entity.attributes {
        if !attribute.default.is_null() && attribute.kind.coerce(&attribute.default).is_none() {
            return Err(SyncError::InvalidSchema(format!(
                "default of {}.{} is not a {}",
                entity.name, attribute.name, attribute.kind
            )));
        }
    }
    Ok(())
}

/// Decides whether `relationship` on `entity` writes its references.
///
/// The side whose inverse cascades owns the pair. Without a cascade hint
/// a to-one side owns over a to-many side, and ties (one-to-one and
/// many-to-many) go to the lexicographically smaller entity name, or the
/// smaller relationship name for relationships of an entity to itself.
fn owns_serialization(
    entity: &str,
    relationship: &RelationshipDescriptor,
    inverse: Option<&RelationshipDescriptor>,
) -> bool {
    let Some(inverse) = inverse else {
        return true;
    };
    let cascades = relationship.delete_rule == DeleteRule::Cascade;
    let inverse_cascades = inverse.delete_rule == DeleteRule::Cascade;
    if inverse_cascades != cascades {
        return inverse_cascades;
    }
    match (relationship.cardinality, inverse.cardinality) {
        (Cardinality::ToOne, Cardinality::ToMany) => true,
        (Cardinality::ToMany, Cardinality::ToOne) => false,
        _ if entity == relationship.target => relationship.name < inverse.name,
        _ => entity < relationship.target.as_str(),
    }
}
