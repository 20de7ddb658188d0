//! Configuration-time registry of entity mappings.
//!
//! Everything that can be decided before the first save is decided here:
//! mappings are validated, association targets must be registered,
//! collection identifier strategies are resolved (and rejected when
//! illegal), and one [`GeneratedValuesProcessor`] is built per mapping and
//! event. A built [`Metamodel`] is immutable and shared by sessions.

use keel_core::{
    Dialect, EntityMapping, Error, GenerationEvent, IdentifierGenerator, MappingErrorKind,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::generated::GeneratedValuesProcessor;
use crate::identifier::GeneratorRegistry;

/// Validated, immutable set of entity mappings.
pub struct Metamodel {
    dialect: Dialect,
    mappings: HashMap<String, Arc<EntityMapping>>,
    processors: HashMap<(String, GenerationEvent), Arc<GeneratedValuesProcessor>>,
    collection_ids: HashMap<(String, String), Arc<dyn IdentifierGenerator>>,
}

impl Metamodel {
    /// Start building a metamodel for `dialect`.
    pub fn builder(dialect: Dialect) -> MetamodelBuilder {
        MetamodelBuilder {
            dialect,
            registry: GeneratorRegistry::new(dialect),
            entities: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Look up a mapping by entity name.
    pub fn mapping(&self, entity: &str) -> Result<&Arc<EntityMapping>, Error> {
        self.mappings.get(entity).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                entity,
                format!("no mapping registered for entity '{entity}'"),
            )
        })
    }

    /// Generated-values processor for `entity` and `event`, unless inert.
    pub fn processor(
        &self,
        entity: &str,
        event: GenerationEvent,
    ) -> Option<&Arc<GeneratedValuesProcessor>> {
        self.processors.get(&(entity.to_string(), event))
    }

    /// Row identifier generator of an id-bag association.
    pub fn collection_id_generator(
        &self,
        entity: &str,
        association: &str,
    ) -> Option<&Arc<dyn IdentifierGenerator>> {
        self.collection_ids
            .get(&(entity.to_string(), association.to_string()))
    }

    /// Registered entity names, sorted.
    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mappings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Metamodel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metamodel")
            .field("dialect", &self.dialect)
            .field("entities", &self.entity_names())
            .field("processors", &self.processors.len())
            .field("collection_ids", &self.collection_ids.len())
            .finish()
    }
}

/// Builder for [`Metamodel`].
#[derive(Debug)]
pub struct MetamodelBuilder {
    dialect: Dialect,
    registry: GeneratorRegistry,
    entities: Vec<(EntityMapping, Option<String>)>,
}

impl MetamodelBuilder {
    /// Use `registry` to resolve strategy names.
    #[must_use]
    pub fn registry(mut self, registry: GeneratorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a mapping with its identifier strategy already set.
    #[must_use]
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.entities.push((mapping, None));
        self
    }

    /// Register a mapping whose identifier strategy is given by name
    /// (`assigned`, `identity`, `native`, `sequence`, `table`, `increment`,
    /// `uuid` or a registered generator).
    #[must_use]
    pub fn entity_with_strategy(mut self, mapping: EntityMapping, strategy: impl Into<String>) -> Self {
        self.entities.push((mapping, Some(strategy.into())));
        self
    }

    /// Validate everything and build the metamodel.
    ///
    /// Fails on the first invalid mapping, unknown association target or
    /// unsupported generator strategy.
    #[tracing::instrument(level = "debug", skip(self), fields(dialect = ?self.dialect, entities = self.entities.len()))]
    pub fn build(self) -> Result<Metamodel, Error> {
        let names: Vec<String> = self.entities.iter().map(|(m, _)| m.name.clone()).collect();
        let mut mappings = HashMap::new();
        let mut processors = HashMap::new();
        let mut collection_ids = HashMap::new();

        for (mut mapping, strategy) in self.entities {
            if let Some(strategy) = strategy {
                mapping.identifier.strategy = self.registry.entity_strategy(
                    &mapping.name,
                    &strategy,
                    &mapping.table,
                    &mapping.identifier.column,
                )?;
            }
            mapping.validate()?;

            for association in &mut mapping.associations {
                if !names.contains(&association.target) {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownEntity,
                        &mapping.name,
                        format!(
                            "association '{}' targets unknown entity '{}'",
                            association.name, association.target
                        ),
                    ));
                }
                let Some(link) = &mut association.link else {
                    continue;
                };
                let role = format!("{}.{}", mapping.name, association.name);
                let Some(mut id) = link.collection_id.take() else {
                    continue;
                };
                let generator = self.registry.collection_id_generator(&role, link, &mut id)?;
                link.collection_id = Some(id);
                collection_ids.insert((mapping.name.clone(), association.name.clone()), generator);
            }

            for event in [GenerationEvent::Insert, GenerationEvent::Update] {
                let processor = GeneratedValuesProcessor::new(&mapping, event);
                if !processor.is_inert() {
                    processors.insert((mapping.name.clone(), event), Arc::new(processor));
                }
            }

            tracing::trace!(
                entity = %mapping.name,
                strategy = mapping.identifier.strategy.name(),
                "mapping registered"
            );
            let name = mapping.name.clone();
            if mappings.insert(name.clone(), Arc::new(mapping)).is_some() {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    name,
                    "entity is mapped twice",
                ));
            }
        }

        tracing::debug!(
            entities = mappings.len(),
            processors = processors.len(),
            "metamodel built"
        );
        Ok(Metamodel {
            dialect: self.dialect,
            mappings,
            processors,
            collection_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{
        AssociationMapping, AttributeMapping, GenerationTiming, IdentifierMapping,
        IdentifierStrategy, LinkTable, ValueGeneration,
    };

    fn tag() -> EntityMapping {
        EntityMapping::new(
            "Tag",
            "tags",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("label", "label"))
    }

    fn post(link: LinkTable) -> EntityMapping {
        EntityMapping::new(
            "Post",
            "posts",
            IdentifierMapping::new("id", "id", IdentifierStrategy::Assigned),
        )
        .attribute(AttributeMapping::new("title", "title"))
        .association(AssociationMapping::many_to_many("tags", "Tag", link))
    }

    #[test]
    fn test_build_resolves_strategies_and_processors() {
        let metamodel = Metamodel::builder(Dialect::Postgres)
            .entity(tag().attribute(AttributeMapping::new("created", "created").generated(
                ValueGeneration::database(GenerationTiming::Insert, false, None),
            )))
            .entity_with_strategy(
                post(LinkTable::new("post_tags", "post_id", "tag_id")),
                "native",
            )
            .build()
            .unwrap();

        assert_eq!(metamodel.entity_names(), vec!["Post", "Tag"]);
        let post = metamodel.mapping("Post").unwrap();
        assert_eq!(post.identifier.strategy.name(), "sequence");
        assert!(metamodel.processor("Tag", GenerationEvent::Insert).is_some());
        assert!(metamodel.processor("Tag", GenerationEvent::Update).is_none());
        assert!(metamodel.processor("Post", GenerationEvent::Insert).is_none());

        let err = metamodel.mapping("Comment").unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnknownEntity));
    }

    #[test]
    fn test_unknown_association_target_fails() {
        let err = Metamodel::builder(Dialect::Postgres)
            .entity(post(LinkTable::new("post_tags", "post_id", "tag_id")))
            .build()
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnknownEntity));
    }

    #[test]
    fn test_collection_id_generator_resolved_at_build() {
        let metamodel = Metamodel::builder(Dialect::Postgres)
            .entity(tag())
            .entity(post(
                LinkTable::new("post_tags", "post_id", "tag_id").with_collection_id("row_id", "uuid"),
            ))
            .build()
            .unwrap();

        assert_eq!(
            metamodel
                .collection_id_generator("Post", "tags")
                .map(|g| g.name().to_string()),
            Some("uuid".to_string())
        );
        let link = metamodel.mapping("Post").unwrap().associations[0]
            .link
            .clone()
            .unwrap();
        assert_eq!(
            link.collection_id.unwrap().generator_name.as_deref(),
            Some("uuid")
        );
    }

    #[test]
    fn test_identity_collection_id_rejected_at_build() {
        let err = Metamodel::builder(Dialect::Postgres)
            .entity(tag())
            .entity(post(
                LinkTable::new("post_tags", "post_id", "tag_id")
                    .with_collection_id("row_id", "identity"),
            ))
            .build()
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::UnsupportedStrategy));
        assert!(err.to_string().contains("IDENTITY generation not supported"));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let err = Metamodel::builder(Dialect::Sqlite)
            .entity(tag())
            .entity(tag())
            .build()
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::Invalid));
    }
}
