use crate::resource::PartialResource;
use crate::schema::{FieldSpec, SchemaRegistry};

/// Decides which required field a partial resource still lacks.
///
/// Only presence is checked here; answer validity belongs to the validator.
#[derive(Debug, Clone, Copy)]
pub struct CompletenessResolver<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> CompletenessResolver<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Self { registry }
    }

    /// First required field, in declared order, that is absent or empty.
    pub fn next_missing_field(
        &self,
        resource_type: &str,
        partial: &PartialResource,
    ) -> Option<&'r FieldSpec> {
        self.missing(resource_type, partial).next()
    }

    /// Every missing required field, in declared order.
    pub fn missing_required_fields(
        &self,
        resource_type: &str,
        partial: &PartialResource,
    ) -> Vec<&'r FieldSpec> {
        self.missing(resource_type, partial).collect()
    }

    fn missing<'p>(
        &self,
        resource_type: &str,
        partial: &'p PartialResource,
    ) -> impl Iterator<Item = &'r FieldSpec> + use<'r, 'p> {
        // Unregistered types: any supplied content is taken as the resource itself.
        let generic_satisfied = !self.registry.is_registered(resource_type) && !partial.is_empty();
        self.registry
            .fields_for(resource_type)
            .iter()
            .filter(move |spec| !generic_satisfied && spec.is_required())
            .filter(move |spec| partial.is_missing(&spec.name))
    }
}
