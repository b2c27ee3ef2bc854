use crate::logic::AttributeCatalog;
use crate::model::{ChangedAttribute, NewProcessInstance, ProcessInstance, ProcessProperty};

/// Compares a process instance against the values its template declares.
pub struct TemplateDiffEngine<'a> {
    catalog: &'a AttributeCatalog,
}

impl<'a> TemplateDiffEngine<'a> {
    pub fn new(catalog: &'a AttributeCatalog) -> Self {
        Self { catalog }
    }

    /// Attributes whose instance value differs from the template.
    ///
    /// Properties unknown to the catalog and values the template does not
    /// enforce are skipped. Empty means unchanged.
    pub fn diff(&self, property: &ProcessProperty, instance: &ProcessInstance) -> Vec<ChangedAttribute> {
        property
            .iter()
            .filter(|(_, declared)| declared.is_enforced())
            .filter_map(|(property_id, declared)| {
                let expected = declared.expected();
                let actual = instance.attribute(property_id);
                match self.catalog.values_equal(property_id, &expected, actual) {
                    Some(false) => Some(ChangedAttribute {
                        property_id: property_id.clone(),
                        property_name: self
                            .catalog
                            .get(property_id)
                            .map(|d| d.property_name.clone())
                            .unwrap_or_else(|| property_id.clone()),
                        property_value: actual.clone(),
                        template_property_value: expected,
                    }),
                    Some(true) | None => None,
                }
            })
            .collect()
    }

    /// Diff and, when anything differs, the full replacement to write back.
    ///
    /// The replacement carries exactly the attributes the template declares.
    /// Enforced ones take the template value; the rest keep the instance's
    /// current value when it has one. Nothing undeclared survives.
    pub fn materialize(
        &self,
        property: &ProcessProperty,
        instance: &ProcessInstance,
    ) -> (Vec<ChangedAttribute>, Option<NewProcessInstance>) {
        let changed = self.diff(property, instance);
        if changed.is_empty() {
            return (changed, None);
        }
        let mut target = NewProcessInstance::from_template(Some(property));
        for (property_id, declared) in property.iter().filter(|(_, d)| !d.is_enforced()) {
            if let Some(current) = instance.attributes.get(property_id) {
                log::debug!(
                    "process {} keeps its own value for unenforced attribute {}",
                    instance.id,
                    property_id
                );
                target.attributes.insert(property_id.clone(), current.clone());
            } else {
                target
                    .attributes
                    .insert(property_id.clone(), declared.expected());
            }
        }
        (changed, Some(target))
    }
}
