//! Output field descriptors for technique records.
//!
//! Record types serialize through serde; a [`RecordSchema`] carries the column
//! metadata (names, unit tags, availability) that serde does not.

/// One named output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub unit: Option<&'static str>,
    /// Column only present on some device families; omitted from the structured
    /// form when absent.
    pub optional: bool,
}

impl Field {
    pub const fn new(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit: Some(unit),
            optional: false,
        }
    }

    pub const fn unitless(name: &'static str) -> Self {
        Self {
            name,
            unit: None,
            optional: false,
        }
    }

    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Ordered field list of a record type.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub name: &'static str,
    fields: Vec<Field>,
}

impl RecordSchema {
    pub fn new(name: &'static str, fields: &[Field]) -> Self {
        Self {
            name,
            fields: fields.to_vec(),
        }
    }

    /// Inherits `parent`'s fields; same-name fields are replaced in place.
    pub fn extend(parent: &RecordSchema, name: &'static str, fields: &[Field]) -> Self {
        let mut schema = Self {
            name,
            fields: parent.fields.clone(),
        };
        for field in fields {
            match schema.fields.iter_mut().find(|f| f.name == field.name) {
                Some(existing) => *existing = *field,
                None => schema.fields.push(*field),
            }
        }
        schema
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_replaces_and_appends() {
        let base = RecordSchema::new("Base", &[Field::new("time", "s"), Field::new("Ewe", "V")]);
        let child = RecordSchema::extend(
            &base,
            "Child",
            &[Field::new("Ewe", "mV"), Field::new("I", "A").optional()],
        );
        let names: Vec<_> = child.names().collect();
        assert_eq!(names, ["time", "Ewe", "I"]);
        assert_eq!(child.get("Ewe").unwrap().unit, Some("mV"));
        assert!(child.get("I").unwrap().optional);
    }
}
