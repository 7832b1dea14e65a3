//! Column names and declared types of tables and plan nodes

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::DataType;

/// A named, typed column slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Name of the field
    pub name: String,

    /// Declared element type
    pub data_type: DataType,
}

impl Field {
    /// Create a new field
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Get the name of this field
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the data type of this field
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type)
    }
}

/// Ordered list of fields with unique names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Field>", into = "Vec<Field>")]
pub struct Schema {
    fields: Vec<Field>,
    field_indices: HashMap<String, usize>,
}

/// Shared schema handle
pub type SchemaRef = Arc<Schema>;

impl Schema {
    /// Create a new schema, rejecting duplicate names
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut field_indices = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if field_indices.insert(field.name.clone(), i).is_some() {
                return Err(Error::SchemaMismatch(format!(
                    "duplicate column name '{}'",
                    field.name
                )));
            }
        }
        Ok(Self {
            fields,
            field_indices,
        })
    }

    /// Schema with no fields
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            field_indices: HashMap::new(),
        }
    }

    /// Get all fields in this schema
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get a field by index
    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    /// Get a field by name
    pub fn field_by_name(&self, name: &str) -> Result<&Field> {
        let index = self.index_of(name)?;
        Ok(&self.fields[index])
    }

    /// Get the index of a field by name
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.field_indices
            .get(name)
            .copied()
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// Check if a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.field_indices.contains_key(name)
    }

    /// Field names in order
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Get the number of fields in this schema
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if this schema is empty
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a projection of this schema with only the specified field names
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let fields = names
            .iter()
            .map(|name| self.field_by_name(name.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;
        Self::new(fields)
    }

    /// Whether two schemas have the same names and types in the same order
    pub fn same_shape(&self, other: &Schema) -> bool {
        self.fields == other.fields
    }
}

impl TryFrom<Vec<Field>> for Schema {
    type Error = Error;

    fn try_from(fields: Vec<Field>) -> Result<Self> {
        Schema::new(fields)
    }
}

impl From<Schema> for Vec<Field> {
    fn from(schema: Schema) -> Self {
        schema.fields
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.same_shape(other)
    }
}

impl Eq for Schema {}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, "]")
    }
}
