//! Compiled Avro schema trees.
//!
//! Schema JSON is first validated with the `apache-avro` parser, then compiled
//! into the small [`Schema`] tree below, which is what the block reader, the
//! binary decoder, and the feature planner traverse. Named types are inlined at
//! every reference, so the tree has no indirection.
//!
//! This module also decides whether a writer schema (from a file header) can be
//! read through a reader schema; see [`check_compatible`].

use apache_avro::schema_compatibility::SchemaCompatibility;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A node of a compiled schema tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Array(Box<Schema>),
    Map(Box<Schema>),
    Union(Vec<Schema>),
    Record(Arc<RecordSchema>),
    Enum { name: String, symbols: Vec<String> },
    Fixed { name: String, size: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<Field>,
    /// The `apache-avro` form, kept on the root record of a parsed schema.
    source: Option<Arc<apache_avro::Schema>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub default: Option<Value>,
}

impl RecordSchema {
    /// Position of the field called `name`.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl Schema {
    /// Parse and compile a schema from its JSON text.
    ///
    /// # Errors
    /// Returns a message describing why the schema is invalid.
    pub fn parse_str(json: &str) -> Result<Self, String> {
        let avro =
            apache_avro::Schema::parse_str(json).map_err(|e| format!("invalid Avro schema: {e}"))?;
        let value: Value =
            serde_json::from_str(json).map_err(|e| format!("invalid schema JSON: {e}"))?;
        let mut compiler = Compiler::default();
        let mut schema = compiler.compile(&value, None)?;
        if let Self::Record(record) = &mut schema {
            Arc::make_mut(record).source = Some(Arc::new(avro));
        }
        Ok(schema)
    }

    /// The `apache-avro` schema this tree was compiled from, for root records
    /// built by [`Schema::parse_str`].
    #[must_use]
    pub fn avro(&self) -> Option<&apache_avro::Schema> {
        match self {
            Self::Record(record) => record.source.as_deref(),
            _ => None,
        }
    }

    /// Short type name used in messages and for `:type` union branch selection.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bytes => "bytes",
            Self::String => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Union(_) => "union",
            Self::Record(r) => &r.name,
            Self::Enum { name, .. } | Self::Fixed { name, .. } => name,
        }
    }

    /// Whether `name` selects this node as a union branch. Named types match
    /// either their full name or their unqualified name.
    #[must_use]
    pub fn matches_branch(&self, name: &str) -> bool {
        let full = self.type_name();
        full == name || full.rsplit('.').next() == Some(name)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// For a union with exactly one non-null branch, that branch's index.
    #[must_use]
    pub fn nullable_branch(&self) -> Option<usize> {
        let Self::Union(branches) = self else {
            return None;
        };
        let mut non_null = branches.iter().enumerate().filter(|(_, b)| !b.is_null());
        match (non_null.next(), non_null.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(items) => write!(f, "array<{items}>"),
            Self::Map(values) => write!(f, "map<{values}>"),
            Self::Union(branches) => {
                write!(f, "[")?;
                for (i, b) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{b}")?;
                }
                write!(f, "]")
            }
            other => f.write_str(other.type_name()),
        }
    }
}

#[derive(Default)]
struct Compiler {
    named: HashMap<String, Schema>,
    in_progress: Vec<String>,
}

impl Compiler {
    fn compile(&mut self, value: &Value, namespace: Option<&str>) -> Result<Schema, String> {
        match value {
            Value::String(name) => self.named_or_primitive(name, namespace),
            Value::Array(branches) => branches
                .iter()
                .map(|b| self.compile(b, namespace))
                .collect::<Result<Vec<_>, _>>()
                .map(Schema::Union),
            Value::Object(obj) => self.compile_object(obj, namespace),
            other => Err(format!("unexpected schema value: {other}")),
        }
    }

    fn named_or_primitive(&self, name: &str, namespace: Option<&str>) -> Result<Schema, String> {
        if let Some(p) = primitive(name) {
            return Ok(p);
        }
        let full = full_name(name, namespace);
        if self.in_progress.contains(&full) {
            return Err(format!("recursive type '{full}' is not supported"));
        }
        self.named
            .get(&full)
            .or_else(|| self.named.get(name))
            .cloned()
            .ok_or_else(|| format!("unknown type '{name}'"))
    }

    fn compile_object(
        &mut self,
        obj: &Map<String, Value>,
        namespace: Option<&str>,
    ) -> Result<Schema, String> {
        let ty = obj.get("type").ok_or("schema object without 'type'")?;
        let Value::String(ty) = ty else {
            // e.g. {"type": {"type": "array", ...}}
            return self.compile(ty, namespace);
        };
        match ty.as_str() {
            "record" | "error" => {
                let (full, ns) = self.declare(obj, namespace)?;
                let fields = obj
                    .get("fields")
                    .and_then(Value::as_array)
                    .ok_or_else(|| format!("record '{full}' without fields"))?;
                let mut compiled = Vec::with_capacity(fields.len());
                for field in fields {
                    let name = field
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| format!("field without name in '{full}'"))?;
                    let schema = field
                        .get("type")
                        .ok_or_else(|| format!("field '{name}' without type"))?;
                    compiled.push(Field {
                        name: name.to_string(),
                        schema: self.compile(schema, ns.as_deref())?,
                        default: field.get("default").cloned(),
                    });
                }
                let schema = Schema::Record(Arc::new(RecordSchema {
                    name: full.clone(),
                    fields: compiled,
                    source: None,
                }));
                self.finish(full, &schema);
                Ok(schema)
            }
            "enum" => {
                let (full, _) = self.declare(obj, namespace)?;
                let symbols = obj
                    .get("symbols")
                    .and_then(Value::as_array)
                    .ok_or_else(|| format!("enum '{full}' without symbols"))?
                    .iter()
                    .map(|s| s.as_str().map(str::to_string).ok_or("non-string enum symbol"))
                    .collect::<Result<Vec<_>, _>>()?;
                let schema = Schema::Enum {
                    name: full.clone(),
                    symbols,
                };
                self.finish(full, &schema);
                Ok(schema)
            }
            "fixed" => {
                let (full, _) = self.declare(obj, namespace)?;
                let size = obj
                    .get("size")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| format!("fixed '{full}' without size"))?;
                let schema = Schema::Fixed {
                    name: full.clone(),
                    size: usize::try_from(size).map_err(|e| e.to_string())?,
                };
                self.finish(full, &schema);
                Ok(schema)
            }
            "array" => {
                let items = obj.get("items").ok_or("array without 'items'")?;
                Ok(Schema::Array(Box::new(self.compile(items, namespace)?)))
            }
            "map" => {
                let values = obj.get("values").ok_or("map without 'values'")?;
                Ok(Schema::Map(Box::new(self.compile(values, namespace)?)))
            }
            // Primitives, possibly annotated with a logical type.
            other => self.named_or_primitive(other, namespace),
        }
    }

    fn declare(
        &mut self,
        obj: &Map<String, Value>,
        namespace: Option<&str>,
    ) -> Result<(String, Option<String>), String> {
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or("named type without 'name'")?;
        let ns = obj.get("namespace").and_then(Value::as_str).or(namespace);
        let full = full_name(name, ns);
        let own_ns = full.rsplit_once('.').map(|(ns, _)| ns.to_string());
        self.in_progress.push(full.clone());
        Ok((full, own_ns))
    }

    fn finish(&mut self, full: String, schema: &Schema) {
        self.in_progress.retain(|n| n != &full);
        self.named.insert(full, schema.clone());
    }
}

fn primitive(name: &str) -> Option<Schema> {
    Some(match name {
        "null" => Schema::Null,
        "boolean" => Schema::Boolean,
        "int" => Schema::Int,
        "long" => Schema::Long,
        "float" => Schema::Float,
        "double" => Schema::Double,
        "bytes" => Schema::Bytes,
        "string" => Schema::String,
        _ => return None,
    })
}

fn full_name(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !name.contains('.') && !ns.is_empty() => format!("{ns}.{name}"),
        _ => name.to_string(),
    }
}

/// Check that data written with `writer` can be decoded through `reader`,
/// following Avro schema resolution (`apache-avro`'s compatibility checker).
///
/// Both schemas must be root records produced by [`Schema::parse_str`].
///
/// # Errors
/// Returns a message describing the first incompatibility.
pub fn check_compatible(writer: &Schema, reader: &Schema) -> Result<(), String> {
    let (Some(w), Some(r)) = (writer.avro(), reader.avro()) else {
        return Err(format!(
            "cannot resolve {writer} against {reader}: both must be records parsed from JSON"
        ));
    };
    SchemaCompatibility::can_read(w, r)
        .map_err(|e| format!("writer schema {} cannot be read as {}: {e}", writer.type_name(), reader.type_name()))
}
