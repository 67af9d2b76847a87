//! Compiled feature plans.
//!
//! A [`FeaturePlan`] is built once per pipeline from the reader schema and the
//! feature map. Every feature path is parsed, walked against the reader schema,
//! and type-checked, so unresolvable features fail before any file is opened.
//!
//! ## Path grammar
//!
//! | Syntax | Meaning |
//! |---|---|
//! | `name`, `a.b.c` | record field (or map entry) by name |
//! | `a[*]` | every array item, or every map value; adds one dimension |
//! | `a[3]` | one array item |
//! | `a['key']` | one map value |
//! | `a:int`, `a:Address` | select a union branch by type name |
//!
//! Nullable unions (`["null", T]`) are stepped through implicitly, and arrays
//! remaining at the end of a path are collected implicitly, each adding one
//! dimension.
//!
//! Files may carry a writer schema that differs from the reader schema, so the
//! plan is re-bound per file with [`FeaturePlan::bind`], producing a
//! [`BoundPlan`] of writer field positions plus a pruning trie that tells the
//! decoder which parts of a record to materialize.

use crate::error::{Error, Result};
use crate::features::{DType, FeatureMap, FeatureSpec};
use crate::schema::{Schema, check_compatible};
use crate::values::Values;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(\.)?([A-Za-z_][A-Za-z0-9_]*)|\[\*\]|\[(\d+)\]|\['([^']*)'\]|:([A-Za-z_][A-Za-z0-9_.]*))",
    )
    .expect("step grammar is a valid regex")
});

/// One syntactic step of a feature path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Field(String),
    Wildcard,
    Index(usize),
    Key(String),
    Branch(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Wildcard => write!(f, "[*]"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, "['{k}']"),
            Self::Branch(t) => write!(f, ":{t}"),
        }
    }
}

/// Split a feature path into steps.
///
/// # Errors
/// Returns a message pointing at the first character that does not parse.
pub fn parse_path(path: &str) -> std::result::Result<Vec<Step>, String> {
    let mut steps = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        let at = path.len() - rest.len();
        let caps = STEP
            .captures(rest)
            .ok_or_else(|| format!("invalid path '{path}' at offset {at}"))?;
        let whole = caps.get(0).map_or(0, |m| m.end());
        let step = if let Some(name) = caps.get(2) {
            let dotted = caps.get(1).is_some();
            if dotted == steps.is_empty() {
                return Err(format!("invalid path '{path}' at offset {at}"));
            }
            Step::Field(name.as_str().to_string())
        } else if let Some(index) = caps.get(3) {
            let index = index
                .as_str()
                .parse()
                .map_err(|_| format!("index out of range in path '{path}'"))?;
            Step::Index(index)
        } else if let Some(key) = caps.get(4) {
            Step::Key(key.as_str().to_string())
        } else if let Some(branch) = caps.get(5) {
            Step::Branch(branch.as_str().to_string())
        } else {
            Step::Wildcard
        };
        if steps.is_empty() && !matches!(step, Step::Field(_)) {
            return Err(format!("path '{path}' must start with a field name"));
        }
        steps.push(step);
        rest = &rest[whole..];
    }
    if steps.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(steps)
}

/// A path step resolved against the reader schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Hop {
    Field(String),
    /// Implicit step through a nullable union.
    NonNull,
    Branch { index: usize, name: String },
    EachItem,
    Item(usize),
    EachValue,
    Value(String),
}

/// Reader-schema type at the end of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Enum,
    Fixed,
}

impl Source {
    /// Whether values of this type may be emitted as `dtype`.
    #[must_use]
    pub fn coerces_to(self, dtype: DType) -> bool {
        matches!(
            (self, dtype),
            (Self::Boolean, DType::Bool)
                | (Self::Int, DType::Int32 | DType::Int64)
                | (Self::Long, DType::Int64)
                | (Self::Float, DType::Float32 | DType::Float64)
                | (Self::Double, DType::Float64)
                | (Self::Bytes | Self::String | Self::Enum | Self::Fixed, DType::String)
        )
    }
}

/// A feature path resolved against the reader schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuePath {
    pub text: String,
    pub hops: Vec<Hop>,
    /// Number of collecting hops (`[*]` and implicit arrays).
    pub dims: usize,
    pub source: Source,
}

impl ValuePath {
    /// Resolve `text` against `reader`.
    ///
    /// # Errors
    /// Returns a message if the path does not parse, names a missing field,
    /// applies a step to the wrong kind of node, or ends at a non-primitive.
    pub fn resolve(reader: &Schema, text: &str) -> std::result::Result<Self, String> {
        let steps = parse_path(text)?;
        let mut hops = Vec::new();
        let mut dims = 0;
        let mut node = reader;
        for step in &steps {
            if !matches!(step, Step::Branch(_)) {
                node = step_through_nullable(node, &mut hops);
            }
            node = match (step, node) {
                (Step::Field(name), Schema::Record(record)) => {
                    let index = record.field_index(name).ok_or_else(|| {
                        format!("'{text}': record {} has no field '{name}'", record.name)
                    })?;
                    hops.push(Hop::Field(name.clone()));
                    &record.fields[index].schema
                }
                (Step::Field(name) | Step::Key(name), Schema::Map(values)) => {
                    hops.push(Hop::Value(name.clone()));
                    values
                }
                (Step::Wildcard, Schema::Array(items)) => {
                    hops.push(Hop::EachItem);
                    dims += 1;
                    items
                }
                (Step::Wildcard, Schema::Map(values)) => {
                    hops.push(Hop::EachValue);
                    dims += 1;
                    values
                }
                (Step::Index(i), Schema::Array(items)) => {
                    hops.push(Hop::Item(*i));
                    items
                }
                (Step::Branch(name), Schema::Union(branches)) => {
                    let index = branches
                        .iter()
                        .position(|b| b.matches_branch(name))
                        .ok_or_else(|| format!("'{text}': union {node} has no branch '{name}'"))?;
                    hops.push(Hop::Branch {
                        index,
                        name: name.clone(),
                    });
                    &branches[index]
                }
                (step, node) => {
                    return Err(format!("'{text}': step '{step}' cannot be applied to {node}"));
                }
            };
        }
        loop {
            node = step_through_nullable(node, &mut hops);
            let Schema::Array(items) = node else { break };
            hops.push(Hop::EachItem);
            dims += 1;
            node = items;
        }
        let source = match node {
            Schema::Boolean => Source::Boolean,
            Schema::Int => Source::Int,
            Schema::Long => Source::Long,
            Schema::Float => Source::Float,
            Schema::Double => Source::Double,
            Schema::Bytes => Source::Bytes,
            Schema::String => Source::String,
            Schema::Enum { .. } => Source::Enum,
            Schema::Fixed { .. } => Source::Fixed,
            Schema::Union(_) => {
                return Err(format!(
                    "'{text}' ends at union {node}; select a branch with ':type'"
                ));
            }
            other => return Err(format!("'{text}' ends at {other}, not a primitive value")),
        };
        Ok(Self {
            text: text.to_string(),
            hops,
            dims,
            source,
        })
    }

    fn top_field(&self) -> Option<&str> {
        match self.hops.first() {
            Some(Hop::Field(name)) => Some(name),
            _ => None,
        }
    }
}

fn step_through_nullable<'s>(node: &'s Schema, hops: &mut Vec<Hop>) -> &'s Schema {
    match (node, node.nullable_branch()) {
        (Schema::Union(branches), Some(index)) => {
            hops.push(Hop::NonNull);
            &branches[index]
        }
        _ => node,
    }
}

/// How one feature is extracted.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureKind {
    Dense {
        path: ValuePath,
        shape: Vec<usize>,
        /// One element (broadcast) or `product(shape)` elements.
        default: Option<Values>,
    },
    Sparse {
        indices: Vec<ValuePath>,
        values: ValuePath,
        dense_size: Vec<usize>,
    },
    VarLen {
        path: ValuePath,
        rank: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFeature {
    pub name: String,
    pub dtype: DType,
    pub kind: FeatureKind,
}

impl CompiledFeature {
    /// All paths of this feature; for sparse features the value path is last.
    #[must_use]
    pub fn paths(&self) -> Vec<&ValuePath> {
        match &self.kind {
            FeatureKind::Dense { path, .. } | FeatureKind::VarLen { path, .. } => vec![path],
            FeatureKind::Sparse {
                indices, values, ..
            } => indices.iter().chain(std::iter::once(values)).collect(),
        }
    }
}

/// Immutable extraction plan shared by every parser of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePlan {
    reader_schema: Arc<Schema>,
    features: Vec<CompiledFeature>,
}

impl FeaturePlan {
    /// Compile `features` against `reader_schema`.
    ///
    /// # Errors
    /// `Config` for an empty feature map, an unresolvable path, a dimension
    /// count that does not match the declared shape or rank, a type that cannot
    /// be coerced to the declared dtype, or a malformed default value.
    pub fn compile(reader_schema: Arc<Schema>, features: &FeatureMap) -> Result<Self> {
        if features.is_empty() {
            return Err(Error::config("feature map is empty"));
        }
        if !matches!(*reader_schema, Schema::Record(_)) {
            return Err(Error::config(format!(
                "reader schema must be a record, found {reader_schema}"
            )));
        }
        let compiled = features
            .iter()
            .map(|(name, spec)| {
                compile_feature(&reader_schema, name, spec)
                    .map_err(|e| Error::config(format!("feature '{name}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let plan = Self {
            reader_schema,
            features: compiled,
        };
        plan.warn_unused_columns();
        debug!(features = plan.features.len(), "compiled feature plan");
        Ok(plan)
    }

    fn warn_unused_columns(&self) {
        let Schema::Record(record) = &*self.reader_schema else {
            return;
        };
        let used: BTreeSet<&str> = self
            .features
            .iter()
            .flat_map(CompiledFeature::paths)
            .filter_map(ValuePath::top_field)
            .collect();
        for field in &record.fields {
            if !used.contains(field.name.as_str()) {
                warn!(column = %field.name, "reader schema column is not used by any feature");
            }
        }
    }

    #[must_use]
    pub fn features(&self) -> &[CompiledFeature] {
        &self.features
    }

    #[must_use]
    pub fn reader_schema(&self) -> &Arc<Schema> {
        &self.reader_schema
    }

    /// Bind this plan to the writer schema of the file at `path`.
    ///
    /// # Errors
    /// `SchemaMismatch` if the writer schema cannot be read through the reader
    /// schema or a feature path cannot be followed in it.
    pub fn bind(self: &Arc<Self>, writer: Arc<Schema>, path: &Path) -> Result<BoundPlan> {
        let same = writer == self.reader_schema;
        if !same {
            check_compatible(&writer, &self.reader_schema)
                .map_err(|e| Error::schema_mismatch(path, e))?;
        }
        let mut features = Vec::with_capacity(self.features.len());
        let mut demand = Demand::Skip;
        for (owner, feature) in self.features.iter().enumerate() {
            let mut bound = Vec::new();
            for value_path in feature.paths() {
                let steps = bind_hops(&writer, &value_path.hops).map_err(|e| {
                    Error::schema_mismatch(
                        path,
                        format!("feature '{}' path '{}': {e}", feature.name, value_path.text),
                    )
                })?;
                demand.insert(&writer, &steps, owner);
                bound.push(BoundPath {
                    steps,
                    dims: value_path.dims,
                });
            }
            features.push(bound);
        }
        Ok(BoundPlan {
            plan: Arc::clone(self),
            writer,
            features,
            demand,
        })
    }
}

fn compile_feature(
    reader: &Schema,
    name: &str,
    spec: &FeatureSpec,
) -> std::result::Result<CompiledFeature, String> {
    let dtype = spec.dtype();
    let resolve = |text: &str| ValuePath::resolve(reader, text);
    let check_coercion = |path: &ValuePath, dtype: DType| {
        if path.source.coerces_to(dtype) {
            Ok(())
        } else {
            Err(format!(
                "'{}' has type {:?} which cannot be read as {dtype}",
                path.text, path.source
            ))
        }
    };

    let kind = match spec {
        FeatureSpec::Dense {
            shape,
            default_value,
            path,
            ..
        } => {
            let path = resolve(path.as_deref().unwrap_or(name))?;
            check_coercion(&path, dtype)?;
            if path.dims != shape.len() {
                return Err(format!(
                    "'{}' yields {} dimension(s) but shape {shape:?} has {}",
                    path.text,
                    path.dims,
                    shape.len()
                ));
            }
            let default = default_value
                .as_ref()
                .map(|json| {
                    let values = Values::from_json(dtype, json)?;
                    let want: usize = shape.iter().product();
                    if values.len() == 1 || values.len() == want {
                        Ok(values)
                    } else {
                        Err(format!(
                            "default has {} values, expected 1 or {want}",
                            values.len()
                        ))
                    }
                })
                .transpose()?;
            FeatureKind::Dense {
                path,
                shape: shape.clone(),
                default,
            }
        }
        FeatureSpec::VarLen { rank, path, .. } => {
            if *rank == 0 {
                return Err("var_len rank must be at least 1".to_string());
            }
            let path = resolve(path.as_deref().unwrap_or(name))?;
            check_coercion(&path, dtype)?;
            if path.dims != *rank {
                return Err(format!(
                    "'{}' yields {} dimension(s) but rank is {rank}",
                    path.text, path.dims
                ));
            }
            FeatureKind::VarLen { path, rank: *rank }
        }
        FeatureSpec::Sparse {
            index_paths,
            value_path,
            dense_size,
            ..
        } => {
            if index_paths.is_empty() {
                return Err("sparse feature needs at least one index path".to_string());
            }
            if index_paths.len() != dense_size.len() {
                return Err(format!(
                    "{} index path(s) but dense_size {dense_size:?}",
                    index_paths.len()
                ));
            }
            let mut indices = Vec::with_capacity(index_paths.len());
            for text in index_paths {
                let path = resolve(text)?;
                check_coercion(&path, DType::Int64)?;
                indices.push(path);
            }
            let values = resolve(value_path)?;
            check_coercion(&values, dtype)?;
            for path in indices.iter().chain(std::iter::once(&values)) {
                if path.dims != 1 {
                    return Err(format!(
                        "'{}' yields {} dimension(s); sparse paths must yield exactly one",
                        path.text, path.dims
                    ));
                }
            }
            FeatureKind::Sparse {
                indices,
                values,
                dense_size: dense_size.clone(),
            }
        }
    };
    Ok(CompiledFeature {
        name: name.to_string(),
        dtype,
        kind,
    })
}

// ============================================================================
// Binding to a writer schema
// ============================================================================

/// A path step bound to writer-schema positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundStep {
    /// Writer record field position.
    Field(usize),
    /// Writer union branch; any other branch means the value is absent.
    Branch(usize),
    EachItem,
    Item(usize),
    EachValue,
    Value(String),
    /// The rest of the path does not exist in the writer schema.
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundPath {
    pub steps: Vec<BoundStep>,
    pub dims: usize,
}

fn bind_hops(writer: &Schema, hops: &[Hop]) -> std::result::Result<Vec<BoundStep>, String> {
    let mut steps = Vec::with_capacity(hops.len());
    let mut node = writer;
    for hop in hops {
        node = match (hop, node) {
            (Hop::Field(name), Schema::Record(record)) => match record.field_index(name) {
                Some(i) => {
                    steps.push(BoundStep::Field(i));
                    &record.fields[i].schema
                }
                None => {
                    steps.push(BoundStep::Absent);
                    return Ok(steps);
                }
            },
            (Hop::NonNull, Schema::Union(branches)) => {
                let Some(i) = node.nullable_branch() else {
                    return Err(format!("writer union {node} is not nullable"));
                };
                steps.push(BoundStep::Branch(i));
                &branches[i]
            }
            (Hop::Branch { index, name }, Schema::Union(branches)) => {
                let Some(i) = branches
                    .iter()
                    .position(|b| b.matches_branch(name))
                    .or((*index < branches.len()).then_some(*index))
                else {
                    return Err(format!("writer union {node} has no branch '{name}'"));
                };
                steps.push(BoundStep::Branch(i));
                &branches[i]
            }
            // Plain writer type read through a reader union.
            (Hop::NonNull, other) => other,
            (Hop::Branch { name, .. }, other) => {
                if !other.matches_branch(name) {
                    steps.push(BoundStep::Absent);
                    return Ok(steps);
                }
                other
            }
            (Hop::EachItem, Schema::Array(items)) => {
                steps.push(BoundStep::EachItem);
                items
            }
            (Hop::Item(i), Schema::Array(items)) => {
                steps.push(BoundStep::Item(*i));
                items
            }
            (Hop::EachValue, Schema::Map(values)) => {
                steps.push(BoundStep::EachValue);
                values
            }
            (Hop::Value(key), Schema::Map(values)) => {
                steps.push(BoundStep::Value(key.clone()));
                values
            }
            (hop, node) => return Err(format!("cannot follow {hop:?} into writer type {node}")),
        };
    }
    Ok(steps)
}

/// Which parts of a writer datum must be materialized. Every non-skipped
/// node remembers the first feature that needed it, for error attribution.
#[derive(Debug, Clone, PartialEq)]
pub enum Demand {
    Skip,
    Full(usize),
    Record { fields: Vec<Demand>, owner: usize },
    Array { items: Box<Demand>, owner: usize },
    Map { values: Box<Demand>, owner: usize },
    Union { branches: Vec<Demand>, owner: usize },
}

impl Demand {
    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        match self {
            Self::Skip => None,
            Self::Full(owner)
            | Self::Record { owner, .. }
            | Self::Array { owner, .. }
            | Self::Map { owner, .. }
            | Self::Union { owner, .. } => Some(*owner),
        }
    }

    fn insert(&mut self, schema: &Schema, steps: &[BoundStep], owner: usize) {
        if matches!(self, Self::Full(_)) {
            return;
        }
        let Some((step, rest)) = steps.split_first() else {
            *self = Self::Full(self.owner().unwrap_or(owner));
            return;
        };
        let owner = self.owner().unwrap_or(owner);
        match (step, schema) {
            (BoundStep::Absent, _) => {}
            (BoundStep::Field(i), Schema::Record(record)) => {
                if !matches!(self, Self::Record { .. }) {
                    *self = Self::Record {
                        fields: vec![Self::Skip; record.fields.len()],
                        owner,
                    };
                }
                if let Self::Record { fields, .. } = self {
                    fields[*i].insert(&record.fields[*i].schema, rest, owner);
                }
            }
            (BoundStep::Branch(b), Schema::Union(branches)) => {
                if !matches!(self, Self::Union { .. }) {
                    *self = Self::Union {
                        branches: vec![Self::Skip; branches.len()],
                        owner,
                    };
                }
                if let Self::Union { branches: demands, .. } = self {
                    demands[*b].insert(&branches[*b], rest, owner);
                }
            }
            (BoundStep::EachItem | BoundStep::Item(_), Schema::Array(items)) => {
                if !matches!(self, Self::Array { .. }) {
                    *self = Self::Array {
                        items: Box::new(Self::Skip),
                        owner,
                    };
                }
                if let Self::Array { items: demand, .. } = self {
                    demand.insert(items, rest, owner);
                }
            }
            (BoundStep::EachValue | BoundStep::Value(_), Schema::Map(values)) => {
                if !matches!(self, Self::Map { .. }) {
                    *self = Self::Map {
                        values: Box::new(Self::Skip),
                        owner,
                    };
                }
                if let Self::Map { values: demand, .. } = self {
                    demand.insert(values, rest, owner);
                }
            }
            // Steps were bound against this schema, so shapes always agree.
            _ => *self = Self::Full(owner),
        }
    }
}

/// A [`FeaturePlan`] bound to one writer schema.
#[derive(Debug, Clone)]
pub struct BoundPlan {
    plan: Arc<FeaturePlan>,
    writer: Arc<Schema>,
    /// Per feature, its bound paths in [`CompiledFeature::paths`] order.
    features: Vec<Vec<BoundPath>>,
    demand: Demand,
}

impl BoundPlan {
    #[must_use]
    pub fn plan(&self) -> &Arc<FeaturePlan> {
        &self.plan
    }

    #[must_use]
    pub fn writer_schema(&self) -> &Arc<Schema> {
        &self.writer
    }

    #[must_use]
    pub fn demand(&self) -> &Demand {
        &self.demand
    }

    #[must_use]
    pub fn feature_paths(&self, feature: usize) -> &[BoundPath] {
        &self.features[feature]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const READER: &str = r#"{
        "type": "record", "name": "Example",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "score", "type": ["null", "float"], "default": null},
            {"name": "tokens", "type": {"type": "array", "items": "string"}},
            {"name": "grid", "type": {"type": "array", "items": {"type": "array", "items": "int"}}},
            {"name": "attrs", "type": {"type": "map", "values": "double"}},
            {"name": "choice", "type": ["int", "string"]},
            {"name": "items", "type": {"type": "array", "items": {
                "type": "record", "name": "Item",
                "fields": [{"name": "sku", "type": "long"}, {"name": "price", "type": "float"}]
            }}}
        ]
    }"#;

    fn reader() -> Arc<Schema> {
        Arc::new(Schema::parse_str(READER).unwrap())
    }

    #[test]
    fn parses_path_grammar() {
        assert_eq!(
            parse_path("items[*].price").unwrap(),
            vec![
                Step::Field("items".into()),
                Step::Wildcard,
                Step::Field("price".into())
            ]
        );
        assert_eq!(
            parse_path("attrs['a.b'][2]:string").unwrap(),
            vec![
                Step::Field("attrs".into()),
                Step::Key("a.b".into()),
                Step::Index(2),
                Step::Branch("string".into())
            ]
        );
        assert!(parse_path("").is_err());
        assert!(parse_path(".x").is_err());
        assert!(parse_path("a b").is_err());
        assert!(parse_path("[*]").is_err());
        assert!(parse_path("ab").is_ok());
    }

    #[test]
    fn resolves_dimensions_and_sources() {
        let schema = reader();
        let p = ValuePath::resolve(&schema, "tokens").unwrap();
        assert_eq!((p.dims, p.source), (1, Source::String));
        let p = ValuePath::resolve(&schema, "grid").unwrap();
        assert_eq!(p.dims, 2);
        let p = ValuePath::resolve(&schema, "grid[0]").unwrap();
        assert_eq!(p.dims, 1);
        let p = ValuePath::resolve(&schema, "score").unwrap();
        assert_eq!(p.hops, vec![Hop::Field("score".into()), Hop::NonNull]);
        let p = ValuePath::resolve(&schema, "attrs['x']").unwrap();
        assert_eq!((p.dims, p.source), (0, Source::Double));
        let p = ValuePath::resolve(&schema, "attrs[*]").unwrap();
        assert_eq!(p.dims, 1);
        let p = ValuePath::resolve(&schema, "items[*].sku").unwrap();
        assert_eq!((p.dims, p.source), (1, Source::Long));
        assert!(ValuePath::resolve(&schema, "choice").is_err());
        assert_eq!(
            ValuePath::resolve(&schema, "choice:string").unwrap().source,
            Source::String
        );
        assert!(ValuePath::resolve(&schema, "missing").is_err());
        assert!(ValuePath::resolve(&schema, "id[*]").is_err());
        assert!(ValuePath::resolve(&schema, "items").is_err());
    }

    fn features(specs: serde_json::Value) -> FeatureMap {
        serde_json::from_value(specs).unwrap()
    }

    #[test]
    fn compile_checks_shapes_types_and_defaults() {
        let ok = features(json!({
            "id": {"kind": "dense", "dtype": "int64", "shape": []},
            "score": {"kind": "dense", "dtype": "float64", "shape": [], "default_value": -1.0},
            "tokens": {"kind": "var_len", "dtype": "string", "rank": 1},
            "basket": {"kind": "sparse", "dtype": "float32", "index_paths": ["items[*].sku"],
                       "value_path": "items[*].price", "dense_size": [1000]}
        }));
        let plan = FeaturePlan::compile(reader(), &ok).unwrap();
        assert_eq!(plan.features().len(), 4);
        // BTreeMap order.
        assert_eq!(plan.features()[0].name, "basket");

        for bad in [
            json!({"id": {"kind": "dense", "dtype": "int32", "shape": []}}),
            json!({"tokens": {"kind": "dense", "dtype": "string", "shape": []}}),
            json!({"tokens": {"kind": "var_len", "dtype": "string", "rank": 2}}),
            json!({"id": {"kind": "dense", "dtype": "int64", "shape": [], "default_value": "x"}}),
            json!({"grid": {"kind": "dense", "dtype": "int32", "shape": [2, 2], "default_value": [1, 2, 3]}}),
            json!({"s": {"kind": "sparse", "dtype": "float32", "index_paths": ["items[*].price"],
                         "value_path": "items[*].price", "dense_size": [10]}}),
            json!({"nope": {"kind": "var_len", "dtype": "int64", "rank": 1}}),
        ] {
            let err = FeaturePlan::compile(reader(), &features(bad.clone())).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Config, "{bad}");
        }
        assert!(FeaturePlan::compile(reader(), &FeatureMap::new()).is_err());
    }

    #[test]
    fn binding_to_identical_schema_prunes_unused_fields() {
        let plan = Arc::new(
            FeaturePlan::compile(
                reader(),
                &features(json!({"id": {"kind": "dense", "dtype": "int64", "shape": []}})),
            )
            .unwrap(),
        );
        let bound = plan.bind(reader(), Path::new("f.avro")).unwrap();
        let Demand::Record { fields, .. } = bound.demand() else {
            panic!("expected record demand");
        };
        assert_eq!(fields[0], Demand::Full(0));
        assert!(fields[1..].iter().all(|d| *d == Demand::Skip));
    }

    #[test]
    fn binding_to_older_writer_marks_missing_fields_absent() {
        let writer = Arc::new(
            Schema::parse_str(
                r#"{"type":"record","name":"Example","fields":[
                    {"name":"extra","type":"string"},
                    {"name":"id","type":"int"}]}"#,
            )
            .unwrap(),
        );
        let reader = Arc::new(
            Schema::parse_str(
                r#"{"type":"record","name":"Example","fields":[
                    {"name":"id","type":"long"},
                    {"name":"score","type":["null","float"],"default":null}]}"#,
            )
            .unwrap(),
        );
        let plan = Arc::new(
            FeaturePlan::compile(
                reader,
                &features(json!({
                    "id": {"kind": "dense", "dtype": "int64", "shape": []},
                    "score": {"kind": "dense", "dtype": "float32", "shape": [], "default_value": 0.0}
                })),
            )
            .unwrap(),
        );
        let bound = plan.bind(writer, Path::new("old.avro")).unwrap();
        assert_eq!(bound.feature_paths(0)[0].steps, vec![BoundStep::Field(1)]);
        assert_eq!(bound.feature_paths(1)[0].steps, vec![BoundStep::Absent]);
    }

    #[test]
    fn binding_rejects_incompatible_writer() {
        let writer = Arc::new(
            Schema::parse_str(r#"{"type":"record","name":"Example","fields":[{"name":"id","type":"string"}]}"#)
                .unwrap(),
        );
        let plan = Arc::new(
            FeaturePlan::compile(
                reader(),
                &features(json!({"id": {"kind": "dense", "dtype": "int64", "shape": []}})),
            )
            .unwrap(),
        );
        let err = plan.bind(writer, Path::new("bad.avro")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SchemaMismatch);
        assert_eq!(err.path(), Some(Path::new("bad.avro")));
    }
}
