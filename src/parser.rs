//! Record parsing: bytes in, typed feature columns out.
//!
//! Parsing runs in two phases. First the record is decoded against the writer
//! schema into a borrowed [`Datum`] tree, materializing only the parts that some
//! feature demands (everything else is skipped over). Then each feature's bound
//! path is walked over that tree, collecting leaves, checking shapes, and
//! coercing values to the feature's dtype.
//!
//! A path that runs into a null, an unselected union branch, a missing map key,
//! an out-of-range array index, or a field the writer never had yields an
//! *absent* feature: dense features fall back to their default, sparse and
//! var-len features come out empty.

use crate::error::{Error, RecordOrigin, Result};
use crate::features::DType;
use crate::io::binary::{Cursor, DecodeError, read_union_index, skip_datum};
use crate::io::interleave::RawRecord;
use crate::plan::{BoundPlan, BoundStep, Demand, FeatureKind, FeaturePlan};
use crate::schema::Schema;
use crate::values::{FeatureColumn, ParsedRecord, Values};
use std::sync::Arc;

/// A decoded value borrowing strings and bytes from the record buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum<'a> {
    /// Present in the record but not needed by any feature.
    Skipped,
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(&'a [u8]),
    String(&'a str),
    Enum(&'a str),
    Fixed(&'a [u8]),
    Array(Vec<Datum<'a>>),
    Map(Vec<(&'a str, Datum<'a>)>),
    Record(Vec<Datum<'a>>),
    Union(usize, Box<Datum<'a>>),
}

impl Datum<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "string",
            Self::Enum(_) => "enum",
            Self::Fixed(_) => "fixed",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Record(_) => "record",
            Self::Union(..) => "union",
        }
    }
}

/// Decode failure tagged with the feature whose demand was being decoded.
struct Located {
    error: DecodeError,
    owner: Option<usize>,
}

impl From<DecodeError> for Located {
    fn from(error: DecodeError) -> Self {
        Self { error, owner: None }
    }
}

fn attribute(demand: &Demand) -> impl Fn(Located) -> Located + '_ {
    move |mut located| {
        if located.owner.is_none() {
            located.owner = demand.owner();
        }
        located
    }
}

/// Decode one datum of `schema`, materializing what `demand` asks for.
fn decode<'a>(
    schema: &'a Schema,
    demand: &Demand,
    cursor: &mut Cursor<'a>,
) -> std::result::Result<Datum<'a>, Located> {
    if let Schema::Null = schema {
        return Ok(Datum::Null);
    }
    match (demand, schema) {
        (Demand::Skip, _) => {
            skip_datum(schema, cursor)?;
            Ok(Datum::Skipped)
        }
        (Demand::Full(_), _) => decode_full(schema, cursor).map_err(|e| attribute(demand)(e.into())),
        (Demand::Record { fields, .. }, Schema::Record(record)) => {
            let mut values = Vec::with_capacity(fields.len());
            for (field, field_demand) in record.fields.iter().zip(fields) {
                values.push(decode(&field.schema, field_demand, cursor).map_err(attribute(demand))?);
            }
            Ok(Datum::Record(values))
        }
        (Demand::Array { items, .. }, Schema::Array(item_schema)) => {
            let mut out = Vec::new();
            read_blocks(cursor, |c| {
                out.push(decode(item_schema, items, c)?);
                Ok(())
            })
            .map_err(attribute(demand))?;
            Ok(Datum::Array(out))
        }
        (Demand::Map { values, .. }, Schema::Map(value_schema)) => {
            let mut out = Vec::new();
            read_blocks(cursor, |c| {
                let key = c.read_str()?;
                out.push((key, decode(value_schema, values, c)?));
                Ok(())
            })
            .map_err(attribute(demand))?;
            Ok(Datum::Map(out))
        }
        (Demand::Union { branches, .. }, Schema::Union(schemas)) => {
            let branch = read_union_index(cursor, schemas.len()).map_err(|e| attribute(demand)(e.into()))?;
            let inner = decode(&schemas[branch], &branches[branch], cursor).map_err(attribute(demand))?;
            Ok(Datum::Union(branch, Box::new(inner)))
        }
        _ => Err(attribute(demand)(
            DecodeError::Internal("demand does not match writer schema").into(),
        )),
    }
}

fn read_blocks<'a>(
    cursor: &mut Cursor<'a>,
    mut item: impl FnMut(&mut Cursor<'a>) -> std::result::Result<(), Located>,
) -> std::result::Result<(), Located> {
    loop {
        let (count, _) = cursor.read_block_header()?;
        if count == 0 {
            return Ok(());
        }
        for _ in 0..count {
            item(cursor)?;
        }
    }
}

fn decode_full<'a>(schema: &'a Schema, cursor: &mut Cursor<'a>) -> std::result::Result<Datum<'a>, DecodeError> {
    Ok(match schema {
        Schema::Null => Datum::Null,
        Schema::Boolean => Datum::Boolean(cursor.read_boolean()?),
        Schema::Int => Datum::Int(cursor.read_int()?),
        Schema::Long => Datum::Long(cursor.read_long()?),
        Schema::Float => Datum::Float(cursor.read_float()?),
        Schema::Double => Datum::Double(cursor.read_double()?),
        Schema::Bytes => Datum::Bytes(cursor.read_bytes()?),
        Schema::String => Datum::String(cursor.read_str()?),
        Schema::Fixed { size, .. } => Datum::Fixed(cursor.take(*size)?),
        Schema::Enum { symbols, .. } => {
            let offset = cursor.position();
            let index = cursor.read_long()?;
            let symbol = usize::try_from(index)
                .ok()
                .and_then(|i| symbols.get(i))
                .ok_or(DecodeError::InvalidEnumIndex {
                    offset,
                    index,
                    symbols: symbols.len(),
                })?;
            Datum::Enum(symbol)
        }
        Schema::Array(items) => {
            let mut out = Vec::new();
            loop {
                let (count, _) = cursor.read_block_header()?;
                if count == 0 {
                    break;
                }
                for _ in 0..count {
                    out.push(decode_full(items, cursor)?);
                }
            }
            Datum::Array(out)
        }
        Schema::Map(values) => {
            let mut out = Vec::new();
            loop {
                let (count, _) = cursor.read_block_header()?;
                if count == 0 {
                    break;
                }
                for _ in 0..count {
                    let key = cursor.read_str()?;
                    out.push((key, decode_full(values, cursor)?));
                }
            }
            Datum::Map(out)
        }
        Schema::Union(branches) => {
            let branch = read_union_index(cursor, branches.len())?;
            Datum::Union(branch, Box::new(decode_full(&branches[branch], cursor)?))
        }
        Schema::Record(record) => Datum::Record(
            record
                .fields
                .iter()
                .map(|f| decode_full(&f.schema, cursor))
                .collect::<std::result::Result<_, _>>()?,
        ),
    })
}

// ============================================================================
// Path evaluation
// ============================================================================

/// Leaves and per-dimension lengths collected along one bound path.
struct Extraction<'d, 'a> {
    leaves: Vec<&'d Datum<'a>>,
    dims: Vec<Option<usize>>,
    /// First dimension whose length differs between visits.
    ragged: Option<usize>,
    absent: bool,
}

impl<'d, 'a> Extraction<'d, 'a> {
    fn run(datum: &'d Datum<'a>, steps: &[BoundStep], dims: usize) -> std::result::Result<Self, String> {
        let mut out = Self {
            leaves: Vec::new(),
            dims: vec![None; dims],
            ragged: None,
            absent: false,
        };
        out.walk(datum, steps, 0)?;
        Ok(out)
    }

    fn visit(&mut self, depth: usize, len: usize) {
        match self.dims.get(depth).copied().flatten() {
            None => {
                if let Some(slot) = self.dims.get_mut(depth) {
                    *slot = Some(len);
                }
            }
            Some(seen) if seen != len && self.ragged.is_none() => self.ragged = Some(depth),
            Some(_) => {}
        }
    }

    fn walk(&mut self, datum: &'d Datum<'a>, steps: &[BoundStep], depth: usize) -> std::result::Result<(), String> {
        if self.absent {
            return Ok(());
        }
        let Some((step, rest)) = steps.split_first() else {
            match datum {
                Datum::Null => self.absent = true,
                // Writer union read through a plain reader type.
                Datum::Union(_, inner) => self.walk(inner, steps, depth)?,
                leaf => self.leaves.push(leaf),
            }
            return Ok(());
        };
        match (step, datum) {
            (BoundStep::Absent, _) | (_, Datum::Null) => self.absent = true,
            (BoundStep::Field(i), Datum::Record(fields)) => {
                let field = fields.get(*i).ok_or("field position out of range")?;
                self.walk(field, rest, depth)?;
            }
            (BoundStep::Branch(b), Datum::Union(branch, inner)) => {
                if branch == b {
                    self.walk(inner, rest, depth)?;
                } else {
                    self.absent = true;
                }
            }
            (BoundStep::EachItem, Datum::Array(items)) => {
                self.visit(depth, items.len());
                for item in items {
                    self.walk(item, rest, depth + 1)?;
                }
            }
            (BoundStep::Item(i), Datum::Array(items)) => match items.get(*i) {
                Some(item) => self.walk(item, rest, depth)?,
                None => self.absent = true,
            },
            (BoundStep::EachValue, Datum::Map(entries)) => {
                self.visit(depth, entries.len());
                for (_, value) in entries {
                    self.walk(value, rest, depth + 1)?;
                }
            }
            (BoundStep::Value(key), Datum::Map(entries)) => {
                match entries.iter().find(|(k, _)| k == key) {
                    Some((_, value)) => self.walk(value, rest, depth)?,
                    None => self.absent = true,
                }
            }
            (step, datum) => {
                return Err(format!("cannot apply {step:?} to decoded {}", datum.type_name()));
            }
        }
        Ok(())
    }

    /// Lengths per dimension; dimensions never reached (under an empty outer
    /// collection) are zero.
    fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.unwrap_or(0)).collect()
    }
}

enum Coerce {
    Type(String),
}

fn push_leaf(out: &mut Values, leaf: &Datum<'_>) -> std::result::Result<(), Coerce> {
    match (out, leaf) {
        (Values::Bool(v), Datum::Boolean(b)) => v.push(*b),
        (Values::Int32(v), Datum::Int(i)) => v.push(*i),
        (Values::Int64(v), Datum::Int(i)) => v.push(i64::from(*i)),
        (Values::Int64(v), Datum::Long(l)) => v.push(*l),
        (Values::Float32(v), Datum::Float(f)) => v.push(*f),
        (Values::Float32(v), Datum::Int(i)) => v.push(*i as f32),
        (Values::Float32(v), Datum::Long(l)) => v.push(*l as f32),
        (Values::Float64(v), Datum::Float(f)) => v.push(f64::from(*f)),
        (Values::Float64(v), Datum::Double(d)) => v.push(*d),
        (Values::Float64(v), Datum::Int(i)) => v.push(f64::from(*i)),
        (Values::Float64(v), Datum::Long(l)) => v.push(*l as f64),
        (Values::String(v), Datum::String(s) | Datum::Enum(s)) => v.push((*s).to_string()),
        (Values::String(v), Datum::Bytes(b) | Datum::Fixed(b)) => match std::str::from_utf8(b) {
            Ok(s) => v.push(s.to_string()),
            Err(_) => return Err(Coerce::Type(format!("{} value is not valid UTF-8", leaf.type_name()))),
        },
        (out, leaf) => {
            return Err(Coerce::Type(format!(
                "cannot convert {} to {}",
                leaf.type_name(),
                out.dtype()
            )));
        }
    }
    Ok(())
}

fn collect(dtype: DType, leaves: &[&Datum<'_>]) -> std::result::Result<Values, Coerce> {
    let mut out = Values::with_capacity(dtype, leaves.len());
    for leaf in leaves {
        push_leaf(&mut out, leaf)?;
    }
    Ok(out)
}

// ============================================================================
// Parser
// ============================================================================

/// Executes a [`FeaturePlan`] over raw records.
///
/// Stateless apart from the shared plan, so one parser may serve many threads.
#[derive(Debug, Clone)]
pub struct Parser {
    plan: Arc<FeaturePlan>,
}

impl Parser {
    #[must_use]
    pub fn new(plan: Arc<FeaturePlan>) -> Self {
        Self { plan }
    }

    #[must_use]
    pub fn plan(&self) -> &Arc<FeaturePlan> {
        &self.plan
    }

    /// Parse one record handed over by the record stream.
    ///
    /// # Errors
    /// See [`Parser::parse_bytes`].
    pub fn parse(&self, record: &RawRecord) -> Result<ParsedRecord> {
        self.parse_bytes(record.bound(), record.bytes(), record.origin())
    }

    /// Parse the encoded record `bytes` written with `bound`'s writer schema.
    ///
    /// # Errors
    /// - `Parse` for undecodable bytes or a dense feature with no value and no default
    /// - `Type` for a value that cannot be converted to the feature dtype
    /// - `Shape` for a dense shape mismatch, non-uniform var-len nesting, or
    ///   sparse paths of unequal length
    pub fn parse_bytes(&self, bound: &BoundPlan, bytes: &[u8], origin: RecordOrigin) -> Result<ParsedRecord> {
        let features = self.plan.features();
        let feature_name = |owner: Option<usize>| {
            owner
                .and_then(|i| features.get(i))
                .map_or("<record>", |f| f.name.as_str())
        };

        let mut cursor = Cursor::new(bytes);
        let datum = decode(bound.writer_schema(), bound.demand(), &mut cursor)
            .map_err(|e| Error::parse(&origin, feature_name(e.owner), e.error.to_string()))?;
        if !cursor.is_at_end() {
            return Err(Error::parse(
                &origin,
                feature_name(bound.demand().owner()),
                format!("{} trailing bytes after record", cursor.remaining()),
            ));
        }

        let mut columns = Vec::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            let name = feature.name.as_str();
            let paths = bound.feature_paths(i);
            let mut extractions = Vec::with_capacity(paths.len());
            for path in paths {
                extractions.push(
                    Extraction::run(&datum, &path.steps, path.dims)
                        .map_err(|e| Error::parse(&origin, name, e))?,
                );
            }
            let coerce = |dtype: DType, leaves: &[&Datum<'_>]| {
                collect(dtype, leaves).map_err(|Coerce::Type(m)| Error::type_error(&origin, name, m))
            };

            let column = match &feature.kind {
                FeatureKind::Dense { shape, default, .. } => {
                    let ex = &extractions[0];
                    if ex.absent {
                        if default.is_none() {
                            return Err(Error::parse(&origin, name, "value is missing and the feature has no default"));
                        }
                        FeatureColumn::DenseDefault
                    } else {
                        let want: usize = shape.iter().product();
                        if ex.ragged.is_some() || ex.leaves.len() != want || ex.shape() != *shape {
                            return Err(Error::shape(
                                &origin,
                                name,
                                format!(
                                    "expected shape {shape:?} ({want} values), found {} values with dims {:?}",
                                    ex.leaves.len(),
                                    ex.shape()
                                ),
                            ));
                        }
                        FeatureColumn::Dense(coerce(feature.dtype, &ex.leaves)?)
                    }
                }
                FeatureKind::VarLen { rank, .. } => {
                    let ex = &extractions[0];
                    if ex.absent {
                        FeatureColumn::VarLen {
                            values: Values::empty(feature.dtype),
                            shape: vec![0; *rank],
                        }
                    } else {
                        if let Some(depth) = ex.ragged {
                            return Err(Error::shape(
                                &origin,
                                name,
                                format!("nested lengths differ within the record at dimension {}", depth + 1),
                            ));
                        }
                        FeatureColumn::VarLen {
                            values: coerce(feature.dtype, &ex.leaves)?,
                            shape: ex.shape(),
                        }
                    }
                }
                FeatureKind::Sparse { indices, .. } => {
                    let missing: Vec<&str> = feature
                        .paths()
                        .into_iter()
                        .zip(&extractions)
                        .filter(|(_, ex)| ex.absent)
                        .map(|(path, _)| path.text.as_str())
                        .collect();
                    if missing.len() == extractions.len() {
                        FeatureColumn::Sparse {
                            indices: vec![Vec::new(); indices.len()],
                            values: Values::empty(feature.dtype),
                        }
                    } else if !missing.is_empty() {
                        return Err(Error::shape(
                            &origin,
                            name,
                            format!("paths {missing:?} are absent while the others have entries"),
                        ));
                    } else {
                        let (value_ex, index_ex) = extractions.split_last().ok_or_else(|| {
                            Error::parse(&origin, name, "sparse feature has no paths")
                        })?;
                        let n = value_ex.leaves.len();
                        let mut index_vectors = Vec::with_capacity(index_ex.len());
                        for (k, ex) in index_ex.iter().enumerate() {
                            if ex.leaves.len() != n {
                                return Err(Error::shape(
                                    &origin,
                                    name,
                                    format!(
                                        "index path {k} has {} entries but the value path has {n}",
                                        ex.leaves.len()
                                    ),
                                ));
                            }
                            match coerce(DType::Int64, &ex.leaves)? {
                                Values::Int64(v) => index_vectors.push(v),
                                other => {
                                    return Err(Error::type_error(
                                        &origin,
                                        name,
                                        format!("index path {k} produced {}", other.dtype()),
                                    ));
                                }
                            }
                        }
                        FeatureColumn::Sparse {
                            indices: index_vectors,
                            values: coerce(feature.dtype, &value_ex.leaves)?,
                        }
                    }
                }
            };
            columns.push(column);
        }
        Ok(ParsedRecord { origin, columns })
    }
}
