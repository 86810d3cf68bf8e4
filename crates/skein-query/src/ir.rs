//! Query lowering
//!
//! A validated query is lowered into a self-contained program: an event slot
//! layout derived from the declarations the query touches, and one compiled
//! function per statement with every name, factor literal and key shape
//! resolved up front. Execution never consults the schema or the dictionary;
//! the entry loop in the mapper runs the program over raw event bytes.

use crate::error::{QueryError, Result};
use rustc_hash::FxHashMap;
use skein_core::ast::{Aggregation, Literal, Statement};
use skein_core::expr::{parse_expression, CompareOp, ExprLiteral, Expression};
use skein_core::{DataType, Query, Table, WithinUnits};
use skein_store::codec::{self, read_uvarint, write_uvarint, zigzag_decode};
use skein_store::{Store, StoreError};
use std::fmt;

/// Machine representation of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Int,
    Float,
    Bool,
    Str,
}

impl SlotKind {
    fn of(data_type: DataType) -> SlotKind {
        match data_type {
            DataType::Factor | DataType::Integer => SlotKind::Int,
            DataType::Float => SlotKind::Float,
            DataType::Boolean => SlotKind::Bool,
            DataType::String => SlotKind::Str,
        }
    }
}

/// A runtime slot value. Factor ids are carried as ints; the declared data
/// type on the slot remembers which they are.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl SlotValue {
    pub fn zero(kind: SlotKind) -> SlotValue {
        match kind {
            SlotKind::Int => SlotValue::Int(0),
            SlotKind::Float => SlotValue::Float(0.0),
            SlotKind::Bool => SlotValue::Bool(false),
            SlotKind::Str => SlotValue::Str(String::new()),
        }
    }

    /// Raw i64 image used in packed dimension keys.
    pub fn key_bits(&self) -> i64 {
        match self {
            SlotValue::Int(n) => *n,
            SlotValue::Bool(b) => i64::from(*b),
            SlotValue::Float(n) => n.to_bits() as i64,
            SlotValue::Str(_) => 0,
        }
    }
}

/// One field of the event struct the query runs over.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub kind: SlotKind,
    pub data_type: DataType,
    /// Property whose stored values decode into this slot; `None` for
    /// query-local scratch variables.
    pub property_id: Option<i64>,
    /// Property name used to defactorize dimension values on output.
    pub property_name: Option<String>,
    /// Transient slots are excluded from carry-forward.
    pub transient: bool,
}

/// The event struct: one slot per declaration, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct EventLayout {
    pub slots: Vec<Slot>,
    by_property: FxHashMap<i64, usize>,
    by_name: FxHashMap<String, usize>,
}

impl EventLayout {
    pub(crate) fn push(&mut self, slot: Slot) -> usize {
        let index = self.slots.len();
        if let Some(property_id) = slot.property_id {
            self.by_property.entry(property_id).or_insert(index);
        }
        self.by_name.insert(slot.name.clone(), index);
        self.slots.push(slot);
        index
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Fresh buffer of zero values.
    pub fn zeroed(&self) -> Vec<SlotValue> {
        self.slots.iter().map(|s| SlotValue::zero(s.kind)).collect()
    }

    /// Decodes an encoded event body over `buf`. Slots absent from the body
    /// are left untouched, which is what carry-forward relies on.
    pub fn decode_into(&self, buf: &mut [SlotValue], body: &[u8]) -> Result<()> {
        let mut input = body;
        // skip the body-length prefix and timestamp header
        let body_len = read_uvarint(&mut input).map_err(QueryError::Store)? as usize;
        if input.len() < 8 + body_len {
            return Err(QueryError::Store(StoreError::Corruption(
                "truncated event body".to_string(),
            )));
        }
        input = &input[8..8 + body_len];

        while !input.is_empty() {
            let property_id = zigzag_decode(read_uvarint(&mut input).map_err(QueryError::Store)?);
            let slot = self.by_property.get(&property_id).copied();
            self.decode_field(&mut input, slot, buf)?;
        }
        Ok(())
    }

    /// Reads one `(tag, payload)` off the body, storing it into the given
    /// slot when one is mapped, consuming it otherwise.
    fn decode_field(
        &self,
        input: &mut &[u8],
        slot: Option<usize>,
        buf: &mut [SlotValue],
    ) -> Result<()> {
        let tag = take_u8(input)?;
        let kind = slot.map(|i| self.slots[i].kind);
        match tag {
            codec::TAG_INT => {
                let value = zigzag_decode(read_uvarint(input).map_err(QueryError::Store)?);
                match kind {
                    Some(SlotKind::Int) => buf[slot.unwrap()] = SlotValue::Int(value),
                    Some(SlotKind::Float) => buf[slot.unwrap()] = SlotValue::Float(value as f64),
                    _ => {}
                }
            }
            codec::TAG_FLOAT => {
                let bytes = take_n(input, 8)?;
                let value = f64::from_le_bytes(bytes.try_into().unwrap());
                match kind {
                    Some(SlotKind::Float) => buf[slot.unwrap()] = SlotValue::Float(value),
                    Some(SlotKind::Int) => buf[slot.unwrap()] = SlotValue::Int(value as i64),
                    _ => {}
                }
            }
            codec::TAG_BOOL => {
                let value = take_u8(input)? != 0;
                if kind == Some(SlotKind::Bool) {
                    buf[slot.unwrap()] = SlotValue::Bool(value);
                }
            }
            codec::TAG_STRING => {
                let len = read_uvarint(input).map_err(QueryError::Store)? as usize;
                let bytes = take_n(input, len)?;
                if kind == Some(SlotKind::Str) {
                    buf[slot.unwrap()] = SlotValue::Str(String::from_utf8_lossy(bytes).into_owned());
                }
            }
            codec::TAG_ID => {
                let value = read_uvarint(input).map_err(QueryError::Store)?;
                if kind == Some(SlotKind::Int) {
                    buf[slot.unwrap()] = SlotValue::Int(value as i64);
                }
            }
            other => {
                return Err(QueryError::Store(StoreError::Corruption(format!(
                    "unknown value tag: {}",
                    other
                ))))
            }
        }
        Ok(())
    }
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let (&first, rest) = input.split_first().ok_or_else(|| {
        QueryError::Store(StoreError::Corruption("truncated event body".to_string()))
    })?;
    *input = rest;
    Ok(first)
}

fn take_n<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(QueryError::Store(StoreError::Corruption(
            "truncated event body".to_string(),
        )));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// One comparison clause of a condition, fully resolved.
#[derive(Debug, Clone)]
pub struct ClauseFn {
    pub slot: usize,
    pub op: CompareOp,
    pub operand: SlotValue,
}

/// Aggregate update a selection applies per firing.
#[derive(Debug, Clone)]
pub enum AggFn {
    Count,
    SumInt(usize),
    SumFloat(usize),
}

/// One aggregate field, with the canonical key coordinates its updates
/// accumulate under. A reducible field (same selection path and identifier
/// as an earlier one) shares the earlier field's key, so the reducer only
/// ever sees one bucket per output path.
#[derive(Debug, Clone)]
pub struct FieldFn {
    pub name: String,
    pub agg: AggFn,
    pub key_selection: u32,
    pub key_field: u32,
    pub reducible: bool,
}

/// A lowered selection.
#[derive(Debug, Clone)]
pub struct SelectionInfo {
    pub id: u32,
    pub name: String,
    pub dimensions: Vec<usize>,
    pub fields: Vec<FieldFn>,
}

#[derive(Debug, Clone)]
pub struct CondFn {
    pub id: u32,
    /// `Some` when the expression was a bare boolean.
    pub const_result: Option<bool>,
    pub clauses: Vec<ClauseFn>,
    pub lo: i64,
    pub hi: i64,
    pub units: WithinUnits,
    pub statements: Vec<StatementFn>,
}

#[derive(Debug, Clone)]
pub struct AssignFn {
    pub id: u32,
    pub slot: usize,
    pub value: SlotValue,
}

#[derive(Debug, Clone)]
pub enum StatementFn {
    /// Index into `QueryProgram::selections`.
    Selection(u32),
    Condition(CondFn),
    Assignment(AssignFn),
}

/// A compiled query.
#[derive(Debug, Clone)]
pub struct QueryProgram {
    pub table_name: String,
    pub prefix: String,
    pub session_idle_us: i64,
    pub layout: EventLayout,
    pub statements: Vec<StatementFn>,
    pub selections: Vec<SelectionInfo>,
}

/// Packs a group key: selection id, one 8-byte big-endian word per
/// dimension, then the field index.
pub fn pack_key(selection_id: u32, dims: &[i64], field_index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + dims.len() * 8 + 2);
    write_uvarint(&mut key, selection_id as u64);
    for dim in dims {
        key.extend_from_slice(&dim.to_be_bytes());
    }
    write_uvarint(&mut key, field_index as u64);
    key
}

/// Reads the selection id off a packed key, returning the rest.
pub fn unpack_selection(key: &[u8]) -> Result<(u32, &[u8])> {
    let mut input = key;
    let id = read_uvarint(&mut input).map_err(QueryError::Store)?;
    Ok((id as u32, input))
}

/// Reads the dimension words and the field index, given the dimension count
/// from the selection the key belongs to.
pub fn unpack_dims(rest: &[u8], dim_count: usize) -> Result<(Vec<i64>, u32)> {
    if rest.len() < dim_count * 8 {
        return Err(QueryError::Codegen("short result key".to_string()));
    }
    let mut dims = Vec::with_capacity(dim_count);
    for chunk in rest[..dim_count * 8].chunks_exact(8) {
        dims.push(i64::from_be_bytes(chunk.try_into().unwrap()));
    }
    let mut input = &rest[dim_count * 8..];
    let field_index = read_uvarint(&mut input).map_err(QueryError::Store)?;
    Ok((dims, field_index as u32))
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct Lowerer<'a> {
    table: &'a Table,
    store: &'a Store,
    layout: EventLayout,
    selections: Vec<SelectionInfo>,
    /// (selection name, dims, field identifier) → canonical key coordinates.
    field_paths: Vec<(String, Vec<usize>, String, u32, u32)>,
    next_id: u32,
}

impl QueryProgram {
    /// Validates and lowers a query against a schema snapshot. Factor
    /// literals are interned here, once; a literal the dictionary has never
    /// seen compiles to id 0, which matches no stored value.
    pub fn compile(query: &Query, table: &Table, store: &Store) -> Result<QueryProgram> {
        skein_core::validate(query, table)?;

        let mut lowerer = Lowerer {
            table,
            store,
            layout: EventLayout::default(),
            selections: Vec::new(),
            field_paths: Vec::new(),
            next_id: 0,
        };
        lowerer.build_layout(query)?;
        let statements = lowerer.lower_statements(&query.statements)?;

        Ok(QueryProgram {
            table_name: table.name.clone(),
            prefix: query.prefix.clone(),
            session_idle_us: query.session_idle_time.saturating_mul(1_000_000),
            layout: lowerer.layout,
            statements,
            selections: lowerer.selections,
        })
    }
}

impl<'a> Lowerer<'a> {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Explicit declarations first, in declaration order, then one implicit
    /// slot per referenced schema property in first-reference order.
    fn build_layout(&mut self, query: &Query) -> Result<()> {
        for decl in &query.variables {
            let association = decl
                .association
                .as_deref()
                .or(Some(decl.name.as_str()))
                .and_then(|name| self.table.property_by_name(name));
            self.layout.push(Slot {
                name: decl.name.clone(),
                kind: SlotKind::of(decl.data_type),
                data_type: decl.data_type,
                property_id: association.map(|p| p.id),
                property_name: association.map(|p| p.name.clone()),
                transient: association.map(|p| p.transient).unwrap_or(false),
            });
        }

        let mut referenced = Vec::new();
        collect_identifiers(&query.statements, &mut referenced);
        for name in referenced {
            if self.layout.find(&name).is_some() {
                continue;
            }
            let Some(property) = self.table.property_by_name(&name) else {
                // validation guarantees resolution; a miss here is a var decl
                continue;
            };
            self.layout.push(Slot {
                name: property.name.clone(),
                kind: SlotKind::of(property.data_type),
                data_type: property.data_type,
                property_id: Some(property.id),
                property_name: Some(property.name.clone()),
                transient: property.transient,
            });
        }
        Ok(())
    }

    fn slot_of(&self, name: &str) -> Result<usize> {
        self.layout
            .find(name)
            .ok_or_else(|| QueryError::Codegen(format!("unresolved identifier: {}", name)))
    }

    fn lower_statements(&mut self, statements: &[Statement]) -> Result<Vec<StatementFn>> {
        statements.iter().map(|s| self.lower_statement(s)).collect()
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<StatementFn> {
        match statement {
            Statement::Selection {
                name,
                dimensions,
                fields,
            } => self.lower_selection(name, dimensions, fields),
            Statement::Condition {
                expression,
                within,
                within_units,
                statements,
            } => self.lower_condition(expression, *within, *within_units, statements),
            Statement::Assignment { target, expression } => {
                self.lower_assignment(target, expression)
            }
        }
    }

    fn lower_selection(
        &mut self,
        name: &str,
        dimensions: &[String],
        fields: &[skein_core::ast::Field],
    ) -> Result<StatementFn> {
        let selection_id = self.selections.len() as u32;
        let dims: Vec<usize> = dimensions
            .iter()
            .map(|d| self.slot_of(d))
            .collect::<Result<_>>()?;

        let mut lowered_fields = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            let agg = match field.aggregation() {
                Some(Aggregation::Count) => AggFn::Count,
                Some(Aggregation::Sum(arg)) => {
                    let slot = self.slot_of(&arg)?;
                    match self.layout.slots[slot].kind {
                        SlotKind::Float => AggFn::SumFloat(slot),
                        _ => AggFn::SumInt(slot),
                    }
                }
                None => {
                    return Err(QueryError::Codegen(format!(
                        "unsupported aggregation: {}",
                        field.expression
                    )))
                }
            };

            let identifier = field.identifier().to_string();
            let canonical = self
                .field_paths
                .iter()
                .find(|(n, d, f, _, _)| n == name && *d == dims && *f == identifier)
                .map(|(_, _, _, s, i)| (*s, *i));
            let (key_selection, key_field, reducible) = match canonical {
                Some((s, i)) => (s, i, true),
                None => {
                    self.field_paths.push((
                        name.to_string(),
                        dims.clone(),
                        identifier.clone(),
                        selection_id,
                        index as u32,
                    ));
                    (selection_id, index as u32, false)
                }
            };

            lowered_fields.push(FieldFn {
                name: identifier,
                agg,
                key_selection,
                key_field,
                reducible,
            });
        }

        self.selections.push(SelectionInfo {
            id: selection_id,
            name: name.to_string(),
            dimensions: dims,
            fields: lowered_fields,
        });
        Ok(StatementFn::Selection(selection_id))
    }

    fn lower_condition(
        &mut self,
        expression: &str,
        within: [i64; 2],
        units: WithinUnits,
        statements: &[Statement],
    ) -> Result<StatementFn> {
        let id = self.next_id();
        let parsed =
            parse_expression(expression).map_err(|e| QueryError::Codegen(e.to_string()))?;

        let (const_result, clauses) = match parsed {
            Expression::Const(b) => (Some(b), Vec::new()),
            Expression::Clauses(clauses) => {
                let mut lowered = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    lowered.push(self.lower_clause(clause)?);
                }
                (None, lowered)
            }
        };

        let statements = self.lower_statements(statements)?;
        Ok(StatementFn::Condition(CondFn {
            id,
            const_result,
            clauses,
            lo: within[0],
            hi: within[1],
            units,
            statements,
        }))
    }

    fn lower_clause(&mut self, clause: skein_core::expr::Clause) -> Result<ClauseFn> {
        let slot = self.slot_of(&clause.property)?;
        let slot_info = &self.layout.slots[slot];
        let operand = match (&slot_info.data_type, clause.literal) {
            (DataType::Factor, ExprLiteral::Str(s)) => {
                SlotValue::Int(self.factorize_literal(slot, &s)? as i64)
            }
            (DataType::String, ExprLiteral::Str(s)) => SlotValue::Str(s),
            (DataType::Integer, ExprLiteral::Int(n)) => SlotValue::Int(n),
            (DataType::Integer, ExprLiteral::Float(n)) => SlotValue::Int(n as i64),
            (DataType::Float, ExprLiteral::Int(n)) => SlotValue::Float(n as f64),
            (DataType::Float, ExprLiteral::Float(n)) => SlotValue::Float(n),
            (DataType::Boolean, ExprLiteral::Bool(b)) => SlotValue::Bool(b),
            (data_type, literal) => {
                return Err(QueryError::Codegen(format!(
                    "literal {:?} does not fit {} property {}",
                    literal, data_type, clause.property
                )))
            }
        };
        Ok(ClauseFn {
            slot,
            op: clause.op,
            operand,
        })
    }

    fn lower_assignment(&mut self, target: &str, expression: &Literal) -> Result<StatementFn> {
        let id = self.next_id();
        let slot = self.slot_of(target)?;
        let slot_info = &self.layout.slots[slot];
        let value = match (slot_info.data_type, expression) {
            (DataType::Factor, Literal::Str(s)) => {
                SlotValue::Int(self.factorize_literal(slot, s)? as i64)
            }
            (DataType::Factor, Literal::Int(n)) => SlotValue::Int(*n),
            (DataType::String, Literal::Str(s)) => SlotValue::Str(s.clone()),
            (DataType::Integer, Literal::Int(n)) => SlotValue::Int(*n),
            (DataType::Float, Literal::Int(n)) => SlotValue::Float(*n as f64),
            (DataType::Float, Literal::Float(n)) => SlotValue::Float(*n),
            (DataType::Boolean, Literal::Bool(b)) => SlotValue::Bool(*b),
            (data_type, literal) => {
                return Err(QueryError::Codegen(format!(
                    "literal {:?} does not fit {} variable {}",
                    literal, data_type, target
                )))
            }
        };
        Ok(StatementFn::Assignment(AssignFn { id, slot, value }))
    }

    /// Compile-time factorization. Missing values degrade to id 0, which
    /// never matches stored data, so a query probing an unseen string
    /// returns empty instead of failing.
    fn factorize_literal(&self, slot: usize, value: &str) -> Result<u64> {
        let slot_info = &self.layout.slots[slot];
        let property = slot_info
            .property_name
            .as_deref()
            .unwrap_or(slot_info.name.as_str());
        match self
            .store
            .factorize(&self.table.name, property, value, false)
        {
            Ok(id) => Ok(id),
            Err(StoreError::FactorNotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_identifiers(statements: &[Statement], out: &mut Vec<String>) {
    for statement in statements {
        match statement {
            Statement::Selection {
                dimensions, fields, ..
            } => {
                out.extend(dimensions.iter().cloned());
                for field in fields {
                    if let Some(Aggregation::Sum(arg)) = field.aggregation() {
                        out.push(arg);
                    }
                }
            }
            Statement::Condition {
                expression,
                statements,
                ..
            } => {
                if let Ok(Expression::Clauses(clauses)) = parse_expression(expression) {
                    out.extend(clauses.into_iter().map(|c| c.property));
                }
                collect_identifiers(statements, out);
            }
            Statement::Assignment { target, .. } => out.push(target.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// IR dump
// ---------------------------------------------------------------------------

impl fmt::Display for QueryProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; table: {}", self.table_name)?;
        writeln!(f, "; session_idle: {}us", self.session_idle_us)?;
        writeln!(f, "; event layout")?;
        for (index, slot) in self.layout.slots.iter().enumerate() {
            let binding = match slot.property_id {
                Some(id) => format!("property {}", id),
                None => "local".to_string(),
            };
            writeln!(
                f,
                ";   slot {}: {} {} <- {}{}",
                index,
                slot.name,
                slot.data_type,
                binding,
                if slot.transient { " transient" } else { "" }
            )?;
        }
        writeln!(f)?;

        for statement in &self.statements {
            self.fmt_statement(f, statement)?;
        }

        writeln!(f, "define void @entry(cursor*, hashmap*) {{")?;
        writeln!(f, "  prime: next_object(true)")?;
        writeln!(f, "  loop:  read_event -> next_event")?;
        for statement in &self.statements {
            writeln!(f, "         call @{}", statement_label(statement))?;
        }
        writeln!(f, "         br loop until eof")?;
        write!(f, "}}")
    }
}

fn statement_label(statement: &StatementFn) -> String {
    match statement {
        StatementFn::Selection(id) => format!("s{}", id),
        StatementFn::Condition(c) => format!("a{}", c.id),
        StatementFn::Assignment(a) => format!("t{}", a.id),
    }
}

impl QueryProgram {
    fn fmt_statement(&self, f: &mut fmt::Formatter<'_>, statement: &StatementFn) -> fmt::Result {
        match statement {
            StatementFn::Selection(id) => {
                let selection = &self.selections[*id as usize];
                writeln!(
                    f,
                    "define void @s{}(cursor*, hashmap*) {{ ; selection \"{}\"",
                    selection.id, selection.name
                )?;
                if !selection.dimensions.is_empty() {
                    let dims: Vec<String> = selection
                        .dimensions
                        .iter()
                        .map(|d| format!("slot{}", d))
                        .collect();
                    writeln!(f, "  key = pack [{}]", dims.join(", "))?;
                } else {
                    writeln!(f, "  key = pack []")?;
                }
                for field in &selection.fields {
                    let update = match &field.agg {
                        AggFn::Count => "count += 1".to_string(),
                        AggFn::SumInt(slot) => format!("sum += slot{} (i64)", slot),
                        AggFn::SumFloat(slot) => format!("sum += slot{} (f64)", slot),
                    };
                    writeln!(
                        f,
                        "  {}: {}{}",
                        field.name,
                        update,
                        if field.reducible { " ; reducible" } else { "" }
                    )?;
                }
                writeln!(f, "}}")?;
            }
            StatementFn::Condition(condition) => {
                for child in &condition.statements {
                    self.fmt_statement(f, child)?;
                }
                writeln!(
                    f,
                    "define i1 @a{}(cursor*, hashmap*) {{ ; condition within [{}, {}] {}",
                    condition.id, condition.lo, condition.hi, condition.units
                )?;
                match condition.const_result {
                    Some(b) => writeln!(f, "  expr = {}", b)?,
                    None => {
                        let clauses: Vec<String> = condition
                            .clauses
                            .iter()
                            .map(|c| format!("slot{} {} {:?}", c.slot, c.op, c.operand))
                            .collect();
                        writeln!(f, "  expr = {}", clauses.join(" && "))?;
                    }
                }
                for child in &condition.statements {
                    writeln!(f, "  then: call @{}", statement_label(child))?;
                }
                writeln!(f, "  break after first match")?;
                writeln!(f, "}}")?;
            }
            StatementFn::Assignment(assignment) => {
                writeln!(
                    f,
                    "define void @t{}(cursor*, hashmap*) {{ ; assignment",
                    assignment.id
                )?;
                writeln!(f, "  slot{} = {:?}", assignment.slot, assignment.value)?;
                writeln!(f, "}}")?;
            }
        }
        Ok(())
    }
}
