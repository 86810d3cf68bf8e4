//! Mapper: compiled query execution over shard cursors
//!
//! The mapper owns a lowered [`QueryProgram`] and runs its entry loop over
//! one object at a time: prime the cursor, then
//! `read_event -> next_event -> statements` until the object's events are
//! exhausted. Compilation is serialized by a process-wide lock across the
//! lowering phase only; a compiled mapper executes re-entrantly from any
//! number of shard tasks, each with its own cursor and result map.

use crate::error::Result;
use crate::hashmap::ResultMap;
use crate::ir::{
    pack_key, AggFn, ClauseFn, CondFn, EventLayout, QueryProgram, SlotValue, StatementFn,
};
use parking_lot::Mutex;
use skein_core::expr::CompareOp;
use skein_core::{Query, Table, WithinUnits};
use skein_store::{ObjectEvents, RawEvent, Store};
use std::cmp::Ordering;

static CODEGEN_LOCK: Mutex<()> = Mutex::new(());

/// Forward-only cursor over one object's events, exposing the current and
/// lookahead event buffers the compiled statements read and write.
pub struct EventCursor<'a> {
    layout: &'a EventLayout,
    events: &'a [RawEvent],
    session_idle_us: i64,
    index: usize,
    /// Decoded state at `index`, carry-forward applied.
    pub event: Vec<SlotValue>,
    /// Lookahead state at `index + 1`; garbage at eof.
    pub next_event: Vec<SlotValue>,
}

impl<'a> EventCursor<'a> {
    /// Primes the cursor on the object's first event. Returns `None` for an
    /// empty stream.
    pub fn new(
        layout: &'a EventLayout,
        events: &'a [RawEvent],
        session_idle_us: i64,
    ) -> Result<Option<EventCursor<'a>>> {
        if events.is_empty() {
            return Ok(None);
        }
        let mut event = layout.zeroed();
        layout.decode_into(&mut event, &events[0].body)?;

        let mut cursor = EventCursor {
            layout,
            events,
            session_idle_us,
            index: 0,
            event,
            next_event: layout.zeroed(),
        };
        cursor.buffer_next()?;
        Ok(Some(cursor))
    }

    /// Rebuilds the lookahead buffer: copy the current event's non-transient
    /// slots, zero the transient ones, then decode the next body over it.
    fn buffer_next(&mut self) -> Result<()> {
        for (i, slot) in self.layout.slots.iter().enumerate() {
            self.next_event[i] = if slot.transient {
                SlotValue::zero(slot.kind)
            } else {
                self.event[i].clone()
            };
        }
        if self.index + 1 < self.events.len() {
            self.layout
                .decode_into(&mut self.next_event, &self.events[self.index + 1].body)?;
        }
        Ok(())
    }

    /// Advances one event. Returns false once the current event is the last.
    pub fn next(&mut self) -> Result<bool> {
        if self.eof() {
            return Ok(false);
        }
        self.index += 1;
        std::mem::swap(&mut self.event, &mut self.next_event);
        self.buffer_next()?;
        Ok(true)
    }

    pub fn timestamp(&self) -> i64 {
        self.events[self.index].timestamp
    }

    /// True when positioned on the object's last event.
    pub fn eof(&self) -> bool {
        self.index + 1 >= self.events.len()
    }

    /// True at a session boundary: the next event is beyond the idle gap, or
    /// there is no next event.
    pub fn eos(&self) -> bool {
        if self.eof() {
            return true;
        }
        if self.session_idle_us <= 0 {
            return false;
        }
        self.events[self.index + 1].timestamp - self.timestamp() > self.session_idle_us
    }
}

/// A compiled, executable query.
pub struct Mapper {
    program: QueryProgram,
}

impl Mapper {
    /// Compiles a query against a schema snapshot. The dictionary is only
    /// consulted here, to intern factor literals; execution is lookup-free.
    pub fn new(query: &Query, table: &Table, store: &Store) -> Result<Mapper> {
        let _guard = CODEGEN_LOCK.lock();
        let program = QueryProgram::compile(query, table, store)?;
        Ok(Mapper { program })
    }

    pub fn program(&self) -> &QueryProgram {
        &self.program
    }

    /// IR dump for the codegen debug endpoint.
    pub fn dump(&self) -> String {
        self.program.to_string()
    }

    /// Entry function: runs every top-level statement once against the
    /// primed cursor for this object, filling `results`.
    pub fn map(&self, object: &ObjectEvents, results: &mut ResultMap) -> Result<()> {
        let Some(mut cursor) =
            EventCursor::new(&self.program.layout, &object.events, self.program.session_idle_us)?
        else {
            return Ok(());
        };
        for statement in &self.program.statements {
            self.exec_statement(statement, &mut cursor, results)?;
        }
        Ok(())
    }

    fn exec_statement(
        &self,
        statement: &StatementFn,
        cursor: &mut EventCursor<'_>,
        results: &mut ResultMap,
    ) -> Result<bool> {
        match statement {
            StatementFn::Selection(id) => {
                self.exec_selection(*id, cursor, results);
                Ok(true)
            }
            StatementFn::Condition(condition) => self.exec_condition(condition, cursor, results),
            StatementFn::Assignment(assignment) => {
                cursor.event[assignment.slot] = assignment.value.clone();
                Ok(true)
            }
        }
    }

    fn exec_selection(&self, id: u32, cursor: &EventCursor<'_>, results: &mut ResultMap) {
        let selection = &self.program.selections[id as usize];
        let dims: Vec<i64> = selection
            .dimensions
            .iter()
            .map(|&slot| cursor.event[slot].key_bits())
            .collect();

        for field in &selection.fields {
            let key = pack_key(field.key_selection, &dims, field.key_field);
            match &field.agg {
                AggFn::Count => results.add_int(&key, 1),
                AggFn::SumInt(slot) => {
                    if let SlotValue::Int(v) = &cursor.event[*slot] {
                        results.add_int(&key, *v);
                    }
                }
                AggFn::SumFloat(slot) => {
                    if let SlotValue::Float(v) = &cursor.event[*slot] {
                        results.add_float(&key, *v);
                    }
                }
            }
        }
    }

    /// Condition semantics: sweep the cursor forward; at each position that
    /// falls inside the window, test the expression; on the first match run
    /// the nested statements and stop. A condition matches at most once per
    /// entry.
    fn exec_condition(
        &self,
        condition: &CondFn,
        cursor: &mut EventCursor<'_>,
        results: &mut ResultMap,
    ) -> Result<bool> {
        // A window starting past the current event has nothing to match at
        // a session or object end.
        if condition.lo > 0 && (cursor.eos() || cursor.eof()) {
            return Ok(false);
        }

        let entry_timestamp = cursor.timestamp();
        let mut index: i64 = 0;
        let mut sessions: i64 = 0;

        loop {
            let position = match condition.units {
                WithinUnits::Steps => index,
                WithinUnits::Sessions => sessions,
                WithinUnits::Seconds => (cursor.timestamp() - entry_timestamp) / 1_000_000,
            };

            if position >= condition.lo
                && position <= condition.hi
                && self.eval_expression(condition, cursor)
            {
                for statement in &condition.statements {
                    self.exec_statement(statement, cursor, results)?;
                }
                return Ok(true);
            }

            if position >= condition.hi && condition.units == WithinUnits::Steps {
                break;
            }
            if position > condition.hi {
                break;
            }

            let crossed_session = cursor.eos();
            if !cursor.next()? {
                break;
            }
            index += 1;
            if crossed_session {
                sessions += 1;
            }
        }
        Ok(false)
    }

    fn eval_expression(&self, condition: &CondFn, cursor: &EventCursor<'_>) -> bool {
        if let Some(result) = condition.const_result {
            return result;
        }
        condition
            .clauses
            .iter()
            .all(|clause| eval_clause(clause, &cursor.event))
    }
}

fn eval_clause(clause: &ClauseFn, event: &[SlotValue]) -> bool {
    let ordering = match (&event[clause.slot], &clause.operand) {
        (SlotValue::Int(a), SlotValue::Int(b)) => a.cmp(b),
        (SlotValue::Float(a), SlotValue::Float(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Greater)
        }
        (SlotValue::Bool(a), SlotValue::Bool(b)) => a.cmp(b),
        (SlotValue::Str(a), SlotValue::Str(b)) => a.as_str().cmp(b.as_str()),
        _ => return false,
    };
    match clause.op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Slot, SlotKind};
    use skein_core::{DataType, Event};
    use skein_store::codec::encode_event;

    fn raw(event: &Event) -> RawEvent {
        RawEvent {
            timestamp: event.timestamp,
            body: encode_event(event),
        }
    }

    fn slot(name: &str, property_id: i64, data_type: DataType, transient: bool) -> Slot {
        let kind = match data_type {
            DataType::Float => SlotKind::Float,
            DataType::Boolean => SlotKind::Bool,
            DataType::String => SlotKind::Str,
            _ => SlotKind::Int,
        };
        Slot {
            name: name.to_string(),
            kind,
            data_type,
            property_id: Some(property_id),
            property_name: Some(name.to_string()),
            transient,
        }
    }

    /// action: integer(1), price: float(2), tag: transient integer(3)
    fn test_layout() -> EventLayout {
        let mut layout = EventLayout::default();
        layout.push(slot("action", 1, DataType::Integer, false));
        layout.push(slot("price", 2, DataType::Float, false));
        layout.push(slot("tag", 3, DataType::Integer, true));
        layout
    }

    #[test]
    fn test_cursor_carry_forward() {
        let layout = test_layout();
        let events = vec![
            raw(&Event::new(0).with_field(1, 7i64).with_field(3, 9i64)),
            raw(&Event::new(1).with_field(2, 2.5f64)),
        ];
        let mut cursor = EventCursor::new(&layout, &events, 0).unwrap().unwrap();

        assert_eq!(cursor.event[0], SlotValue::Int(7));
        assert_eq!(cursor.event[2], SlotValue::Int(9));

        assert!(cursor.next().unwrap());
        // action carried forward, price decoded, transient tag reset
        assert_eq!(cursor.event[0], SlotValue::Int(7));
        assert_eq!(cursor.event[1], SlotValue::Float(2.5));
        assert_eq!(cursor.event[2], SlotValue::Int(0));

        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_cursor_eof_eos() {
        let layout = test_layout();
        let idle = 10 * 1_000_000;
        let events = vec![
            raw(&Event::new(0).with_field(1, 1i64)),
            raw(&Event::new(1_000_000).with_field(1, 2i64)),
            raw(&Event::new(60_000_000).with_field(1, 3i64)),
        ];
        let mut cursor = EventCursor::new(&layout, &events, idle).unwrap().unwrap();

        assert!(!cursor.eof());
        assert!(!cursor.eos());

        assert!(cursor.next().unwrap());
        // next event is an hour away: session boundary
        assert!(cursor.eos());
        assert!(!cursor.eof());

        assert!(cursor.next().unwrap());
        assert!(cursor.eof());
        assert!(cursor.eos());
    }

    #[test]
    fn test_cursor_empty_object() {
        let layout = test_layout();
        assert!(EventCursor::new(&layout, &[], 0).unwrap().is_none());
    }

    #[test]
    fn test_eval_clause_int() {
        let clause = ClauseFn {
            slot: 0,
            op: CompareOp::Ge,
            operand: SlotValue::Int(10),
        };
        assert!(eval_clause(&clause, &[SlotValue::Int(10)]));
        assert!(eval_clause(&clause, &[SlotValue::Int(11)]));
        assert!(!eval_clause(&clause, &[SlotValue::Int(9)]));
    }

    #[test]
    fn test_eval_clause_string() {
        let clause = ClauseFn {
            slot: 0,
            op: CompareOp::Eq,
            operand: SlotValue::Str("john".into()),
        };
        assert!(eval_clause(&clause, &[SlotValue::Str("john".into())]));
        assert!(!eval_clause(&clause, &[SlotValue::Str("jane".into())]));
    }

    #[test]
    fn test_eval_clause_kind_mismatch_is_false() {
        let clause = ClauseFn {
            slot: 0,
            op: CompareOp::Eq,
            operand: SlotValue::Int(1),
        };
        assert!(!eval_clause(&clause, &[SlotValue::Str("1".into())]));
    }

    #[test]
    fn test_condition_steps_window() {
        // condition `action == 1` within [0, 2] steps over events with
        // action = 0, 1, 1: matches at step 1, children run there, once.
        let layout = test_layout();
        let events = vec![
            raw(&Event::new(0).with_field(1, 0i64)),
            raw(&Event::new(1).with_field(1, 1i64)),
            raw(&Event::new(2).with_field(1, 1i64)),
        ];

        let condition = CondFn {
            id: 0,
            const_result: None,
            clauses: vec![ClauseFn {
                slot: 0,
                op: CompareOp::Eq,
                operand: SlotValue::Int(1),
            }],
            lo: 0,
            hi: 2,
            units: WithinUnits::Steps,
            statements: vec![],
        };
        let program = QueryProgram {
            table_name: "foo".to_string(),
            prefix: String::new(),
            session_idle_us: 0,
            layout: test_layout(),
            statements: vec![StatementFn::Condition(condition.clone())],
            selections: vec![],
        };
        let mapper = Mapper { program };

        let mut cursor = EventCursor::new(&layout, &events, 0).unwrap().unwrap();
        let mut results = ResultMap::new();
        let matched = mapper
            .exec_condition(&condition, &mut cursor, &mut results)
            .unwrap();
        assert!(matched);
        // the cursor stopped on the matching event
        assert_eq!(cursor.timestamp(), 1);
    }

    #[test]
    fn test_condition_window_exhausted_without_match() {
        let layout = test_layout();
        let events = vec![
            raw(&Event::new(0).with_field(1, 0i64)),
            raw(&Event::new(1).with_field(1, 0i64)),
            raw(&Event::new(2).with_field(1, 1i64)),
        ];

        let condition = CondFn {
            id: 0,
            const_result: None,
            clauses: vec![ClauseFn {
                slot: 0,
                op: CompareOp::Eq,
                operand: SlotValue::Int(1),
            }],
            lo: 0,
            hi: 1,
            units: WithinUnits::Steps,
            statements: vec![],
        };
        let program = QueryProgram {
            table_name: "foo".to_string(),
            prefix: String::new(),
            session_idle_us: 0,
            layout: test_layout(),
            statements: vec![],
            selections: vec![],
        };
        let mapper = Mapper { program };

        let mut cursor = EventCursor::new(&layout, &events, 0).unwrap().unwrap();
        let mut results = ResultMap::new();
        let matched = mapper
            .exec_condition(&condition, &mut cursor, &mut results)
            .unwrap();
        // action only becomes 1 at step 2, outside [0, 1]
        assert!(!matched);
    }

    #[test]
    fn test_condition_lo_positive_bails_at_eof() {
        let layout = test_layout();
        let events = vec![raw(&Event::new(0).with_field(1, 1i64))];

        let condition = CondFn {
            id: 0,
            const_result: Some(true),
            clauses: vec![],
            lo: 1,
            hi: 2,
            units: WithinUnits::Steps,
            statements: vec![],
        };
        let program = QueryProgram {
            table_name: "foo".to_string(),
            prefix: String::new(),
            session_idle_us: 0,
            layout: test_layout(),
            statements: vec![],
            selections: vec![],
        };
        let mapper = Mapper { program };

        let mut cursor = EventCursor::new(&layout, &events, 0).unwrap().unwrap();
        let mut results = ResultMap::new();
        assert!(!mapper
            .exec_condition(&condition, &mut cursor, &mut results)
            .unwrap());
    }
}
