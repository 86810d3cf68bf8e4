//! Reducer: folds per-shard result maps into one nested response
//!
//! Buckets carrying the same dimension tuple are combined by field
//! semantics: counts and sums add. Reducible fields were already pointed at
//! their canonical bucket during lowering, so every bucket seen here maps to
//! exactly one output path. Factor dimensions are translated back to their
//! strings on the way out.

use crate::error::{QueryError, Result};
use crate::hashmap::{Acc, ResultMap};
use crate::ir::{unpack_dims, unpack_selection, QueryProgram};
use serde_json::{Map, Number, Value as Json};
use skein_core::DataType;
use skein_store::Store;

/// Reduces every shard's map into one JSON object mirroring the query's
/// selection tree.
pub fn reduce(store: &Store, program: &QueryProgram, maps: &[ResultMap]) -> Result<Json> {
    let mut output = Map::new();
    for map in maps {
        for (key, acc) in map.iter() {
            reduce_bucket(store, program, key, acc, &mut output)?;
        }
    }
    Ok(Json::Object(output))
}

fn reduce_bucket(
    store: &Store,
    program: &QueryProgram,
    key: &[u8],
    acc: Acc,
    output: &mut Map<String, Json>,
) -> Result<()> {
    let (selection_id, rest) = unpack_selection(key)?;
    let selection = program
        .selections
        .get(selection_id as usize)
        .ok_or_else(|| QueryError::Codegen(format!("unknown selection id: {}", selection_id)))?;
    let (dims, field_index) = unpack_dims(rest, selection.dimensions.len())?;
    let field = selection
        .fields
        .get(field_index as usize)
        .ok_or_else(|| QueryError::Codegen(format!("unknown field index: {}", field_index)))?;

    // Named selections nest under their name.
    let mut node = output;
    if !selection.name.is_empty() {
        node = child_object(node, selection.name.clone())?;
    }

    // One nesting level per dimension value.
    for (&slot_index, &bits) in selection.dimensions.iter().zip(dims.iter()) {
        let label = dimension_label(store, program, slot_index, bits)?;
        node = child_object(node, label)?;
    }

    merge_field(node, &field.name, acc)
}

/// Renders a dimension key word for output. Factor ids go back through the
/// dictionary; everything else prints its value.
fn dimension_label(
    store: &Store,
    program: &QueryProgram,
    slot_index: usize,
    bits: i64,
) -> Result<String> {
    let slot = &program.layout.slots[slot_index];
    match slot.data_type {
        DataType::Factor => {
            let property = slot.property_name.as_deref().unwrap_or(slot.name.as_str());
            Ok(store.defactorize(&program.table_name, property, bits as u64)?)
        }
        DataType::Boolean => Ok(if bits != 0 { "true" } else { "false" }.to_string()),
        _ => Ok(bits.to_string()),
    }
}

fn child_object(node: &mut Map<String, Json>, key: String) -> Result<&mut Map<String, Json>> {
    let entry = node.entry(key).or_insert_with(|| Json::Object(Map::new()));
    entry
        .as_object_mut()
        .ok_or_else(|| QueryError::Codegen("result shape collision".to_string()))
}

fn merge_field(node: &mut Map<String, Json>, name: &str, acc: Acc) -> Result<()> {
    let entry = node.entry(name.to_string());
    match acc {
        Acc::Int(v) => {
            let entry = entry.or_insert_with(|| Json::Number(Number::from(0)));
            let current = entry.as_i64().ok_or_else(|| {
                QueryError::Codegen(format!("result type collision on field {}", name))
            })?;
            *entry = Json::Number(Number::from(current + v));
        }
        Acc::Float(v) => {
            let entry = entry.or_insert_with(|| Json::Number(Number::from_f64(0.0).unwrap()));
            let current = entry.as_f64().ok_or_else(|| {
                QueryError::Codegen(format!("result type collision on field {}", name))
            })?;
            *entry = Json::Number(
                Number::from_f64(current + v)
                    .ok_or_else(|| QueryError::Codegen("non-finite sum".to_string()))?,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::pack_key;

    // reduce() needs a program and a store; those paths are covered by the
    // pipeline integration tests. The pure pieces are tested here.

    #[test]
    fn test_merge_field_adds_ints() {
        let mut node = Map::new();
        merge_field(&mut node, "count", Acc::Int(3)).unwrap();
        merge_field(&mut node, "count", Acc::Int(5)).unwrap();
        assert_eq!(node["count"], Json::Number(Number::from(8)));
    }

    #[test]
    fn test_merge_field_adds_floats() {
        let mut node = Map::new();
        merge_field(&mut node, "total", Acc::Float(1.5)).unwrap();
        merge_field(&mut node, "total", Acc::Float(2.0)).unwrap();
        assert_eq!(node["total"].as_f64().unwrap(), 3.5);
    }

    #[test]
    fn test_merge_field_type_collision() {
        let mut node = Map::new();
        merge_field(&mut node, "x", Acc::Int(1)).unwrap();
        assert!(merge_field(&mut node, "x", Acc::Float(1.0)).is_err());
    }

    #[test]
    fn test_key_roundtrip() {
        let key = pack_key(2, &[7, -1], 1);
        let (selection_id, rest) = unpack_selection(&key).unwrap();
        assert_eq!(selection_id, 2);
        let (dims, field_index) = unpack_dims(rest, 2).unwrap();
        assert_eq!(dims, vec![7, -1]);
        assert_eq!(field_index, 1);
    }
}
