pub mod proto;

use crate::dimension::HashableDimensionKey;
use crate::event::{FieldValue, Value};
use crate::matcher::FieldSelector;
use proto::ProtoWriter;

// Metric report top level.
pub const FIELD_ID_ID: u32 = 1;
pub const FIELD_ID_GAUGE_METRICS: u32 = 8;
pub const FIELD_ID_TIME_BASE: u32 = 9;
pub const FIELD_ID_BUCKET_SIZE: u32 = 10;
pub const FIELD_ID_DIMENSION_PATH_IN_WHAT: u32 = 11;
pub const FIELD_ID_IS_ACTIVE: u32 = 14;
pub const FIELD_ID_DIMENSION_GUARDRAIL_HIT: u32 = 17;
// Data wrapper.
pub const FIELD_ID_DATA: u32 = 1;
pub const FIELD_ID_SKIPPED: u32 = 2;
// Skipped buckets.
pub const FIELD_ID_SKIPPED_START_MILLIS: u32 = 3;
pub const FIELD_ID_SKIPPED_END_MILLIS: u32 = 4;
pub const FIELD_ID_SKIPPED_DROP_EVENT: u32 = 5;
// Drop events.
pub const FIELD_ID_BUCKET_DROP_REASON: u32 = 1;
pub const FIELD_ID_DROP_TIME: u32 = 2;
// Per-dimension data.
pub const FIELD_ID_DIMENSION_IN_WHAT: u32 = 1;
pub const FIELD_ID_BUCKET_INFO: u32 = 3;
pub const FIELD_ID_DIMENSION_LEAF_IN_WHAT: u32 = 4;
// Bucket info.
pub const FIELD_ID_BUCKET_NUM: u32 = 6;
pub const FIELD_ID_START_BUCKET_ELAPSED_MILLIS: u32 = 7;
pub const FIELD_ID_END_BUCKET_ELAPSED_MILLIS: u32 = 8;
pub const FIELD_ID_AGGREGATED_ATOM: u32 = 9;
// Aggregated atom.
pub const FIELD_ID_ATOM_VALUE: u32 = 1;
pub const FIELD_ID_ATOM_TIMESTAMPS: u32 = 2;
// DimensionsValue message.
pub const DIMENSIONS_VALUE_FIELD: u32 = 1;
pub const DIMENSIONS_VALUE_VALUE_STR: u32 = 2;
pub const DIMENSIONS_VALUE_VALUE_INT: u32 = 3;
pub const DIMENSIONS_VALUE_VALUE_LONG: u32 = 4;
pub const DIMENSIONS_VALUE_VALUE_FLOAT: u32 = 6;
pub const DIMENSIONS_VALUE_VALUE_TUPLE: u32 = 7;
// DimensionsValueTuple message.
pub const DIMENSIONS_VALUE_TUPLE_DIMENSIONS_VALUE: u32 = 1;

pub fn nanos_to_millis(ns: i64) -> i64 {
    ns / 1_000_000
}

fn write_leaf_value(value: &Value, out: &mut ProtoWriter) {
    match value {
        Value::Int(v) => out.write_int32(DIMENSIONS_VALUE_VALUE_INT, *v),
        Value::Long(v) => out.write_int64(DIMENSIONS_VALUE_VALUE_LONG, *v),
        Value::Float(v) => out.write_float(DIMENSIONS_VALUE_VALUE_FLOAT, *v),
        Value::Str(v) => out.write_string(DIMENSIONS_VALUE_VALUE_STR, v),
        // Dimension values are never doubles or byte strings.
        Value::Double(_) | Value::Bytes(_) => {}
    }
}

/// Writes a dimension key as a full DimensionsValue tree into the writer's
/// current message: the atom tag, then a value tuple grouping the key's
/// values by shared path prefix.
pub fn write_dimension(dimension: &HashableDimensionKey, out: &mut ProtoWriter) {
    let values = dimension.values();
    if values.is_empty() {
        return;
    }
    out.write_int32(DIMENSIONS_VALUE_FIELD, values[0].path.tag());
    let tuple = out.begin_nested(DIMENSIONS_VALUE_VALUE_TUPLE);
    let mut index = 0;
    write_dimension_subtree(values, &mut index, 0, 0, out);
    out.end_nested(tuple);
}

fn write_dimension_subtree(
    values: &[FieldValue],
    index: &mut usize,
    depth: usize,
    prefix: i32,
    out: &mut ProtoWriter,
) {
    while *index < values.len() {
        let value = &values[*index];
        let value_depth = value.path.depth();
        if value.path.prefix(depth) != prefix {
            return;
        }
        let field_num = u32::from(value.path.raw_pos_at(depth));
        if value_depth == depth {
            let leaf = out.begin_nested(DIMENSIONS_VALUE_TUPLE_DIMENSIONS_VALUE);
            out.write_int32(DIMENSIONS_VALUE_FIELD, field_num as i32);
            write_leaf_value(&value.value, out);
            out.end_nested(leaf);
            *index += 1;
        } else if value_depth > depth {
            let node = out.begin_nested(DIMENSIONS_VALUE_TUPLE_DIMENSIONS_VALUE);
            out.write_int32(DIMENSIONS_VALUE_FIELD, field_num as i32);
            let tuple = out.begin_nested(DIMENSIONS_VALUE_VALUE_TUPLE);
            write_dimension_subtree(values, index, value_depth, value.path.prefix(value_depth), out);
            out.end_nested(tuple);
            out.end_nested(node);
        } else {
            return;
        }
    }
}

/// Writes each value of a dimension key as a value-only DimensionsValue
/// under the given repeated field; used when the path prefix was emitted
/// separately.
pub fn write_dimension_leaf_nodes(
    dimension: &HashableDimensionKey,
    leaf_field_id: u32,
    out: &mut ProtoWriter,
) {
    for value in dimension.values() {
        let token = out.begin_nested(leaf_field_id);
        write_leaf_value(&value.value, out);
        out.end_nested(token);
    }
}

/// Writes the shared dimension path of a selector tree as a value-less
/// DimensionsValue tree into the writer's current message.
pub fn write_dimension_path(selector: &FieldSelector, out: &mut ProtoWriter) {
    out.write_int32(DIMENSIONS_VALUE_FIELD, selector.field);
    if selector.children.is_empty() {
        return;
    }
    let tuple = out.begin_nested(DIMENSIONS_VALUE_VALUE_TUPLE);
    for child in &selector.children {
        let node = out.begin_nested(DIMENSIONS_VALUE_TUPLE_DIMENSIONS_VALUE);
        write_dimension_path(child, out);
        out.end_nested(node);
    }
    out.end_nested(tuple);
}

/// Writes an atom's projected field values as a nested message keyed by the
/// atom id. Depth-1 values are repeated primitive leaves; depth-2 values
/// are occurrences of a repeated sub-message.
pub fn write_field_value_tree(atom_id: i32, values: &[FieldValue], out: &mut ProtoWriter) {
    let atom = out.begin_nested(atom_id as u32);
    let mut index = 0;
    write_atom_subtree(values, &mut index, 0, 0, out);
    out.end_nested(atom);
}

fn write_atom_leaf(field_num: u32, value: &Value, out: &mut ProtoWriter) {
    match value {
        Value::Int(v) => out.write_int32(field_num, *v),
        Value::Long(v) => out.write_int64(field_num, *v),
        Value::Float(v) => out.write_float(field_num, *v),
        Value::Double(v) => out.write_double(field_num, *v),
        Value::Str(v) => out.write_string(field_num, v),
        Value::Bytes(v) => out.write_bytes(field_num, v),
    }
}

fn write_atom_subtree(
    values: &[FieldValue],
    index: &mut usize,
    depth: usize,
    prefix: i32,
    out: &mut ProtoWriter,
) {
    while *index < values.len() {
        let value = &values[*index];
        let value_depth = value.path.depth();
        if value.path.prefix(depth) != prefix {
            return;
        }
        let field_num = u32::from(value.path.index_at(depth));
        if value_depth == depth || value_depth == depth + 1 {
            // Equal depth: plain leaf. One deeper: the extra level is a
            // repeated-primitive occurrence slot and the leaf repeats under
            // this field number.
            write_atom_leaf(field_num, &value.value, out);
            *index += 1;
        } else if value_depth == depth + 2 {
            let node = out.begin_nested(field_num);
            write_atom_subtree(values, index, value_depth, value.path.prefix(value_depth), out);
            out.end_nested(node);
        } else {
            return;
        }
    }
}
