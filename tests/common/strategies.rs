use orchbus_core::FieldValues;
use proptest::prelude::*;

/// A producer-side operation on one key
#[derive(Debug, Clone, PartialEq)]
pub enum StateOp {
    Set(FieldValues),
    Del,
}

/// Strategy for table keys
pub fn key_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9]{0,7}"
}

/// Strategy for non-empty field sets drawn from a small field alphabet so
/// successive writes overlap
pub fn field_values_strategy() -> impl Strategy<Value = FieldValues> {
    prop::collection::btree_map("[a-d]", "[0-9]{1,3}", 1..4)
        .prop_map(|fields| fields.into_iter().collect())
}

pub fn state_op_strategy() -> impl Strategy<Value = StateOp> {
    prop_oneof![
        3 => field_values_strategy().prop_map(StateOp::Set),
        1 => Just(StateOp::Del),
    ]
}

/// Strategy for a burst of operations on one key between two pops
pub fn state_ops_strategy() -> impl Strategy<Value = Vec<StateOp>> {
    prop::collection::vec(state_op_strategy(), 1..20)
}

/// What a single pop must emit for a fresh key after `ops`
///
/// Writes merge per field into the staged record, a delete discards it.
/// `None` means the pop must emit a delete.
pub fn expected_after(ops: &[StateOp]) -> Option<FieldValues> {
    let mut staged: FieldValues = Vec::new();
    for op in ops {
        match op {
            StateOp::Set(fields) => {
                for (field, value) in fields {
                    match staged.iter_mut().find(|(f, _)| f == field) {
                        Some(existing) => existing.1 = value.clone(),
                        None => staged.push((field.clone(), value.clone())),
                    }
                }
            }
            StateOp::Del => staged.clear(),
        }
    }
    if staged.is_empty() {
        None
    } else {
        staged.sort();
        Some(staged)
    }
}
