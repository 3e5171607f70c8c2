//! End-to-end tests of the update engine against literal tuples.

use rust_decimal::Decimal;
use std::str::FromStr;
use twine_core::Region;
use twine_mp as mp;
use twine_tuple::{
    update_check_ops, update_execute, upsert_execute, upsert_squash, TupleDict, UpdateError,
};

/// Literal MsgPack value for test construction.
#[derive(Clone)]
enum V {
    U(u64),
    I(i64),
    D(f64),
    S(&'static str),
    Dec(&'static str),
    A(Vec<V>),
    M(Vec<(&'static str, V)>),
}

fn enc(v: &V, out: &mut Vec<u8>) {
    match v {
        V::U(x) => mp::write_uint(out, *x),
        V::I(x) => mp::write_int(out, *x),
        V::D(x) => mp::write_double(out, *x),
        V::S(s) => mp::write_str(out, s.as_bytes()),
        V::Dec(s) => mp::write_decimal(out, &Decimal::from_str(s).unwrap()),
        V::A(items) => {
            mp::write_array(out, items.len() as u32);
            for item in items {
                enc(item, out);
            }
        }
        V::M(pairs) => {
            mp::write_map(out, pairs.len() as u32);
            for (k, val) in pairs {
                mp::write_str(out, k.as_bytes());
                enc(val, out);
            }
        }
    }
}

fn tuple(fields: &[V]) -> Vec<u8> {
    let mut out = Vec::new();
    enc(&V::A(fields.to_vec()), &mut out);
    out
}

/// One op as `[opcode, field, args...]`; `field` is itself a V so both
/// numbers and path strings work.
fn ops(list: &[(&str, V, Vec<V>)]) -> Vec<u8> {
    let mut out = Vec::new();
    mp::write_array(&mut out, list.len() as u32);
    for (opcode, field, args) in list {
        mp::write_array(&mut out, 2 + args.len() as u32);
        mp::write_str(&mut out, opcode.as_bytes());
        enc(field, &mut out);
        for a in args {
            enc(a, &mut out);
        }
    }
    out
}

fn run(expr: &[u8], old: &[u8], dict: &TupleDict) -> Result<(Vec<u8>, u64), UpdateError> {
    let region = Region::default();
    update_execute(&region, expr, old, dict, 1).map(|r| (r.tuple, r.column_mask))
}

#[test]
fn arith_add_to_second_field() {
    // [1,2,3] with ['+',2,10] -> [1,12,3]
    let old = tuple(&[V::U(1), V::U(2), V::U(3)]);
    let expr = ops(&[("+", V::U(2), vec![V::U(10)])]);
    let (new, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1), V::U(12), V::U(3)]));
    assert_eq!(mask, 1 << 1);
}

#[test]
fn insert_appends_one_past_the_end() {
    // [1,2,3] with ['!',4,4] -> [1,2,3,4]
    let old = tuple(&[V::U(1), V::U(2), V::U(3)]);
    let expr = ops(&[("!", V::U(4), vec![V::U(4)])]);
    let (new, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1), V::U(2), V::U(3), V::U(4)]));
    // Insertions shift the tail: a range starting at field 3.
    assert_eq!(mask, !((1u64 << 3) - 1));
}

#[test]
fn delete_too_far_behind_the_tail_fails() {
    // [1,2,3] with ['#',-4,1] -> no such field
    let old = tuple(&[V::U(1), V::U(2), V::U(3)]);
    let expr = ops(&[("#", V::I(-4), vec![V::U(1)])]);
    let err = run(&expr, &old, &TupleDict::new()).unwrap_err();
    assert!(matches!(err, UpdateError::NoSuchFieldNo(-4)));
}

#[test]
fn json_path_update_in_nested_array() {
    // field "a" = {"b":[10,20,30]}; ['=','a.b[2]',99] -> {"b":[10,99,30]}
    let old = tuple(&[V::M(vec![("b", V::A(vec![V::U(10), V::U(20), V::U(30)]))])]);
    let dict = TupleDict::from_names(["a"]);
    let expr = ops(&[("=", V::S("a.b[2]"), vec![V::U(99)])]);
    let (new, _) = run(&expr, &old, &dict).unwrap();
    assert_eq!(
        new,
        tuple(&[V::M(vec![("b", V::A(vec![V::U(10), V::U(99), V::U(30)]))])])
    );
}

#[test]
fn json_path_with_bracket_head() {
    let old = tuple(&[V::M(vec![("b", V::A(vec![V::U(10), V::U(20), V::U(30)]))])]);
    let expr = ops(&[("=", V::S("[1].b[1]"), vec![V::U(5)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(
        new,
        tuple(&[V::M(vec![("b", V::A(vec![V::U(5), V::U(20), V::U(30)]))])])
    );
}

#[test]
fn empty_op_list_is_identity() {
    let old = tuple(&[V::U(1), V::S("two"), V::A(vec![V::U(3)])]);
    let expr = ops(&[]);
    let (new, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, old);
    assert_eq!(mask, 0);
}

#[test]
fn set_to_existing_value_is_identity() {
    let old = tuple(&[V::U(1), V::S("two")]);
    let expr = ops(&[("=", V::U(2), vec![V::S("two")])]);
    let (new, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, old);
    assert_eq!(mask, 1 << 1);
}

#[test]
fn independent_ops_commute() {
    let old = tuple(&[V::U(1), V::U(2), V::S("abc"), V::U(4)]);
    let ab = ops(&[
        ("+", V::U(2), vec![V::U(5)]),
        (":", V::U(3), vec![V::I(1), V::I(1), V::S("XY")]),
    ]);
    let ba = ops(&[
        (":", V::U(3), vec![V::I(1), V::I(1), V::S("XY")]),
        ("+", V::U(2), vec![V::U(5)]),
    ]);
    let (r1, _) = run(&ab, &old, &TupleDict::new()).unwrap();
    let (r2, _) = run(&ba, &old, &TupleDict::new()).unwrap();
    assert_eq!(r1, r2);
    assert_eq!(r1, tuple(&[V::U(1), V::U(7), V::S("XYbc"), V::U(4)]));
}

#[test]
fn set_one_past_the_end_appends() {
    let old = tuple(&[V::U(1)]);
    let expr = ops(&[("=", V::U(2), vec![V::U(2)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1), V::U(2)]));
}

#[test]
fn set_far_past_the_end_fails() {
    let old = tuple(&[V::U(1)]);
    let expr = ops(&[("=", V::U(3), vec![V::U(3)])]);
    assert!(run(&expr, &old, &TupleDict::new()).is_err());
}

#[test]
fn negative_index_addresses_the_tail() {
    let old = tuple(&[V::U(1), V::U(2), V::U(3)]);
    let expr = ops(&[("=", V::I(-1), vec![V::U(30)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1), V::U(2), V::U(30)]));
}

#[test]
fn delete_count_is_clamped() {
    let old = tuple(&[V::U(1), V::U(2), V::U(3)]);
    let expr = ops(&[("#", V::U(2), vec![V::U(100)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1)]));
}

#[test]
fn insert_in_the_middle_shifts_fields() {
    let old = tuple(&[V::U(1), V::U(3)]);
    let expr = ops(&[("!", V::U(2), vec![V::U(2)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(1), V::U(2), V::U(3)]));
}

#[test]
fn field_numbers_follow_earlier_structural_ops() {
    // After deleting field 1, the op on field 1 hits the old field 2.
    let old = tuple(&[V::U(10), V::U(20)]);
    let expr = ops(&[
        ("#", V::U(1), vec![V::U(1)]),
        ("+", V::U(1), vec![V::U(1)]),
    ]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(21)]));
}

#[test]
fn bitwise_ops_apply() {
    let old = tuple(&[V::U(0b1100)]);
    let expr = ops(&[("&", V::U(1), vec![V::U(0b1010)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(0b1000)]));

    let expr = ops(&[("|", V::U(1), vec![V::U(0b0011)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(0b1111)]));

    let expr = ops(&[("^", V::U(1), vec![V::U(0b0110)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::U(0b1010)]));
}

#[test]
fn bitwise_on_negative_fails() {
    let old = tuple(&[V::I(-1)]);
    let expr = ops(&[("&", V::U(1), vec![V::U(1)])]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::ArgType { .. })
    ));
}

#[test]
fn splice_with_negative_offset() {
    let old = tuple(&[V::S("hello")]);
    // Offset -1 means "after the last byte": append.
    let expr = ops(&[(":", V::U(1), vec![V::I(-1), V::I(0), V::S("!")])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::S("hello!")]));
}

#[test]
fn splice_offset_before_minus_len_fails() {
    let old = tuple(&[V::S("abc")]);
    let expr = ops(&[(":", V::U(1), vec![V::I(-5), V::I(0), V::S("x")])]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::Splice { .. })
    ));
}

#[test]
fn splice_replaces_a_middle_range() {
    let old = tuple(&[V::S("hello")]);
    // 1-based offset 2: cut "el", paste "EL".
    let expr = ops(&[(":", V::U(1), vec![V::I(2), V::I(2), V::S("EL")])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::S("hELlo")]));
}

#[test]
fn arith_with_double_promotes() {
    let old = tuple(&[V::U(1)]);
    let expr = ops(&[("+", V::U(1), vec![V::D(0.5)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::D(1.5)]));
}

#[test]
fn arith_with_decimal_promotes() {
    let old = tuple(&[V::Dec("1.10")]);
    let expr = ops(&[("+", V::U(1), vec![V::U(1)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::Dec("2.10")]));
}

#[test]
fn integer_overflow_is_reported() {
    let old = tuple(&[V::U(u64::MAX)]);
    let expr = ops(&[("+", V::U(1), vec![V::U(1)])]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::IntegerOverflow { .. })
    ));
}

#[test]
fn two_terminal_ops_on_one_field_fail() {
    let old = tuple(&[V::U(1)]);
    let expr = ops(&[
        ("+", V::U(1), vec![V::U(1)]),
        ("+", V::U(1), vec![V::U(1)]),
    ]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::DoubleUpdate(_))
    ));
}

#[test]
fn map_key_set_missing_auto_inserts() {
    let old = tuple(&[V::M(vec![("x", V::U(1))])]);
    let expr = ops(&[("=", V::S("[1].y"), vec![V::U(2)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    // New pairs are inserted at the front of the map.
    assert_eq!(new, tuple(&[V::M(vec![("y", V::U(2)), ("x", V::U(1))])]));
}

#[test]
fn map_insert_duplicate_key_fails() {
    let old = tuple(&[V::M(vec![("x", V::U(1))])]);
    let expr = ops(&[("!", V::S("[1].x"), vec![V::U(2)])]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::Duplicate(_))
    ));
}

#[test]
fn map_delete_removes_the_pair() {
    let old = tuple(&[V::M(vec![("x", V::U(1)), ("y", V::U(2))])]);
    let expr = ops(&[("#", V::S("[1].x"), vec![V::U(1)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::M(vec![("y", V::U(2))])]));
}

#[test]
fn map_delete_more_than_one_fails() {
    let old = tuple(&[V::M(vec![("x", V::U(1)), ("y", V::U(2))])]);
    let expr = ops(&[("#", V::S("[1].x"), vec![V::U(2)])]);
    assert!(run(&expr, &old, &TupleDict::new()).is_err());
}

#[test]
fn nested_array_insert_via_path() {
    let old = tuple(&[V::A(vec![V::U(1), V::U(2)])]);
    let expr = ops(&[("!", V::S("[1][3]"), vec![V::U(3)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::A(vec![V::U(1), V::U(2), V::U(3)])]));
}

#[test]
fn nested_array_delete_via_path() {
    let old = tuple(&[V::A(vec![V::U(1), V::U(2), V::U(3)])]);
    let expr = ops(&[("#", V::S("[1][2]"), vec![V::U(2)])]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(new, tuple(&[V::A(vec![V::U(1)])]));
}

#[test]
fn sibling_paths_branch_into_one_subtree() {
    let old = tuple(&[V::M(vec![
        ("a", V::A(vec![V::U(10), V::U(20)])),
        ("b", V::U(7)),
    ])]);
    let expr = ops(&[
        ("=", V::S("[1].a[1]"), vec![V::U(11)]),
        ("=", V::S("[1].a[2]"), vec![V::U(22)]),
        ("+", V::S("[1].b"), vec![V::U(1)]),
    ]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(
        new,
        tuple(&[V::M(vec![
            ("a", V::A(vec![V::U(11), V::U(22)])),
            ("b", V::U(8)),
        ])])
    );
}

#[test]
fn shared_prefix_reuses_the_route() {
    let old = tuple(&[V::M(vec![(
        "a",
        V::A(vec![V::U(1), V::U(2), V::U(3), V::U(4)]),
    )])]);
    let expr = ops(&[
        ("=", V::S("[1].a[1]"), vec![V::U(101)]),
        ("=", V::S("[1].a[2]"), vec![V::U(102)]),
        ("=", V::S("[1].a[4]"), vec![V::U(104)]),
    ]);
    let (new, _) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(
        new,
        tuple(&[V::M(vec![(
            "a",
            V::A(vec![V::U(101), V::U(102), V::U(3), V::U(104)]),
        )])])
    );
}

#[test]
fn exact_same_path_twice_fails() {
    let old = tuple(&[V::M(vec![("a", V::U(1))])]);
    let expr = ops(&[
        ("=", V::S("[1].a"), vec![V::U(2)]),
        ("=", V::S("[1].a"), vec![V::U(3)]),
    ]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::DoubleUpdate(_))
    ));
}

#[test]
fn diving_below_a_replaced_value_fails() {
    let old = tuple(&[V::M(vec![("a", V::M(vec![("b", V::U(1))]))])]);
    let expr = ops(&[
        ("=", V::S("[1].a"), vec![V::U(2)]),
        ("=", V::S("[1].a.b"), vec![V::U(3)]),
    ]);
    assert!(run(&expr, &old, &TupleDict::new()).is_err());
}

#[test]
fn check_ops_validates_without_a_tuple() {
    let good = ops(&[("+", V::U(2), vec![V::U(1)])]);
    assert!(update_check_ops(&good, &TupleDict::new(), 1).is_ok());

    let bad = ops(&[("?", V::U(2), vec![V::U(1)])]);
    assert!(matches!(
        update_check_ops(&bad, &TupleDict::new(), 1),
        Err(UpdateError::UnknownOp)
    ));
}

#[test]
fn upsert_skips_failing_ops() {
    let old = tuple(&[V::S("text"), V::U(5)]);
    let expr = ops(&[
        ("+", V::U(1), vec![V::U(1)]), // '+' on a string: skipped
        ("+", V::U(2), vec![V::U(1)]),
    ]);
    let region = Region::default();
    let res = upsert_execute(&region, &expr, &old, &TupleDict::new(), 1, true).unwrap();
    assert_eq!(res.tuple, tuple(&[V::S("text"), V::U(6)]));
}

#[test]
fn squash_folds_arithmetic_and_prefers_second_set() {
    // left = [['+',2,1],['=',3,"x"]], right = [['-',2,4],['=',3,"y"]]
    // -> [['-',2,3],['=',3,"y"]]
    let left = ops(&[
        ("+", V::U(2), vec![V::U(1)]),
        ("=", V::U(3), vec![V::S("x")]),
    ]);
    let right = ops(&[
        ("-", V::U(2), vec![V::U(4)]),
        ("=", V::U(3), vec![V::S("y")]),
    ]);
    let region = Region::default();
    let squashed = upsert_squash(&region, &left, &right, &TupleDict::new(), 1)
        .unwrap()
        .expect("squashable");
    let expected = ops(&[
        ("-", V::U(2), vec![V::U(3)]),
        ("=", V::U(3), vec![V::S("y")]),
    ]);
    assert_eq!(squashed, expected);

    // Applying the squashed list equals applying both in order.
    let old = tuple(&[V::U(0), V::U(10), V::S("old")]);
    let step1 = run(&left, &old, &TupleDict::new()).unwrap().0;
    let step2 = run(&right, &step1, &TupleDict::new()).unwrap().0;
    let direct = run(&squashed, &old, &TupleDict::new()).unwrap().0;
    assert_eq!(step2, direct);
}

#[test]
fn squash_rejects_unsupported_shapes() {
    let region = Region::default();
    let arith = ops(&[("+", V::U(2), vec![V::U(1)])]);
    // Delete is not squashable.
    let del = ops(&[("#", V::U(2), vec![V::U(1)])]);
    assert!(upsert_squash(&region, &arith, &del, &TupleDict::new(), 1)
        .unwrap()
        .is_none());
    // Decreasing field order is not squashable.
    let unordered = ops(&[
        ("+", V::U(3), vec![V::U(1)]),
        ("+", V::U(2), vec![V::U(1)]),
    ]);
    assert!(
        upsert_squash(&region, &unordered, &arith, &TupleDict::new(), 1)
            .unwrap()
            .is_none()
    );
    // Ops against the protected first field are not squashable.
    let pk = ops(&[("+", V::U(1), vec![V::U(1)])]);
    assert!(upsert_squash(&region, &pk, &pk, &TupleDict::new(), 1)
        .unwrap()
        .is_none());
}

#[test]
fn squash_merges_disjoint_lists_in_field_order() {
    let left = ops(&[("+", V::U(2), vec![V::U(1)])]);
    let right = ops(&[("+", V::U(4), vec![V::U(2)])]);
    let region = Region::default();
    let squashed = upsert_squash(&region, &left, &right, &TupleDict::new(), 1)
        .unwrap()
        .expect("squashable");
    let expected = ops(&[
        ("+", V::U(2), vec![V::U(1)]),
        ("+", V::U(4), vec![V::U(2)]),
    ]);
    assert_eq!(squashed, expected);
}

#[test]
fn column_mask_covers_every_changed_column() {
    let old = tuple(&[V::U(1), V::U(2), V::U(3), V::U(4)]);
    let expr = ops(&[
        ("+", V::U(2), vec![V::U(1)]),
        ("=", V::U(4), vec![V::U(9)]),
    ]);
    let (new, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(mask, (1 << 1) | (1 << 3));
    assert_eq!(new, tuple(&[V::U(1), V::U(3), V::U(3), V::U(9)]));
}

#[test]
fn column_mask_saturates_past_63() {
    let fields: Vec<V> = (0..70u64).map(V::U).collect();
    let old = tuple(&fields);
    let expr = ops(&[("=", V::U(70), vec![V::U(0)])]);
    let (_, mask) = run(&expr, &old, &TupleDict::new()).unwrap();
    assert_eq!(mask, 1 << 63);
}

#[test]
fn garbage_after_ops_is_rejected() {
    let mut expr = ops(&[("+", V::U(2), vec![V::U(1)])]);
    expr.push(0x01);
    let old = tuple(&[V::U(1), V::U(2)]);
    assert!(matches!(
        run(&expr, &old, &TupleDict::new()),
        Err(UpdateError::IllegalParams(_))
    ));
}
