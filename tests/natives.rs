use melee::{run, ErrorKind};
use pretty_assertions::assert_eq;

fn show(source: &str) -> String {
    run(source).expect("Execution failed").to_string()
}

fn kind(source: &str) -> ErrorKind {
    run(source).expect_err("expected an error").kind
}

#[test]
fn test_range_rejects_bad_bounds() {
    assert!(matches!(kind("range(-100)"), ErrorKind::RuntimeError(_)));
    assert!(matches!(kind("range(3, 1)"), ErrorKind::RuntimeError(_)));
    assert_eq!(
        kind("range(true)"),
        ErrorKind::TypeMismatch("int".into(), "bool".into())
    );
    assert_eq!(kind("range(1, 2, 3)"), ErrorKind::WrongArity("1 or 2".into(), 3));
}

#[test]
fn test_for_over_range() {
    let source = r#"
        total := 0
        for i in range(1, 5) { total += i }
        total
    "#;
    assert_eq!(show(source), "10");
}

#[test]
fn test_sort_mutates_shared_array() {
    let source = r#"
        a := [5, 3, 9, 1]
        b := a
        sort(b)
        a
    "#;
    assert_eq!(show(source), "[1, 3, 5, 9]");
    assert!(matches!(kind("sort([1, true])"), ErrorKind::TypeMismatch(..)));
}

#[test]
fn test_higher_order_natives() {
    let source = r#"
        scale := [0, 2, 4, 5, 7]
        up := fn(step) { return 60 + step }
        map(filter(scale, fn(s) { return s % 2 == 0 }), up)
    "#;
    assert_eq!(show(source), "[60, 62, 64]");
    assert_eq!(kind("map([1], 5)"), ErrorKind::NotCallable("int".into()));
}

#[test]
fn test_cycle_follows_array_contents() {
    let source = r#"
        pattern := [1, 2]
        c := cycle(pattern)
        first := next c
        push(pattern, 3);
        [first, next c, next c, next c]
    "#;
    assert_eq!(show(source), "[1, 2, 3, 1]");
}

#[test]
fn test_merge_with_finished_generator() {
    let source = r#"
        once := gen() { yield note [60] }
        take(merge(once(), cycle([cc [1, 2]])), 2)
    "#;
    assert_eq!(show(source), "[[note(60, 1, 64), cc(1, 2)], [null, cc(1, 2)]]");
}

#[test]
fn test_poly_holds_each_voice_independently() {
    let source = r#"
        lead := gen() { loop { yield note [72, 2]; yield note [74] } }
        pad := gen() { loop { yield note [48, 3] } }
        take(poly(lead(), pad()), 4)
    "#;
    assert_eq!(
        show(source),
        "[[note(72, 2, 64), note(48, 3, 64)], \
[hold(72, 1), hold(48, 2)], \
[note(74, 1, 64), hold(48, 1)], \
[note(72, 2, 64), note(48, 3, 64)]]"
    );
}

#[test]
fn test_poly_holds_rests() {
    let source = r#"
        g := gen() { loop { yield skip 2; yield note [60] } }
        take(poly(g()), 3)
    "#;
    assert_eq!(show(source), "[[skip(2)], [hold(-1, 1)], [note(60, 1, 64)]]");
}

#[test]
fn test_sequence_natives_reject_plain_values() {
    assert_eq!(
        kind("poly([1])"),
        ErrorKind::TypeMismatch("seq".into(), "array".into())
    );
    assert_eq!(
        kind("take(3, 1)"),
        ErrorKind::TypeMismatch("seq".into(), "int".into())
    );
    assert_eq!(
        kind("next 5"),
        ErrorKind::TypeMismatch("seq".into(), "int".into())
    );
}

#[test]
fn test_natives_are_read_only() {
    assert_eq!(kind("len = 1"), ErrorKind::ReadOnlyBinding("len".into()));
}

#[test]
fn test_conv_transposes_a_pattern() {
    let source = r#"
        up := fn(event) { return note [event + 12] }
        take(conv(cycle([48, 50]), up), 3)
    "#;
    assert_eq!(show(source), "[note(60, 1, 64), note(62, 1, 64), note(60, 1, 64)]");
    assert_eq!(kind("conv(cycle([1]), 3)"), ErrorKind::NotCallable("int".into()));
}
