use melee::{run, ErrorCategory, ErrorKind, Runtime, Value, VmConfig};
use pretty_assertions::assert_eq;

fn kind(source: &str) -> ErrorKind {
    run(source).expect_err("expected an error").kind
}

#[test]
fn test_compile_errors_point_at_source() {
    let err = run("x := 1\ny := x + z").expect_err("expected an error");
    assert_eq!(err.kind, ErrorKind::UndefinedVariable("z".into()));
    assert_eq!(err.category(), ErrorCategory::Compile);
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.column(), Some(10));

    let text = err.to_string();
    assert!(text.starts_with("[line 2:10] Compile error: undefined variable 'z'"));
    assert!(text.contains("  | y := x + z"));
}

#[test]
fn test_every_failing_statement_is_reported() {
    let mut runtime = Runtime::new();
    let errors = runtime.check("a := b\nbreak\nc := 1\nreturn c");
    let kinds: Vec<ErrorKind> = errors.into_iter().map(|err| err.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ErrorKind::UndefinedVariable("b".into()),
            ErrorKind::BreakOutsideLoop,
            ErrorKind::ReturnOutsideFunction,
        ]
    );
    // the dry run left nothing behind
    assert_eq!(runtime.exec("c").unwrap_err().len(), 1);
}

#[test]
fn test_syntax_errors() {
    assert_eq!(kind("x := 1 +"), ErrorKind::ExpectedExpression("EOF".into()));
    assert_eq!(kind("loop { x := 1 }"), ErrorKind::UnboundedLoop);
    assert_eq!(kind("x := 1 $"), ErrorKind::UnexpectedCharacter('$'));
    assert_eq!(kind("yield 1"), ErrorKind::YieldOutsideFunction);
}

#[test]
fn test_runtime_errors() {
    assert_eq!(kind("10 / (5 - 5)"), ErrorKind::DivisionByZero);
    assert_eq!(
        kind("f := fn(x) { return -x }; f(true)"),
        ErrorKind::TypeMismatch("int".into(), "bool".into())
    );
    assert_eq!(kind("null()"), ErrorKind::NotCallable("null".into()));
    assert_eq!(kind("a := [1, 2]; a[2] = 5"), ErrorKind::IndexOutOfBounds(2, 2));
    assert_eq!(run("[1, 2][5]").expect("Execution failed"), Value::Null);
}

#[test]
fn test_sequence_misuse() {
    assert_eq!(
        kind("s := null; g := gen() { yield next s }; s = g(); next s"),
        ErrorKind::SequenceRunning
    );
    assert_eq!(kind("f := fn() { yield 1 }; f()"), ErrorKind::YieldOutsideSequence);
    assert_eq!(
        kind("g := gen() { map([1], fn(x) { yield x }); yield 0 }; s := g(); next s"),
        ErrorKind::RuntimeError("cannot yield across a native call".into())
    );
}

#[test]
fn test_limits_are_configurable() {
    let mut runtime = Runtime::with_config(VmConfig::default().with_max_frames(16));
    let errors = runtime
        .exec("down := fn(n) { if n == 0 { return 0 }; return down(n - 1) }; down(100)")
        .unwrap_err();
    assert_eq!(errors[0].kind, ErrorKind::FrameOverflow(16));

    // the session survives a runtime error
    assert_eq!(runtime.exec("down(5)").unwrap(), Value::Int(0));
}

#[test]
fn test_nested_sequences_are_bounded() {
    let mut runtime = Runtime::with_config(VmConfig::default().with_max_frames(8));
    let errors = runtime
        .exec("chain := gen(n) { if n == 0 { yield 0 }; yield next chain(n - 1) }; next chain(20)")
        .unwrap_err();
    assert_eq!(errors[0].kind, ErrorKind::FrameOverflow(8));
}

#[test]
fn test_main_contract() {
    let mut runtime = Runtime::new();
    assert_eq!(runtime.start(Vec::new()).unwrap_err().kind, ErrorKind::MissingMain);

    runtime.exec("main := null").unwrap();
    assert_eq!(runtime.start(Vec::new()).unwrap_err().kind, ErrorKind::MissingMain);

    runtime.exec("main = [1]").unwrap();
    assert_eq!(
        runtime.start(Vec::new()).unwrap_err().kind,
        ErrorKind::MainNotGenerator("array".into())
    );

    runtime.exec("main = gen(root) { loop { yield note [root] } }").unwrap();
    runtime.start(vec![Value::Int(48)]).unwrap();
    let events = runtime.clock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].to_string(), "note(48, 1, 64)");
}

#[test]
fn test_runtime_errors_point_at_the_failing_expression() {
    let err = run("f := fn(n) {\n    return n / 0\n}\nf(1)").expect_err("expected an error");
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.category(), ErrorCategory::Runtime);
    assert_eq!((err.line(), err.column()), (Some(2), Some(12)));
    assert!(err.to_string().contains("  |     return n / 0"));

    let err = run("a := [1]\n\nlen(5)").expect_err("expected an error");
    assert_eq!(err.line(), Some(3));
}
