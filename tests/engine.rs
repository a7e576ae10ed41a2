//! Whole-module engine behavior: parallelism, isolation, reporting.

use deflatten::prelude::*;

fn flattened_method(token: u32) -> MethodBody {
    let mut builder = MethodBuilder::new();
    builder.token(token);
    builder.local_32();
    builder.block("entry").load_const(1).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(3)
        .rem_un()
        .switch(&["c0", "c1", "done"])
        .fall_through("done");
    builder.block("c0").load_const(2).br("dispatcher");
    builder.block("c1").load_const(2).br("dispatcher");
    builder.block("done").ret();
    builder.finish().unwrap()
}

fn plain_method(token: u32) -> MethodBody {
    let mut builder = MethodBuilder::new();
    builder.token(token);
    builder.block("entry").load_const(7).pop().fall_through("exit");
    builder.block("exit").ret();
    builder.finish().unwrap()
}

#[test]
fn parallel_run_reports_per_method_outcomes() {
    let mut bodies = vec![
        flattened_method(0x0600_0001),
        plain_method(0x0600_0002),
        flattened_method(0x0600_0003),
        plain_method(0x0600_0004),
        flattened_method(0x0600_0005),
    ];

    let engine = Engine::default();
    let report = engine.deobfuscate_all(&mut bodies);

    let tokens = |v: &[MethodToken]| v.iter().map(|t| t.value()).collect::<Vec<_>>();
    assert_eq!(
        tokens(&report.deflattened),
        vec![0x0600_0001, 0x0600_0003, 0x0600_0005]
    );
    assert_eq!(tokens(&report.untouched), vec![0x0600_0002, 0x0600_0004]);
    assert_eq!(
        engine.context().events.count(EventKind::MethodDeflattened),
        3
    );
    assert!(report.summary().starts_with("3 method(s) deflattened, 2 untouched"));

    // Every flattened body was actually mutated; the plain ones were not.
    for body in &bodies {
        let has_switch = body
            .blocks
            .iter()
            .any(|b| b.instructions.iter().any(|i| i.opcode == OpCode::Switch));
        assert!(!has_switch, "method {} still dispatches", body.token);
    }
}

#[test]
fn failing_method_does_not_affect_siblings() {
    // The middle method's handler layout is corrupted; its failure must stay
    // contained while the siblings deflatten normally.
    let mut builder = MethodBuilder::new();
    builder.token(0x0600_0012);
    builder.block("a").ret();
    builder.block("b").ret();
    let mut broken = builder.finish().unwrap();
    broken.layout = vec![deflatten::cfg::LayoutNode::Block(BlockId::new(0))];

    let mut bodies = vec![
        flattened_method(0x0600_0011),
        broken,
        flattened_method(0x0600_0013),
    ];

    let engine = Engine::default();
    let report = engine.deobfuscate_all(&mut bodies);

    assert_eq!(report.deflattened.len(), 2);
    assert_eq!(report.untouched.len(), 1);
    assert_eq!(report.untouched[0].value(), 0x0600_0012);
    assert_eq!(
        engine.context().events.count(EventKind::ResolutionAborted),
        1
    );
}

#[test]
fn malformed_layout_is_an_error_for_direct_callers() {
    let mut builder = MethodBuilder::new();
    builder.block("a").ret();
    builder.block("b").ret();
    let mut body = builder.finish().unwrap();
    body.layout = vec![deflatten::cfg::LayoutNode::Block(BlockId::new(0))];

    let engine = Engine::default();
    assert!(matches!(
        engine.deobfuscate_method(&mut body),
        Err(Error::MalformedLayout { .. })
    ));
}

#[test]
fn context_skips_already_deflattened_methods() {
    let engine = Engine::default();
    let mut body = flattened_method(0x0600_0021);

    assert!(engine.deobfuscate_method(&mut body).unwrap());
    assert!(engine.context().is_deflattened(body.token));
    assert!(engine.context().is_dispatcher(body.token));

    // Second run through the same engine short-circuits via the context.
    let before = body.clone();
    assert!(!engine.deobfuscate_method(&mut body).unwrap());
    assert_eq!(body, before);
}
