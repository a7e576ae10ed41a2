//! End-to-end deflattening scenarios driven through the public API.

use deflatten::prelude::*;

/// Executes a body concretely, following fallthrough edges and dispatch
/// indices, until a `return`. Returns the visit order of non-empty blocks
/// (`exclude` drops the dispatcher from flattened runs so pre/post orders
/// compare) plus the final emulator for state inspection.
fn run_to_return(body: &MethodBody, exclude: Option<BlockId>) -> (Vec<BlockId>, Emulator) {
    let mut emulator = Emulator::new(body.locals.len(), Width::W32);
    let mut visited = Vec::new();
    let mut current = body.entry;
    for _ in 0..256 {
        let block = body.block(current);
        if Some(current) != exclude && !block.instructions.is_empty() {
            visited.push(current);
        }
        match block.last().map(|i| i.opcode) {
            Some(OpCode::Switch) => {
                let body_len = block.instructions.len() - 1;
                emulator
                    .execute(&block.instructions[..body_len])
                    .expect("dispatch prefix evaluates");
                let index = emulator
                    .pop()
                    .expect("dispatch index on stack")
                    .as_known()
                    .expect("dispatch index is concrete") as usize;
                current = block
                    .targets
                    .get(index)
                    .copied()
                    .or(block.fallthrough)
                    .expect("dispatch lands somewhere");
            }
            Some(OpCode::Ret) => {
                return (visited, emulator);
            }
            _ => {
                emulator
                    .execute(&block.instructions)
                    .expect("block evaluates");
                current = block.fallthrough.expect("non-terminal block continues");
            }
        }
    }
    panic!("method did not return within fuel budget");
}

/// Scenario: 4-case dispatcher with a plain header, entered with constant 3.
/// The entry block must be rewired directly to case 3 and the terminal case
/// left untouched.
#[test]
fn direct_rewrite_to_constant_case() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder.block("entry").load_const(3).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(7)
        .rem_un()
        .switch(&["b0", "b1", "b2", "b3"])
        .fall_through("exit");
    builder.block("b0").ret();
    builder.block("b1").ret();
    builder.block("b2").ret();
    builder.block("b3").ret();
    builder.block("exit").ret();

    let entry = builder.block_id("entry").unwrap();
    let dispatcher = builder.block_id("dispatcher").unwrap();
    let b3 = builder.block_id("b3").unwrap();
    let mut body = builder.finish().unwrap();

    assert!(try_deobfuscate(&mut body));

    let rewired = body.block(entry);
    assert_eq!(rewired.fallthrough, Some(b3));
    assert_eq!(rewired.instructions.len(), 1);
    assert_eq!(rewired.instructions[0].opcode, OpCode::Branch);

    // The dispatcher is stripped and marked for the external DCE pass.
    let stripped = body.block(dispatcher);
    assert!(stripped.instructions.is_empty());
    assert!(stripped.targets.is_empty());
    assert!(stripped.flags.contains(BlockFlags::DISPATCHER));
    assert!(stripped.flags.contains(BlockFlags::DEAD));

    // The terminal case keeps its body: no further expansion past a `ret`
    // whose only predecessor was the dispatcher.
    assert_eq!(body.block(b3).instructions.len(), 1);
    assert_eq!(body.block(b3).instructions[0].opcode, OpCode::Ret);
}

/// Scenario: two conditional arms with distinct xor/mul constants converge on
/// a shared root that falls into the dispatcher. Each arm must resolve
/// independently to its own case.
#[test]
fn shared_root_arms_resolve_independently() {
    let mut builder = MethodBuilder::new();
    builder.local_32().local_32();
    builder.block("entry").load_const(4).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(4)
        .rem_un()
        .switch(&["cond", "case_a", "case_b", "done"])
        .fall_through("done");
    builder
        .block("cond")
        .load_local(1)
        .cond_br("arm_b")
        .fall_through("arm_a");
    // (4 * 3) ^ xA = 13 -> 13 % 4 = 1 -> case_a
    builder
        .block("arm_a")
        .load_local(0)
        .load_const(3)
        .mul()
        .load_const((12 ^ 13) as i64)
        .xor()
        .br("root");
    // (4 * 5) ^ xB = 14 -> 14 % 4 = 2 -> case_b
    builder
        .block("arm_b")
        .load_local(0)
        .load_const(5)
        .mul()
        .load_const((20 ^ 14) as i64)
        .xor()
        .br("root");
    builder.block("root").nop().fall_through("dispatcher");
    builder.block("case_a").ret();
    builder.block("case_b").ret();
    builder.block("done").ret();

    let arm_a = builder.block_id("arm_a").unwrap();
    let arm_b = builder.block_id("arm_b").unwrap();
    let case_a = builder.block_id("case_a").unwrap();
    let case_b = builder.block_id("case_b").unwrap();
    let dispatcher = builder.block_id("dispatcher").unwrap();
    let mut body = builder.finish().unwrap();

    assert!(try_deobfuscate(&mut body));

    assert_eq!(body.block(arm_a).fallthrough, Some(case_a));
    assert_eq!(body.block(arm_b).fallthrough, Some(case_b));
    assert_eq!(body.block(arm_a).instructions.len(), 1);
    assert_eq!(body.block(arm_b).instructions.len(), 1);
    assert!(body.block(dispatcher).targets.is_empty());
}

/// Scenario: the header lacks the unsigned-remainder step. Detection must
/// refuse and the graph must be structurally identical afterwards.
#[test]
fn missing_remainder_fails_closed() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder.block("entry").load_const(1).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(4)
        .add() // not rem.un
        .switch(&["b0", "b1"])
        .fall_through("exit");
    builder.block("b0").ret();
    builder.block("b1").ret();
    builder.block("exit").ret();
    let mut body = builder.finish().unwrap();
    let original = body.clone();

    assert!(!try_deobfuscate(&mut body));
    assert_eq!(body, original);
}

/// An ordinary user switch without the dup/store/const/rem header is not a
/// dispatcher; the conservative guard leaves the method alone.
#[test]
fn user_switch_is_not_a_dispatcher() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder
        .block("entry")
        .load_local(0)
        .switch(&["b0", "b1"])
        .fall_through("exit");
    builder.block("b0").ret();
    builder.block("b1").ret();
    builder.block("exit").ret();
    let mut body = builder.finish().unwrap();
    let original = body.clone();

    assert!(!try_deobfuscate(&mut body));
    assert_eq!(body, original);
}

/// Builds a realistic xor-affine flattened loop body:
/// entry -> c0 -> c1 -> c2 -> done, all routed through the dispatcher.
fn flattened_chain() -> MethodBuilder {
    const KEY: u32 = 0x5A5A_5A5A;
    let mut builder = MethodBuilder::new();
    builder.local_32().local_32();
    builder
        .block("entry")
        .load_const(i64::from(KEY ^ 4)) // (raw ^ KEY) % 4 == 0 -> c0
        .fall_through("dispatcher");
    builder
        .block("dispatcher")
        .load_const(i64::from(KEY))
        .xor()
        .dup()
        .store_local(0)
        .load_const(4)
        .rem_un()
        .switch(&["c0", "c1", "c2", "done"])
        .fall_through("done");
    // state = 4 here; (4 * 3) ^ x0 -> xored state 5 -> case 1
    builder
        .block("c0")
        .load_const(11)
        .store_local(1)
        .load_local(0)
        .load_const(3)
        .mul()
        .load_const(i64::from(12 ^ KEY ^ 5))
        .xor()
        .br("dispatcher");
    // state = 5; (5 * 7) ^ x1 -> xored state 6 -> case 2
    builder
        .block("c1")
        .load_const(22)
        .store_local(1)
        .load_local(0)
        .load_const(7)
        .mul()
        .load_const(i64::from(35 ^ KEY ^ 6))
        .xor()
        .br("dispatcher");
    // plain constant reload -> xored state 7 -> case 3
    builder
        .block("c2")
        .load_const(i64::from(KEY ^ 7))
        .br("dispatcher");
    builder.block("done").ret();
    builder
}

/// Semantic equivalence: the rewritten method visits the same non-dispatcher
/// blocks in the same order and computes the same locals as the flattened
/// original.
#[test]
fn rewrite_preserves_visit_order_and_effects() {
    let builder = flattened_chain();
    let dispatcher = builder.block_id("dispatcher").unwrap();
    let mut body = builder.finish().unwrap();
    let original = body.clone();

    let (order_before, emu_before) = run_to_return(&original, Some(dispatcher));
    assert!(try_deobfuscate(&mut body));
    let (order_after, emu_after) = run_to_return(&body, None);

    assert_eq!(order_before, order_after);
    assert_eq!(emu_before.local(1), emu_after.local(1));
    assert_eq!(emu_after.local(1).as_known(), Some(22));

    // No multi-way branch survives anywhere in the method.
    assert!(body
        .blocks
        .iter()
        .all(|b| !b.instructions.iter().any(|i| i.opcode == OpCode::Switch)));
}

/// Running the resolver twice performs no further mutation: the dispatcher is
/// gone, so the second pass sees nothing to match.
#[test]
fn resolution_is_idempotent() {
    let mut body = flattened_chain().finish().unwrap();
    assert!(try_deobfuscate(&mut body));
    let resolved = body.clone();

    assert!(!try_deobfuscate(&mut body));
    assert_eq!(body, resolved);
}

/// A block that exists only to select the next state is bypassed entirely:
/// its fallthrough predecessor points at the resolved target and the block is
/// emptied for dead-code elimination.
#[test]
fn pure_state_block_is_elided() {
    let mut builder = MethodBuilder::new();
    builder.local_32().local_32();
    builder.block("entry").load_const(0).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(3)
        .rem_un()
        .switch(&["c0", "c1", "done"])
        .fall_through("done");
    builder
        .block("c0")
        .load_const(99)
        .store_local(1)
        .fall_through("update");
    // (0 * 5) ^ 1 = 1 -> case 1
    builder
        .block("update")
        .load_local(0)
        .load_const(5)
        .mul()
        .load_const(1)
        .xor()
        .fall_through("dispatcher");
    builder.block("c1").ret();
    builder.block("done").ret();

    let c0 = builder.block_id("c0").unwrap();
    let update = builder.block_id("update").unwrap();
    let c1 = builder.block_id("c1").unwrap();
    let mut body = builder.finish().unwrap();

    let outcome = unflatten_method(&mut body, &EngineConfig::default())
        .unwrap()
        .expect("dispatcher recovered");
    assert_eq!(outcome.dispatchers.len(), 1);
    assert_eq!(outcome.dispatchers[0].predicate, Predicate::None);
    assert_eq!(outcome.dispatchers[0].stats.blocks_elided, 1);

    assert_eq!(body.block(c0).fallthrough, Some(c1));
    assert!(body.block(update).instructions.is_empty());
    assert!(body.block(update).flags.contains(BlockFlags::DEAD));
    assert!(body.block(update).predecessors.is_empty());
}

/// A dispatcher inside a handler region is recovered within that scope; the
/// surrounding method is left alone.
#[test]
fn nested_region_dispatcher_resolves_independently() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder.block("outer").nop().fall_through("t_entry");
    builder.begin_region(RegionKind::Try);
    builder.block("t_entry").load_const(2).fall_through("t_disp");
    builder
        .block("t_disp")
        .dup()
        .store_local(0)
        .load_const(2)
        .rem_un()
        .switch(&["t_c0", "t_c1"])
        .fall_through("t_exit");
    builder.block("t_c0").load_const(1).br("t_disp");
    builder.block("t_c1").leave();
    builder.block("t_exit").leave();
    builder.end_region();
    builder.block("done").ret();

    let outer = builder.block_id("outer").unwrap();
    let t_entry = builder.block_id("t_entry").unwrap();
    let t_c0 = builder.block_id("t_c0").unwrap();
    let t_c1 = builder.block_id("t_c1").unwrap();
    let done = builder.block_id("done").unwrap();
    let mut body = builder.finish().unwrap();
    let outer_before = body.block(outer).instructions.clone();
    let done_before = body.block(done).clone();

    assert!(try_deobfuscate(&mut body));

    // 2 % 2 == 0 -> t_c0; its constant 1 -> t_c1.
    assert_eq!(body.block(t_entry).fallthrough, Some(t_c0));
    assert_eq!(body.block(t_c0).fallthrough, Some(t_c1));
    assert_eq!(body.block(outer).instructions, outer_before);
    assert_eq!(body.block(done).instructions, done_before.instructions);
}

/// The worklist budget converts a resolution that would run too long into a
/// fail-closed result instead of a hang.
#[test]
fn worklist_budget_fails_closed() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder.token(0x0600_0001);
    builder.block("entry").load_const(0).fall_through("dispatcher");
    let case_names: Vec<String> = (0..21).map(|i| format!("c{i}")).collect();
    {
        let refs: Vec<&str> = case_names.iter().map(String::as_str).collect();
        builder
            .block("dispatcher")
            .dup()
            .store_local(0)
            .load_const(21)
            .rem_un()
            .switch(&refs)
            .fall_through("c20");
    }
    for i in 0..20 {
        builder
            .block(&format!("c{i}"))
            .load_const(i64::from(i) + 1)
            .br("dispatcher");
    }
    builder.block("c20").ret();
    let mut body = builder.finish().unwrap();
    let original = body.clone();

    // Well-formed under the default budget.
    let mut resolvable = original.clone();
    assert!(try_deobfuscate(&mut resolvable));

    // A zero factor clamps the budget below the chain length.
    let engine = Engine::new(EngineConfig {
        worklist_factor: 0,
        ..EngineConfig::default()
    });
    assert!(!engine.deobfuscate_method(&mut body).unwrap());
    assert_eq!(body, original);
    assert_eq!(
        engine.context().events.count(EventKind::ResolutionAborted),
        1
    );
}

/// A dispatch index that does not reduce to a concrete integer must refuse to
/// resolve rather than guess.
#[test]
fn unknown_dispatch_index_is_an_error() {
    let mut builder = MethodBuilder::new();
    builder.local_32();
    builder.block("entry").load_const(0).fall_through("dispatcher");
    builder
        .block("dispatcher")
        .dup()
        .store_local(0)
        .load_const(2)
        .rem_un()
        .switch(&["c0", "c1"])
        .fall_through("c1");
    builder.block("c0").ret();
    builder.block("c1").ret();
    let mut body = builder.finish().unwrap();
    let scope = Scope::build(&mut body).unwrap();
    let descriptor = detect(&body, &scope, 2).unwrap();

    let mut emulator = Emulator::new(1, Width::W32);
    // A runtime-only value stands in for the raw state.
    emulator
        .execute(&[Instruction::load_local(0)])
        .unwrap();
    assert!(matches!(
        descriptor.emulate_header(&mut emulator),
        Err(Error::UnresolvedValue)
    ));
}
