//! Graphviz rendering of method bodies.
//!
//! Diagnostic aid for inspecting a block graph before and after resolution;
//! the output groups blocks into clusters by scope and distinguishes
//! fallthrough edges from branch targets.

use std::fmt::Write;

use crate::{
    cfg::{BlockFlags, MethodBody},
    utils::escape_dot,
};

/// Renders `body` as a Graphviz digraph.
///
/// Blocks are grouped into clusters by their scope id (meaningful once
/// [`Scope::build`](crate::cfg::Scope::build) has stamped the blocks; before
/// that everything sits in one cluster). Fallthrough edges render solid,
/// branch-target edges dashed and labeled with their case index. Dispatcher
/// and dead blocks are tinted.
#[must_use]
pub fn to_dot(body: &MethodBody) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph method_{} {{", body.token.value());
    let _ = writeln!(out, "    node [shape=box fontname=\"monospace\"];");

    // One cluster per scope id, blocks in arena order.
    let mut scopes: Vec<_> = body.block_ids().map(|id| body.block(id).scope).collect();
    scopes.sort_by_key(|s| s.index());
    scopes.dedup();

    for scope in scopes {
        let _ = writeln!(out, "    subgraph cluster_{} {{", scope.index());
        let _ = writeln!(out, "        label=\"{scope}\";");
        for id in body.block_ids() {
            let block = body.block(id);
            if block.scope != scope {
                continue;
            }
            let mut label = format!("{id}");
            for instr in &block.instructions {
                label.push_str("\\l");
                label.push_str(&escape_dot(&instr.to_string()));
            }
            label.push_str("\\l");
            let tint = if block.flags.contains(BlockFlags::DEAD) {
                " style=filled fillcolor=gray85"
            } else if block.flags.contains(BlockFlags::DISPATCHER) {
                " style=filled fillcolor=lightyellow"
            } else {
                ""
            };
            let _ = writeln!(out, "        {id} [label=\"{label}\"{tint}];");
        }
        let _ = writeln!(out, "    }}");
    }

    for id in body.block_ids() {
        let block = body.block(id);
        if let Some(ft) = block.fallthrough {
            let _ = writeln!(out, "    {id} -> {ft};");
        }
        for (case, target) in block.targets.iter().enumerate() {
            let _ = writeln!(out, "    {id} -> {target} [style=dashed label=\"{case}\"];");
        }
    }

    out.push_str("}\n");
    out
}
