//! Scope tree construction over exception-handler regions.
//!
//! A scope groups the blocks that belong to one level of handler nesting. The
//! collaborating block builder reports handler regions as a [`LayoutNode`]
//! tree; [`Scope::build`] partitions the flat block list along that tree so
//! the detector can search each handler region independently, innermost
//! regions first (a nested region may carry its own dispatcher).

use std::collections::HashSet;
use std::fmt;

use crate::{
    cfg::{BlockId, MethodBody},
    Result,
};

/// Identifier of one scope within a method's scope tree.
///
/// Assigned in construction order by [`Scope::build`]; the root is always id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The root scope id.
    pub const ROOT: ScopeId = ScopeId(0);

    /// The raw scope index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Kind of exception-handler region a scope mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// The method body outside any protected region.
    Root,
    /// A protected (`try`) region.
    Try,
    /// An exception handler region.
    Catch,
    /// A `finally` handler region.
    Finally,
    /// A fault handler region.
    Fault,
    /// An exception filter region.
    Filter,
}

/// One node of the handler-region layout reported by the block builder.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutNode {
    /// A leaf block at this nesting level.
    Block(BlockId),
    /// A nested handler region and its contents.
    Region(RegionKind, Vec<LayoutNode>),
}

/// A node in the scope tree: the blocks directly at this nesting level plus
/// one child per contained run of leaves or nested region.
///
/// The tree is an owned-children structure - the parent owns its children and
/// blocks are referenced by id, so there are no back-pointers and no cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    /// This scope's identifier.
    pub id: ScopeId,
    /// The handler-region kind this scope mirrors.
    pub kind: RegionKind,
    /// Blocks owned directly by this scope, in source order.
    pub blocks: Vec<BlockId>,
    /// Nested scopes, in source order.
    pub children: Vec<Scope>,
}

impl Scope {
    /// Partitions `body`'s blocks into a scope tree along its handler layout
    /// and stamps each block with its owning scope id.
    ///
    /// Every block ends up in exactly one scope, scope order matches source
    /// order, and empty runs produce no child. A method without protected
    /// regions gets a single root scope owning all blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLayout`](crate::Error::MalformedLayout) when
    /// the layout references an unknown block, lists a block twice, or omits a
    /// block from the arena. The layout comes from the collaborating block
    /// builder, so a violation here is a caller bug, not an obfuscation
    /// artifact.
    pub fn build(body: &mut MethodBody) -> Result<Scope> {
        let mut next_id = 0u32;
        let mut seen = HashSet::new();

        let root = if body.layout.is_empty() {
            let blocks: Vec<BlockId> = body.block_ids().collect();
            Scope {
                id: ScopeId(0),
                kind: RegionKind::Root,
                blocks,
                children: Vec::new(),
            }
        } else {
            let layout = body.layout.clone();
            Self::build_node(body, RegionKind::Root, &layout, &mut next_id, &mut seen)?
        };

        if !body.layout.is_empty() && seen.len() != body.block_count() {
            return Err(malformed_error!(
                "layout covers {} of {} blocks",
                seen.len(),
                body.block_count()
            ));
        }

        Self::stamp(body, &root);
        Ok(root)
    }

    fn build_node(
        body: &MethodBody,
        kind: RegionKind,
        nodes: &[LayoutNode],
        next_id: &mut u32,
        seen: &mut HashSet<BlockId>,
    ) -> Result<Scope> {
        let mut scope = Scope {
            id: ScopeId(*next_id),
            kind,
            blocks: Vec::new(),
            children: Vec::new(),
        };
        *next_id += 1;

        // Runs of leaf blocks close into a child scope whenever a nested
        // region interrupts them; a trailing run closes at the end.
        let has_region = nodes
            .iter()
            .any(|n| matches!(n, LayoutNode::Region(..)));
        let mut run: Vec<BlockId> = Vec::new();
        for node in nodes {
            match node {
                LayoutNode::Block(id) => {
                    if id.index() >= body.block_count() {
                        return Err(malformed_error!("layout references unknown block {id}"));
                    }
                    if !seen.insert(*id) {
                        return Err(malformed_error!("block {id} appears twice in layout"));
                    }
                    run.push(*id);
                }
                LayoutNode::Region(region_kind, children) => {
                    Self::close_run(&mut scope, &mut run, next_id);
                    let child =
                        Self::build_node(body, *region_kind, children, next_id, seen)?;
                    scope.children.push(child);
                }
            }
        }

        // An uninterrupted region keeps its single run of blocks directly
        // instead of wrapping it in a lone child.
        if !has_region {
            scope.blocks = std::mem::take(&mut run);
        } else {
            Self::close_run(&mut scope, &mut run, next_id);
        }
        Ok(scope)
    }

    fn close_run(scope: &mut Scope, run: &mut Vec<BlockId>, next_id: &mut u32) {
        if run.is_empty() {
            return;
        }
        scope.children.push(Scope {
            id: ScopeId(*next_id),
            kind: scope.kind,
            blocks: std::mem::take(run),
            children: Vec::new(),
        });
        *next_id += 1;
    }

    fn stamp(body: &mut MethodBody, scope: &Scope) {
        for &id in &scope.blocks {
            body.block_mut(id).scope = scope.id;
        }
        for child in &scope.children {
            Self::stamp(body, child);
        }
    }

    /// Returns `true` if `id` is owned directly by this scope.
    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains(&id)
    }

    /// Visits this scope and all descendants, children before parents, so
    /// that dispatchers in nested handler regions are recovered first.
    pub fn for_each_post_order<F: FnMut(&Scope)>(&self, f: &mut F) {
        for child in &self.children {
            child.for_each_post_order(f);
        }
        f(self);
    }
}
