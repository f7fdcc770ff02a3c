//! Dependency transposer.
//!
//! The reverse sweep routes the adjoint contribution of each dependency to
//! the right-hand side of the equation that last wrote it. The transposer
//! precomputes these routes with one forward scan over the (pseudo-)blocks
//! and then hands them out in reverse, one equation at a time.
//!
//! Activity follows the controls forward from where they are written,
//! normally the controls pseudo-block in front of the tape: an equation is
//! active if any of its input dependencies is active, and its outputs
//! become active. An inactive equation that overwrites an id pushes an
//! inactive entry, so a later consumer of the new, control-independent
//! value routes nothing.

use std::collections::{HashMap, HashSet};
use tape_core::{Equation, VarId, Variable};

/// Where the adjoint contribution for a dependency goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    /// Block of the writing equation, counting pseudo-blocks
    pub block: usize,
    /// Position of the writing equation within its block
    pub equation: usize,
    /// Output index within the writing equation
    pub output: usize,
    pub active: bool,
}

impl Use {
    /// Whether this entry was pushed by equation `equation` of `block`.
    pub fn is_from(&self, block: usize, equation: usize) -> bool {
        self.block == block && self.equation == equation
    }
}

/// Per-id stacks of writers, consumed in reverse.
#[derive(Debug, Default)]
pub struct DependencyTransposer {
    uses: HashMap<VarId, Vec<Use>>,
    /// Ids pushed by each equation, in forward order
    pushed: Vec<Vec<VarId>>,
}

impl DependencyTransposer {
    /// Scans `blocks` forward.
    ///
    /// Nothing is active at the start. An equation writing one of
    /// `controls` activates it even when the equation itself is inactive,
    /// so a control only routes once some equation has written it.
    pub fn new(blocks: &[Vec<&dyn Equation>], controls: &[Variable]) -> Self {
        let controls: HashSet<VarId> = controls.iter().map(Variable::id).collect();
        let mut active: HashSet<VarId> = HashSet::new();
        let mut uses: HashMap<VarId, Vec<Use>> = HashMap::new();
        let mut pushed = Vec::new();

        for (b, block) in blocks.iter().enumerate() {
            for (k, eq) in block.iter().enumerate() {
                let n_outputs = eq.outputs().len();
                let is_active = eq.dependencies()[n_outputs..]
                    .iter()
                    .any(|dep| active.contains(&dep.id()));

                let mut ids = Vec::with_capacity(n_outputs);
                for (o, x) in eq.outputs().iter().enumerate() {
                    let id = x.id();
                    let entry_active = is_active || controls.contains(&id);
                    if entry_active {
                        active.insert(id);
                    } else {
                        active.remove(&id);
                        if !uses.contains_key(&id) {
                            continue;
                        }
                    }
                    uses.entry(id).or_default().push(Use {
                        block: b,
                        equation: k,
                        output: o,
                        active: entry_active,
                    });
                    ids.push(id);
                }
                pushed.push(ids);
            }
        }

        Self { uses, pushed }
    }

    /// The active writer of `id` visible to the equation being reversed.
    pub fn get(&self, id: VarId) -> Option<Use> {
        self.uses
            .get(&id)
            .and_then(|stack| stack.last())
            .filter(|u| u.active)
            .copied()
    }

    /// Removes the entries of the last equation not yet reversed.
    pub fn pop(&mut self) {
        let Some(ids) = self.pushed.pop() else {
            return;
        };
        for id in ids {
            if let Some(stack) = self.uses.get_mut(&id) {
                stack.pop();
                if stack.is_empty() {
                    self.uses.remove(&id);
                }
            }
        }
    }

    /// Equations not yet popped.
    pub fn remaining(&self) -> usize {
        self.pushed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.is_empty() && self.uses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{Assignment, LinearCombination};
    use crate::markers::ControlsMarker;
    use proptest::prelude::*;
    use tape_core::FunctionSpace;

    fn as_blocks(blocks: &[Vec<Box<dyn Equation>>]) -> Vec<Vec<&dyn Equation>> {
        blocks
            .iter()
            .map(|b| b.iter().map(|eq| eq.as_ref()).collect())
            .collect()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    #[test]
    fn test_chain_routes_to_last_writer() {
        let space = FunctionSpace::scalar();
        let a = Variable::new(&space, "a");
        let b = Variable::new(&space, "b");
        let c = Variable::new(&space, "c");

        let blocks: Vec<Vec<Box<dyn Equation>>> = vec![
            vec![Box::new(ControlsMarker::new(&[a.clone()]).unwrap())],
            vec![Box::new(Assignment::new(&b, &a).unwrap())],
            vec![Box::new(Assignment::new(&c, &b).unwrap())],
        ];
        let refs = as_blocks(&blocks);
        let mut t = DependencyTransposer::new(&refs, &[a.clone()]);

        // Reversing c = b: b was written by block 1.
        assert_eq!(
            t.get(b.id()),
            Some(Use {
                block: 1,
                equation: 0,
                output: 0,
                active: true
            })
        );
        t.pop();
        // Reversing b = a: a was written by the controls block.
        assert_eq!(
            t.get(a.id()),
            Some(Use {
                block: 0,
                equation: 0,
                output: 0,
                active: true
            })
        );
        t.pop();
        t.pop();
        assert!(t.is_empty());
    }

    #[test]
    fn test_unwritten_control_is_inactive() {
        let space = FunctionSpace::scalar();
        let a = Variable::new(&space, "a");
        let b = Variable::new(&space, "b");
        let blocks: Vec<Vec<Box<dyn Equation>>> =
            vec![vec![Box::new(Assignment::new(&b, &a).unwrap())]];
        let refs = as_blocks(&blocks);
        let mut t = DependencyTransposer::new(&refs, &[a.clone()]);

        // Without the controls block nothing activates a.
        assert_eq!(t.get(b.id()), None);
        t.pop();
        assert_eq!(t.get(a.id()), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_inactive_overwrite_hides_earlier_writer() {
        let space = FunctionSpace::scalar();
        let m = Variable::new(&space, "m");
        let k = Variable::new(&space, "k");
        let x = Variable::new(&space, "x");
        let y = Variable::new(&space, "y");

        let blocks: Vec<Vec<Box<dyn Equation>>> = vec![
            vec![Box::new(Assignment::new(&m, &k).unwrap())],
            vec![
                Box::new(Assignment::new(&x, &m).unwrap()),
                Box::new(Assignment::new(&x, &k).unwrap()),
                Box::new(Assignment::new(&y, &x).unwrap()),
            ],
        ];
        let refs = as_blocks(&blocks);
        let mut t = DependencyTransposer::new(&refs, &[m.clone()]);

        // y = x reads the inactive value written by x = k.
        assert_eq!(t.get(x.id()), None);
        t.pop();
        t.pop();
        // x = m routes to the control injection.
        assert_eq!(t.get(m.id()).map(|u| (u.block, u.equation)), Some((0, 0)));
        t.pop();
        t.pop();
        assert!(t.is_empty());
    }

    #[test]
    fn test_inactive_write_without_history_pushes_nothing() {
        let space = FunctionSpace::scalar();
        let k = Variable::new(&space, "k");
        let x = Variable::new(&space, "x");
        let blocks: Vec<Vec<Box<dyn Equation>>> =
            vec![vec![Box::new(Assignment::new(&x, &k).unwrap())]];
        let refs = as_blocks(&blocks);
        let mut t = DependencyTransposer::new(&refs, &[]);
        assert_eq!(t.remaining(), 1);
        assert_eq!(t.get(x.id()), None);
        t.pop();
        assert!(t.is_empty());
    }

    // ========================================================================
    // Properties
    // ========================================================================

    proptest! {
        /// Random sums over a small pool: activity is reachability from the
        /// controls, and the stacks always drain.
        #[test]
        fn prop_activity_is_forward_reachability(
            ops in prop::collection::vec((0usize..6, prop::collection::vec(0usize..6, 1..3)), 1..25),
            n_controls in 1usize..3,
        ) {
            let space = FunctionSpace::scalar();
            let pool: Vec<Variable> = (0..6).map(|i| Variable::new(&space, &format!("v{}", i))).collect();
            let controls: Vec<Variable> = pool[..n_controls].to_vec();

            let mut eqs: Vec<Box<dyn Equation>> = Vec::new();
            let mut expected_active: Vec<bool> = Vec::new();
            let mut active: HashSet<VarId> = controls.iter().map(Variable::id).collect();
            for (out, ins) in &ops {
                let inputs: Vec<(f64, Variable)> = ins
                    .iter()
                    .filter(|&&i| i != *out)
                    .map(|&i| (1.0, pool[i].clone()))
                    .collect();
                if inputs.is_empty() {
                    continue;
                }
                let is_active = inputs.iter().any(|(_, v)| active.contains(&v.id()));
                if is_active || controls.contains(&pool[*out]) {
                    active.insert(pool[*out].id());
                } else {
                    active.remove(&pool[*out].id());
                }
                expected_active.push(is_active);
                eqs.push(Box::new(LinearCombination::new(&pool[*out], inputs).unwrap()));
            }

            let marker: Vec<Box<dyn Equation>> = vec![Box::new(ControlsMarker::new(&controls).unwrap())];
            let blocks = vec![marker, eqs];
            let refs = as_blocks(&blocks);
            let mut t = DependencyTransposer::new(&refs, &controls);
            for (k, eq) in refs[1].iter().enumerate().rev() {
                let top = t.get(eq.outputs()[0].id());
                if expected_active[k] {
                    prop_assert_eq!(top.map(|u| (u.block, u.equation)), Some((1, k)));
                } else {
                    prop_assert!(top.is_none() || controls.contains(&eq.outputs()[0]));
                }
                t.pop();
            }
            t.pop();
            prop_assert!(t.is_empty());
        }
    }
}
