#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use trialtree_core::{NodeId, StepData, StepTree, rng_from_seed};

#[derive(Arbitrary, Debug)]
enum Op {
    Push { parent: u8, name: Option<u8> },
    Insert { parent: u8, index: i8 },
    Next,
    Prev,
    Reset,
    GoToLeaf { pick: u8 },
    Shuffle { node: u8, seed: u8 },
    ClearSubtree { node: u8 },
    Rename { node: u8, name: u8 },
}

fn pick(handles: &[NodeId], raw: u8) -> NodeId {
    handles[raw as usize % handles.len()]
}

fuzz_target!(|ops: Vec<Op>| {
    let mut tree = StepTree::new();
    let mut handles: Vec<NodeId> = vec![tree.root()];

    for op in ops.into_iter().take(64) {
        match op {
            Op::Push { parent, name } => {
                let parent = pick(&handles, parent);
                let name = name.map(|n| format!("n{n}"));
                if let Ok(node) = tree.push(parent, name.as_deref(), StepData::new()) {
                    handles.push(node);
                }
            }
            Op::Insert { parent, index } => {
                let parent = pick(&handles, parent);
                if let Ok(node) = tree.insert(parent, None, i64::from(index), StepData::new()) {
                    handles.push(node);
                }
            }
            Op::Next => {
                tree.next();
            }
            Op::Prev => {
                tree.prev();
            }
            Op::Reset => tree.reset(),
            Op::GoToLeaf { pick } => {
                let leaves = tree.leaf_paths(tree.root());
                let target = &leaves[pick as usize % leaves.len()];
                let _ = tree.go_to(target);
            }
            Op::Shuffle { node, seed } => {
                let node = pick(&handles, node);
                let seed = format!("s{seed}");
                let mut rng = rng_from_seed(Some(&seed));
                tree.shuffle_children(node, &mut rng);
            }
            Op::ClearSubtree { node } => {
                let node = pick(&handles, node);
                tree.clear_subtree(node);
            }
            Op::Rename { node, name } => {
                let node = pick(&handles, node);
                let _ = tree.rename(node, &format!("r{name}"));
            }
        }

        // ClearSubtree invalidates handles below it; drop the dead ones so
        // the next round only hands out live nodes.
        handles.retain(|&node| tree.contains(node));
        assert!(
            tree.snapshot().validate().is_ok(),
            "tree invariants broke mid-sequence"
        );
    }

    // The surviving tree must still walk to exhaustion in bounded steps.
    let cap = tree.node_count() + 1;
    let mut steps = 0;
    while tree.next().is_some() {
        steps += 1;
        assert!(steps <= cap, "forward walk did not terminate");
    }
});
