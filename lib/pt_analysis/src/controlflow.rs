//! Instruction-level control flow.
//!
//! The representation hands over blocks with explicit branch targets; the
//! fixpoint engine works one instruction at a time. This module flattens a
//! procedure into per-instruction successor/predecessor adjacency and keeps
//! the block graph around for ordering and debug dumps.

use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use petgraph::visit::DfsPostOrder;
use pt_ir::instrs::Instruction;
use pt_ir::{BlockId, InstrId, Procedure};
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct InstrCfg {
    block_graph: DiGraph<BlockId, &'static str>,
    succs: Vec<Vec<InstrId>>,
    preds: Vec<Vec<InstrId>>,
    entry: InstrId,
    exits: Vec<InstrId>,
    rpo: Vec<InstrId>,
}

impl InstrCfg {
    #[must_use]
    pub fn build(proc: &Procedure) -> Self {
        let mut block_graph = DiGraph::new();
        let mut block_nodes = Vec::with_capacity(proc.n_blocks());
        for (bid, _) in proc.blocks() {
            block_nodes.push(block_graph.add_node(bid));
        }
        for (bid, block) in proc.blocks() {
            if let Instruction::Branch { targets, .. } = proc.instr(block.last()) {
                for t in targets {
                    block_graph.add_edge(block_nodes[bid.index()], block_nodes[t.index()], "");
                }
            }
        }

        let mut succs = vec![Vec::new(); proc.n_instrs()];
        let mut exits = Vec::new();
        for (_, block) in proc.blocks() {
            let ids = block.instr_ids();
            for pair in ids.windows(2) {
                succs[pair[0].index()].push(pair[1]);
            }
            match proc.instr(block.last()) {
                Instruction::Branch { targets, .. } => {
                    for t in targets {
                        let first = proc.block(*t).first();
                        if !succs[block.last().index()].contains(&first) {
                            succs[block.last().index()].push(first);
                        }
                    }
                }
                _ => exits.push(block.last()),
            }
        }
        let mut preds = vec![Vec::new(); proc.n_instrs()];
        for (id, _) in proc.instructions() {
            for s in &succs[id.index()] {
                preds[s.index()].push(id);
            }
        }

        // For the combined analysis the worklist is seeded in reverse
        // post-order of the blocks; unreachable blocks are appended so every
        // instruction is visited at least once.
        let entry_node = block_nodes[proc.entry_block().index()];
        let mut postorder = Vec::new();
        let mut dfs = DfsPostOrder::new(&block_graph, entry_node);
        while let Some(n) = dfs.next(&block_graph) {
            postorder.push(block_graph[n]);
        }
        let mut seen = vec![false; proc.n_blocks()];
        let mut rpo = Vec::with_capacity(proc.n_instrs());
        for bid in postorder.iter().rev() {
            seen[bid.index()] = true;
            rpo.extend(proc.block(*bid).instr_ids().iter().copied());
        }
        for (bid, block) in proc.blocks() {
            if !seen[bid.index()] {
                rpo.extend(block.instr_ids().iter().copied());
            }
        }

        Self {
            block_graph,
            succs,
            preds,
            entry: proc.block(proc.entry_block()).first(),
            exits,
            rpo,
        }
    }

    #[must_use]
    pub fn entry(&self) -> InstrId {
        self.entry
    }

    #[must_use]
    pub fn exits(&self) -> &[InstrId] {
        &self.exits
    }

    #[must_use]
    pub fn is_exit(&self, i: InstrId) -> bool {
        self.exits.contains(&i)
    }

    #[must_use]
    pub fn successors(&self, i: InstrId) -> &[InstrId] {
        &self.succs[i.index()]
    }

    #[must_use]
    pub fn predecessors(&self, i: InstrId) -> &[InstrId] {
        &self.preds[i.index()]
    }

    /// Every instruction of the procedure, blocks in reverse post-order.
    #[must_use]
    pub fn reverse_post_order(&self) -> &[InstrId] {
        &self.rpo
    }

    #[must_use]
    pub fn to_dot(&self, proc: &Procedure) -> String {
        let mut res = String::new();
        res.push_str("digraph {\n");
        res.push_str("  splines=ortho;\n");
        res.push_str("  nodesep=2;\n");
        write!(
            res,
            "{}",
            Dot::with_attr_getters(
                &self.block_graph,
                &[Config::GraphContentOnly, Config::EdgeNoLabel],
                &|_, _| String::new(),
                &|_, (_, bid)| {
                    let mut label = format!("b{bid}:");
                    for id in proc.block(*bid).instr_ids() {
                        label.push_str(&format!("\\n{}: {}", id, proc.instr(*id)));
                    }
                    format!("shape=box, label=\"{label}\"")
                },
            )
        )
        .unwrap();
        res.push('}');
        res
    }
}
