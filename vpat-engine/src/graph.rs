//! 依赖图：每个实体一个顶点，边由被依赖者指向依赖者。
//!
//! 顶点按图块分组，块内顺序与文档顺序一致，用于决定轻量重算（仅下游闭包）
//! 与全量重算（按文档顺序全部重算）的范围。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use vpat_core::document::{EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyVertex {
    pub id: EntityId,
    pub kind: EntityKind,
    pub block: usize,
}

/// 图的可比较快照，用于验证撤销后图结构完全复原。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub vertices: Vec<DependencyVertex>,
    pub edges: Vec<(EntityId, EntityId)>,
    pub order: BTreeMap<usize, Vec<EntityId>>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<DependencyVertex, ()>,
    index: HashMap<EntityId, NodeIndex>,
    order: BTreeMap<usize, Vec<EntityId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加顶点。已存在时更新种类与所属图块，保留已有边。
    pub fn add_vertex(&mut self, id: EntityId, kind: EntityKind, block: usize) {
        let vertex = DependencyVertex { id, kind, block };
        if let Some(node) = self.index.get(&id).copied() {
            let previous = self.graph[node].block;
            self.graph[node] = vertex;
            if previous != block {
                self.detach_order(id, previous);
                self.order.entry(block).or_default().push(id);
            }
            return;
        }
        let node = self.graph.add_node(vertex);
        self.index.insert(id, node);
        self.order.entry(block).or_default().push(id);
    }

    /// 删除顶点及其所有边。
    pub fn remove_vertex(&mut self, id: EntityId) -> Option<DependencyVertex> {
        let node = self.index.remove(&id)?;
        let vertex = self.graph.remove_node(node)?;
        self.detach_order(id, vertex.block);
        Some(vertex)
    }

    fn detach_order(&mut self, id: EntityId, block: usize) {
        if let Some(ids) = self.order.get_mut(&block) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.order.remove(&block);
            }
        }
    }

    /// 声明 `dependent` 依赖 `dependency`。任一顶点缺失时返回 `false`。
    pub fn add_edge(&mut self, dependency: EntityId, dependent: EntityId) -> bool {
        let (Some(from), Some(to)) = (self.index.get(&dependency), self.index.get(&dependent))
        else {
            return false;
        };
        if self.graph.find_edge(*from, *to).is_none() {
            self.graph.add_edge(*from, *to, ());
        }
        true
    }

    pub fn remove_edge(&mut self, dependency: EntityId, dependent: EntityId) -> bool {
        let (Some(from), Some(to)) = (self.index.get(&dependency), self.index.get(&dependent))
        else {
            return false;
        };
        match self.graph.find_edge(*from, *to) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// 清除顶点的全部入边，重建其引用前调用。
    pub fn remove_incoming_edges(&mut self, id: EntityId) {
        let Some(node) = self.index.get(&id).copied() else {
            return;
        };
        let incoming: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        for source in incoming {
            if let Some(edge) = self.graph.find_edge(source, node) {
                self.graph.remove_edge(edge);
            }
        }
    }

    /// 返回顶点，撤销后据其图块恢复用户视图。
    pub fn get_vertex(&self, id: EntityId) -> Option<DependencyVertex> {
        self.index.get(&id).map(|node| self.graph[*node])
    }

    #[inline]
    pub fn has_vertex(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn has_edge(&self, dependency: EntityId, dependent: EntityId) -> bool {
        match (self.index.get(&dependency), self.index.get(&dependent)) {
            (Some(from), Some(to)) => self.graph.find_edge(*from, *to).is_some(),
            _ => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dependencies(&self, id: EntityId) -> Vec<EntityId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents(&self, id: EntityId) -> Vec<EntityId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: EntityId, direction: Direction) -> Vec<EntityId> {
        let Some(node) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<EntityId> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|neighbor| self.graph[neighbor].id)
            .collect();
        out.sort();
        out
    }

    /// 种子顶点及其全部传递下游。
    pub fn downstream(&self, seeds: &[EntityId]) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        for seed in seeds {
            if let Some(node) = self.index.get(seed) {
                if seen.insert(*seed) {
                    queue.push_back(*node);
                }
            }
        }
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(self.graph[next].id) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// 图块内顶点，按文档顺序。
    pub fn vertices_in_block(&self, block: usize) -> &[EntityId] {
        self.order.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 按文档顺序重排各图块内的顶点。`document_order` 中不存在的 id 被忽略。
    pub fn sync_order(&mut self, document_order: &[EntityId]) {
        let mut order: BTreeMap<usize, Vec<EntityId>> = BTreeMap::new();
        for id in document_order {
            if let Some(node) = self.index.get(id) {
                order.entry(self.graph[*node].block).or_default().push(*id);
            }
        }
        // 不在文档顺序里的顶点保持原相对位置，追加到末尾
        for (block, ids) in &self.order {
            for id in ids {
                let slot = order.entry(*block).or_default();
                if !slot.contains(id) {
                    slot.push(*id);
                }
            }
        }
        self.order = order;
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut vertices: Vec<_> = self.graph.node_weights().copied().collect();
        vertices.sort();
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].id, self.graph[to].id))
            .collect();
        edges.sort();
        GraphSnapshot {
            vertices,
            edges,
            order: self.order.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.index.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    fn chain() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for raw in 1..=4 {
            graph.add_vertex(id(raw), EntityKind::Point, 0);
        }
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(3));
        graph
    }

    #[test]
    fn downstream_follows_transitive_dependents() {
        let graph = chain();
        let closure: Vec<_> = graph.downstream(&[id(1)]).into_iter().collect();
        assert_eq!(closure, vec![id(1), id(2), id(3)]);
        assert_eq!(graph.downstream(&[id(4)]).len(), 1);
        assert!(graph.downstream(&[id(99)]).is_empty());
    }

    #[test]
    fn remove_vertex_drops_edges_and_order() {
        let mut graph = chain();
        let removed = graph.remove_vertex(id(2)).expect("vertex 2");
        assert_eq!(removed.block, 0);
        assert!(!graph.has_edge(id(1), id(2)));
        assert!(graph.dependents(id(1)).is_empty());
        assert_eq!(graph.vertices_in_block(0), &[id(1), id(3), id(4)]);
    }

    #[test]
    fn snapshot_is_independent_of_insertion_history() {
        let mut graph = chain();
        let before = graph.snapshot();
        graph.remove_vertex(id(3));
        graph.add_vertex(id(3), EntityKind::Point, 0);
        graph.add_edge(id(2), id(3));
        assert_ne!(graph.snapshot(), before);
        graph.sync_order(&[id(1), id(2), id(3), id(4)]);
        assert_eq!(graph.snapshot(), before);
    }

    #[test]
    fn vertex_moves_between_blocks() {
        let mut graph = chain();
        graph.add_vertex(id(4), EntityKind::Line, 1);
        assert_eq!(graph.get_vertex(id(4)).map(|v| v.block), Some(1));
        assert_eq!(graph.vertices_in_block(1), &[id(4)]);
        assert_eq!(graph.vertices_in_block(0).len(), 3);
    }

    #[test]
    fn incoming_edges_can_be_reset() {
        let mut graph = chain();
        graph.add_edge(id(4), id(3));
        graph.remove_incoming_edges(id(3));
        assert!(graph.dependencies(id(3)).is_empty());
        assert_eq!(graph.dependents(id(3)), Vec::<EntityId>::new());
        assert!(graph.has_edge(id(1), id(2)));
    }
}
