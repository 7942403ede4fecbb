use std::collections::HashMap;

use vpat_core::document::{DocumentTree, EntityId, EntityKind};

/// 历史日志中的一条工具记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub block: usize,
}

/// 按文档顺序排列的工具记录，决定求值顺序。每次变更后最先刷新。
#[derive(Debug, Clone, Default)]
pub struct ToolRecords {
    records: Vec<ToolRecord>,
    positions: HashMap<EntityId, usize>,
}

impl ToolRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从文档树重建。裁片、背景图与分组不参与求值顺序，不计入。
    pub fn rebuild(&mut self, tree: &DocumentTree) {
        self.records.clear();
        self.positions.clear();
        for (id, key) in tree.identified_nodes() {
            let Some(kind) = tree.entity_kind(key) else {
                continue;
            };
            if !kind.carries_order() || !kind.is_graph_vertex() {
                continue;
            }
            if self.positions.contains_key(&id) {
                continue;
            }
            self.positions.insert(id, self.records.len());
            self.records.push(ToolRecord {
                id,
                kind,
                block: tree.block_index_of(key).unwrap_or(0),
            });
        }
    }

    #[inline]
    pub fn records(&self) -> &[ToolRecord] {
        &self.records
    }

    #[inline]
    pub fn position(&self, id: EntityId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.records.iter().map(|record| record.id).collect()
    }

    pub fn in_block(&self, block: usize) -> impl Iterator<Item = &ToolRecord> {
        self.records.iter().filter(move |record| record.block == block)
    }

    /// 同一父节点下、日志中位于 `id` 之前最近的一条记录。
    /// 不参与求值顺序的兄弟与没有 id 的节点被跳过。
    pub fn previous_in_parent(&self, tree: &DocumentTree, id: EntityId) -> Option<EntityId> {
        let position = self.position(id)?;
        let parent = tree.find_by_id(id).and_then(|key| tree.parent(key))?;
        self.records[..position]
            .iter()
            .rev()
            .map(|record| record.id)
            .find(|candidate| {
                tree.find_by_id(*candidate).and_then(|key| tree.parent(key)) == Some(parent)
            })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
