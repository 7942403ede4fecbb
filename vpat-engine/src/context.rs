//! 显式上下文：把文档树、对象库、依赖图、场景、分组注册表等绑在一起，
//! 传给每个命令与选择状态机，取代全局的“当前文档/场景”。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;

use tracing::{debug, error, info, warn};
use vpat_core::document::{
    DocumentTree, EntityId, EntityKind, InsertPosition, NodeData, NodeKey, NodeTag, RawId,
    Revision, attr,
};
use vpat_core::formula::Formula;

use crate::blocks::PatternBlocks;
use crate::errors::{EngineError, IdFault};
use crate::events::{DocumentEvent, EventBus};
use crate::graph::{DependencyGraph, GraphSnapshot};
use crate::groups::{Group, GroupRegistry};
use crate::records::ToolRecords;
use crate::scene::Scene;
use crate::store::{Measurements, ObjectStore, build_object, references_of};

pub const DEFAULT_BLOCK_NAME: &str = "Block 1";

/// 一次树变更后需要同步到派生结构的范围。
#[derive(Debug, Clone, Default)]
pub struct Change {
    pub touched: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    pub groups: bool,
    pub visibility: Option<BTreeMap<EntityId, bool>>,
    pub full: bool,
}

impl Change {
    pub fn touched(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            touched: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn removed(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            removed: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_groups(mut self, groups: bool) -> Self {
        self.groups |= groups;
        self
    }

    pub fn with_visibility(mut self, visibility: BTreeMap<EntityId, bool>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// 结构性变更：影响范围无法由下游闭包界定，按文档顺序全量重算。
    pub fn structural(mut self) -> Self {
        self.full = true;
        self
    }
}

/// 三种表示的可比较快照。
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub revision: Revision,
    pub store: ObjectStore,
    pub graph: GraphSnapshot,
    pub groups: Vec<Group>,
}

#[derive(Debug)]
pub struct PatternContext {
    pub(crate) tree: DocumentTree,
    pub(crate) store: ObjectStore,
    pub(crate) graph: DependencyGraph,
    pub(crate) scene: Scene,
    pub(crate) groups: GroupRegistry,
    pub(crate) blocks: PatternBlocks,
    pub(crate) records: ToolRecords,
    pub(crate) measurements: Measurements,
    pub(crate) events: EventBus,
}

fn scan_ids(raw: &[RawId]) -> Result<(), EngineError> {
    let mut seen = HashSet::with_capacity(raw.len());
    for entry in raw {
        let fault = match EntityId::parse(&entry.raw) {
            None => Some(IdFault::Malformed),
            Some(id) if !seen.insert(id) => Some(IdFault::Duplicate),
            Some(id) if id.get() == u64::MAX => Some(IdFault::Exhausted),
            Some(_) => None,
        };
        if let Some(fault) = fault {
            return Err(EngineError::InvalidIdentifier {
                raw: entry.raw.clone(),
                tag: entry.tag.as_str(),
                fault,
            });
        }
    }
    Ok(())
}

impl PatternContext {
    fn from_tree(tree: DocumentTree, measurements: Measurements) -> Self {
        Self {
            tree,
            store: ObjectStore::new(),
            graph: DependencyGraph::new(),
            scene: Scene::new(),
            groups: GroupRegistry::new(),
            blocks: PatternBlocks::new(),
            records: ToolRecords::new(),
            measurements,
            events: EventBus::new(),
        }
    }

    /// 新建空白文档：一个图块及全部容器。
    pub fn new(block_name: &str) -> Self {
        let mut tree = DocumentTree::new();
        let root = tree.root();
        tree.insert_data(
            root,
            InsertPosition::Append,
            NodeData::new(NodeTag::Block)
                .with_attr(attr::NAME, block_name)
                .with_child(NodeData::new(NodeTag::Calculation))
                .with_child(NodeData::new(NodeTag::Details)),
        );
        tree.ensure_child(root, NodeTag::Groups);
        tree.ensure_child(root, NodeTag::BackgroundImages);
        let mut ctx = Self::from_tree(tree, Measurements::new());
        ctx.full_reparse();
        ctx
    }

    /// 加载文档。id 唯一性扫描在工作线程上进行，连接后才信任基于 id 的查找，
    /// 扫描发现的问题在此线程上重新抛出。
    pub fn load(mut tree: DocumentTree, measurements: Measurements) -> Result<Self, EngineError> {
        let raw = tree.raw_ids();
        let worker = thread::Builder::new()
            .name("vpat-id-scan".to_string())
            .spawn(move || scan_ids(&raw))
            .map_err(|err| {
                EngineError::InconsistentDocument(format!("cannot start id scan: {err}"))
            })?;

        Self::normalize(&mut tree);

        let scan = worker.join().map_err(|_| {
            EngineError::InconsistentDocument("id scan worker panicked".to_string())
        })?;
        scan?;
        Self::validate_references(&tree)?;

        let mut ctx = Self::from_tree(tree, measurements);
        ctx.full_reparse();
        info!(
            objects = ctx.store.len(),
            groups = ctx.groups.len(),
            blocks = ctx.blocks.len(),
            "文档加载完成"
        );
        Ok(ctx)
    }

    /// 补齐缺失的容器。只做结构补全，不依赖 id 索引。
    fn normalize(tree: &mut DocumentTree) {
        let root = tree.root();
        if tree.blocks().is_empty() {
            tree.insert_data(
                root,
                InsertPosition::First,
                NodeData::new(NodeTag::Block).with_attr(attr::NAME, DEFAULT_BLOCK_NAME),
            );
        }
        for block in tree.blocks() {
            tree.ensure_child(block, NodeTag::Calculation);
            tree.ensure_child(block, NodeTag::Details);
        }
        tree.ensure_child(root, NodeTag::Groups);
        tree.ensure_child(root, NodeTag::BackgroundImages);
    }

    fn validate_references(tree: &DocumentTree) -> Result<(), EngineError> {
        for (owner, key) in tree.identified_nodes() {
            let missing = if tree.tag(key) == Some(NodeTag::Group) {
                tree.children(key)
                    .iter()
                    .filter_map(|item| tree.attribute(*item, attr::OBJECT))
                    .filter_map(EntityId::parse)
                    .find(|id| tree.find_by_id(*id).is_none())
            } else {
                references_of(tree, key)?
                    .into_iter()
                    .find(|id| tree.find_by_id(*id).is_none())
            };
            if let Some(missing) = missing {
                return Err(EngineError::DanglingFormula { owner, missing });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn tree(&self) -> &DocumentTree {
        &self.tree
    }

    #[inline]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[inline]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[inline]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    #[inline]
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    #[inline]
    pub fn blocks(&self) -> &PatternBlocks {
        &self.blocks
    }

    #[inline]
    pub fn records(&self) -> &ToolRecords {
        &self.records
    }

    #[inline]
    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    #[inline]
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            revision: self.tree.revision(),
            store: self.store.clone(),
            graph: self.graph.snapshot(),
            groups: self.groups.groups().to_vec(),
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.tree.set_read_only(read_only);
    }

    pub(crate) fn check_writable(&self) -> Result<(), EngineError> {
        if self.tree.is_read_only() {
            return Err(EngineError::ReadOnlyViolation);
        }
        Ok(())
    }

    /// 为新实体分配 id。空间耗尽时返回空 id，执行命令时以 `IdSpaceExhausted` 中止。
    pub(crate) fn allocate_id(&mut self) -> EntityId {
        self.tree.allocate_id().unwrap_or_else(|| {
            warn!("实体 id 已耗尽");
            EntityId::NULL
        })
    }

    /// 定位命令目标节点，缺失即为 `StaleReference`。
    pub(crate) fn require_node(&self, id: EntityId) -> Result<NodeKey, EngineError> {
        self.tree
            .find_by_id(id)
            .ok_or(EngineError::StaleReference(id))
    }

    /// 实体容器。分组与背景图容器位于根节点下，其余位于图块内。
    pub(crate) fn container(&self, block: usize, tag: NodeTag) -> Result<NodeKey, EngineError> {
        let parent = match tag {
            NodeTag::Groups | NodeTag::BackgroundImages => self.tree.root(),
            _ => *self
                .tree
                .blocks()
                .get(block)
                .ok_or(EngineError::UnknownBlock(block))?,
        };
        self.tree.child_by_tag(parent, tag).ok_or_else(|| {
            EngineError::InconsistentDocument(format!("missing <{}> container", tag.as_str()))
        })
    }

    pub(crate) fn emit(&mut self, event: DocumentEvent) {
        self.events.emit(event);
    }

    pub(crate) fn status(&mut self, message: impl Into<String>) {
        self.events.emit(DocumentEvent::Status(message.into()));
    }

    pub(crate) fn consistency_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "一致性警告");
        self.events.emit(DocumentEvent::ConsistencyWarning(message));
    }

    /// 切换激活图块。
    pub fn activate_block(&mut self, index: usize) -> Result<(), EngineError> {
        if self.blocks.set_active(index)? {
            let name = self.blocks.name(index).unwrap_or_default().to_string();
            debug!(block = index, %name, "激活图块已切换");
            self.events
                .emit(DocumentEvent::ActiveBlockChanged { index, name });
        }
        Ok(())
    }

    /// 撤销/重做后把视图带回被编辑实体所在的图块。只影响界面，失败时忽略。
    pub(crate) fn restore_block(&mut self, index: usize) {
        if self.activate_block(index).is_err() {
            debug!(block = index, "图块已不存在，保持当前图块");
        }
    }

    /// 求值独立公式，供配置步骤预览使用。
    pub fn evaluate_formula(&self, owner: EntityId, name: &str, raw: &str) -> Result<f64, EngineError> {
        let invalid = |source| EngineError::InvalidFormula {
            owner,
            attr: name.to_string(),
            source,
        };
        let formula = Formula::parse(raw).map_err(invalid)?;
        if let Some(missing) = formula
            .references()
            .into_iter()
            .find(|id| !self.store.contains(*id))
        {
            return Err(EngineError::DanglingFormula { owner, missing });
        }
        self.store
            .evaluate_formula(&formula, &self.measurements)
            .map_err(invalid)
    }

    /// 文档顺序（前序）中节点的位置表。
    fn document_positions(&self) -> HashMap<EntityId, usize> {
        let mut positions = HashMap::new();
        for (index, (id, _)) in self.tree.identified_nodes().into_iter().enumerate() {
            positions.entry(id).or_insert(index);
        }
        positions
    }

    /// 校验子树中每个实体的引用：目标存在、不指向自身、且在文档顺序中位于其前。
    pub(crate) fn validate_nodes(&self, keys: &[NodeKey]) -> Result<(), EngineError> {
        let positions = self.document_positions();
        for key in keys {
            for node in self.tree.descendants(*key) {
                let Some(owner) = self.tree.id_of(node) else {
                    continue;
                };
                if self.tree.tag(node) == Some(NodeTag::Group) {
                    for item in self.tree.children(node) {
                        let target = self.tree.attribute(*item, attr::OBJECT).and_then(EntityId::parse);
                        if let Some(missing) = target.filter(|id| self.tree.find_by_id(*id).is_none()) {
                            return Err(EngineError::DanglingFormula { owner, missing });
                        }
                    }
                    continue;
                }
                for reference in references_of(&self.tree, node)? {
                    if reference == owner {
                        return Err(EngineError::CyclicDependency(owner));
                    }
                    let (Some(at), Some(own)) = (positions.get(&reference), positions.get(&owner))
                    else {
                        return Err(EngineError::DanglingFormula {
                            owner,
                            missing: reference,
                        });
                    };
                    if at > own {
                        if self.graph.downstream(&[owner]).contains(&reference) {
                            return Err(EngineError::CyclicDependency(owner));
                        }
                        return Err(EngineError::OrderViolation(owner));
                    }
                }
            }
        }
        Ok(())
    }

    fn document_order(&self) -> Vec<EntityId> {
        self.tree
            .identified_nodes()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| self.store.contains(*id))
            .collect()
    }

    /// 树已变更后同步派生结构。观察者顺序：历史日志、场景、分组注册表。
    ///
    /// 此处任何失败都意味着树与派生结构已分叉，调用方按不一致文档处理。
    pub(crate) fn commit_change(&mut self, change: Change) -> Result<(), EngineError> {
        for id in &change.removed {
            self.store.remove(*id);
            self.graph.remove_vertex(*id);
        }

        let mut seeds = Vec::new();
        for id in &change.touched {
            let key = self.tree.find_by_id(*id).ok_or_else(|| {
                EngineError::InconsistentDocument(format!("object {id} vanished during update"))
            })?;
            let object = build_object(&self.tree, key)
                .map_err(|err| EngineError::InconsistentDocument(err.to_string()))?;
            if let Some(object) = object {
                self.graph.add_vertex(object.id, object.kind, object.block);
                self.store.upsert(object);
                seeds.push(*id);
            }
        }
        for id in &seeds {
            self.graph.remove_incoming_edges(*id);
            let references = self
                .store
                .get(*id)
                .map(|object| object.references.clone())
                .unwrap_or_default();
            for reference in references {
                if !self.graph.add_edge(reference, *id) {
                    return Err(EngineError::InconsistentDocument(format!(
                        "object {id} references missing vertex {reference}"
                    )));
                }
            }
        }

        self.records.rebuild(&self.tree);
        self.blocks.rebuild(&self.tree);
        let order = self.document_order();
        self.graph.sync_order(&order);
        if change.full {
            debug!(recomputed = order.len(), "全量重算");
            self.store.recompute(&order, &self.measurements);
        } else {
            let affected = self.graph.downstream(&seeds);
            let lite: Vec<EntityId> = order
                .iter()
                .copied()
                .filter(|id| affected.contains(id))
                .collect();
            debug!(recomputed = lite.len(), "轻量重算");
            self.store.recompute(&lite, &self.measurements);
        }

        self.scene.sync(&self.store, &self.groups);

        if change.groups || change.visibility.is_some() {
            self.groups.rebuild(&self.tree);
            self.scene.apply_visibility(&self.groups);
        }
        if change.groups {
            self.events.emit(DocumentEvent::GroupsChanged);
        }
        if let Some(visibility) = change.visibility {
            self.events
                .emit(DocumentEvent::GroupVisibilityChanged(visibility));
        }
        if change.full {
            self.events.emit(DocumentEvent::FullReparse);
        }
        Ok(())
    }

    /// 全量重算：丢弃全部派生状态，按文档顺序从树重建。
    pub fn full_reparse(&mut self) {
        self.store.clear();
        self.graph.clear();
        for (id, key) in self.tree.identified_nodes() {
            if self.store.contains(id) {
                continue;
            }
            match build_object(&self.tree, key) {
                Ok(Some(object)) => {
                    self.graph.add_vertex(object.id, object.kind, object.block);
                    self.store.upsert(object);
                }
                Ok(None) => {}
                Err(err) => error!(id = id.get(), error = %err, "对象无法重建"),
            }
        }
        for object in self.store.iter() {
            for reference in &object.references {
                if !self.graph.add_edge(*reference, object.id) {
                    warn!(
                        id = object.id.get(),
                        missing = reference.get(),
                        "引用目标不存在"
                    );
                }
            }
        }
        self.records.rebuild(&self.tree);
        self.blocks.rebuild(&self.tree);
        let order = self.document_order();
        self.graph.sync_order(&order);
        self.store.recompute(&order, &self.measurements);
        self.groups.rebuild(&self.tree);
        self.scene.sync(&self.store, &self.groups);
        debug!(objects = self.store.len(), "全量重算完成");
        self.events.emit(DocumentEvent::FullReparse);
    }

    /// 替换测量表并全量重算。
    pub fn reload_measurements(&mut self, measurements: Measurements) {
        self.measurements = measurements;
        self.full_reparse();
    }

    /// 新建实体时使用的种类。
    pub fn entity_kind(&self, id: EntityId) -> Option<EntityKind> {
        self.tree.find_by_id(id).and_then(|key| self.tree.entity_kind(key))
    }
}
