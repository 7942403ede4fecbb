use std::collections::BTreeSet;

use tracing::debug;
use vpat_core::document::{EntityId, EntityKind, InsertPosition, NodeData, NodeKey, NodeTag, attr};

use super::{Detached, UndoCommand, detach, is_container, reattach};
use crate::context::{Change, PatternContext};
use crate::errors::EngineError;
use crate::events::DocumentEvent;

pub(crate) fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Point => "点",
        EntityKind::Line => "线",
        EntityKind::Curve => "曲线",
        EntityKind::Operation => "操作",
        EntityKind::Piece => "裁片",
        EntityKind::Group => "分组",
        EntityKind::BackgroundImage => "背景图",
    }
}

pub(super) fn restore_attribute(ctx: &mut PatternContext, key: NodeKey, name: &str, old: Option<&String>) {
    match old {
        Some(value) => {
            ctx.tree.set_attribute(key, name, value.clone());
        }
        None => {
            ctx.tree.remove_attribute(key, name);
        }
    }
}

pub(super) fn subtree_ids(ctx: &PatternContext, key: NodeKey) -> Vec<EntityId> {
    ctx.tree
        .descendants(key)
        .into_iter()
        .filter_map(|node| ctx.tree.id_of(node))
        .collect()
}

/// 子树中是否带有空 id（分配时 id 空间已耗尽）。
fn holds_null_id(data: &NodeData) -> bool {
    data.attributes
        .get(attr::ID)
        .is_some_and(|raw| raw.trim().parse::<u64>() == Ok(0))
        || data.children.iter().any(holds_null_id)
}

/// 把节点移回记录的前一个兄弟之后；兄弟已不存在时移到末尾并发出警告。
fn restore_position(ctx: &mut PatternContext, key: NodeKey, previous: Option<EntityId>) {
    let anchor = match previous {
        None => None,
        Some(previous) => {
            let parent = ctx.tree.parent(key);
            match ctx.tree.find_by_id(previous) {
                Some(anchor) if ctx.tree.parent(anchor) == parent => Some(anchor),
                _ => {
                    ctx.consistency_warning(format!(
                        "sibling {previous} is gone, original order cannot be restored"
                    ));
                    parent
                        .and_then(|parent| ctx.tree.children(parent).last().copied())
                        .filter(|last| *last != key)
                }
            }
        }
    };
    ctx.tree.move_after(key, anchor);
}

/// 新建实体，追加到激活图块对应容器的末尾。
#[derive(Debug, Clone)]
pub struct AddEntity {
    id: EntityId,
    kind: EntityKind,
    data: NodeData,
    block: usize,
}

impl AddEntity {
    pub fn new<K, V>(
        ctx: &mut PatternContext,
        kind: EntityKind,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let id = ctx.allocate_id();
        let mut data = NodeData::new(NodeTag::for_kind(kind)).with_id(id);
        for (name, value) in attributes {
            data = data.with_attr(name, value);
        }
        Self {
            id,
            kind,
            data,
            block: ctx.blocks.active(),
        }
    }

    /// 以完整子树新建（例如带结果对象的操作节点）。缺少 id 时分配新 id。
    pub fn with_data(ctx: &mut PatternContext, mut data: NodeData) -> Self {
        let id = match data.id() {
            Some(id) => id,
            None => {
                let id = ctx.allocate_id();
                data.attributes
                    .insert(attr::ID.to_string(), id.get().to_string());
                id
            }
        };
        let kind = data.tag.entity_kind().unwrap_or(EntityKind::Point);
        Self {
            id,
            kind,
            data,
            block: ctx.blocks.active(),
        }
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn data(&self) -> &NodeData {
        &self.data
    }
}

impl UndoCommand for AddEntity {
    fn text(&self) -> String {
        format!("添加{}", kind_label(self.kind))
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        if self.id.is_null() || holds_null_id(&self.data) {
            return Err(EngineError::IdSpaceExhausted);
        }
        if ctx.tree.find_by_id(self.id).is_some() {
            return Err(EngineError::InconsistentDocument(format!(
                "object {} already exists",
                self.id
            )));
        }
        let parent = ctx.container(self.block, NodeTag::container_for(self.kind))?;
        let key = ctx
            .tree
            .insert_data(parent, InsertPosition::Append, self.data.clone());
        if let Err(err) = ctx.validate_nodes(&[key]) {
            ctx.tree.remove(key);
            return Err(err);
        }
        debug!(id = self.id.get(), kind = %self.kind, "实体已添加");
        ctx.commit_change(
            Change::touched(self.data.ids()).with_groups(self.kind == EntityKind::Group),
        )
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        let data = ctx.tree.remove(key).ok_or_else(|| {
            EngineError::InconsistentDocument(format!("cannot remove {}", self.id))
        })?;
        let removed = data.ids();
        self.data = data;
        ctx.commit_change(Change::removed(removed).with_groups(self.kind == EntityKind::Group))
    }
}

#[derive(Debug, Clone)]
struct RemovedItem {
    group: EntityId,
    index: usize,
    data: NodeData,
}

/// 删除顶层实体。仍被其它实体依赖时拒绝；引用它的分组成员一并移除，撤销时原位恢复。
#[derive(Debug, Clone)]
pub struct DeleteEntity {
    id: EntityId,
    block: usize,
    detached: Option<Detached>,
    items: Vec<RemovedItem>,
    kind: Option<EntityKind>,
}

impl DeleteEntity {
    pub fn new(ctx: &PatternContext, id: EntityId) -> Self {
        Self {
            id,
            block: ctx.blocks.active(),
            detached: None,
            items: Vec::new(),
            kind: ctx.entity_kind(id),
        }
    }
}

impl UndoCommand for DeleteEntity {
    fn text(&self) -> String {
        format!("删除{}", self.kind.map(kind_label).unwrap_or("对象"))
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        let in_container = ctx
            .tree
            .parent(key)
            .and_then(|parent| ctx.tree.tag(parent))
            .is_some_and(is_container);
        if !in_container {
            return Err(EngineError::NotDeletable(self.id));
        }

        let ids = subtree_ids(ctx, key);
        let own: BTreeSet<EntityId> = ids.iter().copied().collect();
        let dependents: BTreeSet<EntityId> = ids
            .iter()
            .flat_map(|id| ctx.graph.dependents(*id))
            .filter(|id| !own.contains(id))
            .collect();
        if !dependents.is_empty() {
            return Err(EngineError::EntityInUse {
                id: self.id,
                dependents: dependents.into_iter().collect(),
            });
        }

        let mut items = Vec::new();
        if let Ok(container) = ctx.container(0, NodeTag::Groups) {
            for group in ctx.tree.children(container) {
                let Some(group_id) = ctx.tree.id_of(*group) else {
                    continue;
                };
                for (index, item) in ctx.tree.children(*group).iter().enumerate() {
                    let member = ctx
                        .tree
                        .attribute(*item, attr::OBJECT)
                        .and_then(EntityId::parse);
                    if member.is_some_and(|member| own.contains(&member)) {
                        if let Some(data) = ctx.tree.subtree_data(*item) {
                            items.push(RemovedItem {
                                group: group_id,
                                index,
                                data,
                            });
                        }
                    }
                }
            }
        }
        // 逆序移除，保证同一分组内记录的下标有效
        for item in items.iter().rev() {
            let child = ctx
                .tree
                .find_by_id(item.group)
                .and_then(|group| ctx.tree.children(group).get(item.index).copied());
            if let Some(child) = child {
                ctx.tree.remove(child);
            }
        }

        let kind = ctx.tree.entity_kind(key);
        self.detached = Some(detach(ctx, key)?);
        let groups = !items.is_empty() || kind == Some(EntityKind::Group);
        self.items = items;
        ctx.commit_change(Change::removed(ids).with_groups(groups))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let Some(detached) = self.detached.as_ref() else {
            return Err(EngineError::InconsistentDocument(
                "delete was never applied".to_string(),
            ));
        };
        if ctx.tree.find_by_id(self.id).is_some() {
            return Err(EngineError::InconsistentDocument(format!(
                "object {} reappeared before undo",
                self.id
            )));
        }
        reattach(ctx, detached)?;
        for item in &self.items {
            match ctx.tree.find_by_id(item.group) {
                Some(group) => {
                    ctx.tree
                        .insert_data(group, InsertPosition::Index(item.index), item.data.clone());
                }
                None => ctx.consistency_warning(format!(
                    "group {} is gone, membership of {} not restored",
                    item.group, self.id
                )),
            }
        }
        let groups = !self.items.is_empty() || detached.data.tag == NodeTag::Group;
        ctx.commit_change(Change::touched(detached.data.ids()).with_groups(groups))
    }
}

#[derive(Debug, Clone)]
pub struct RenameEntity {
    id: EntityId,
    name: String,
    old: Option<String>,
    block: usize,
}

impl RenameEntity {
    pub fn new(ctx: &PatternContext, id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            old: None,
            block: ctx.blocks.active(),
        }
    }
}

impl UndoCommand for RenameEntity {
    fn text(&self) -> String {
        format!("重命名为 {}", self.name)
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        if self.name.trim().is_empty() {
            return Err(EngineError::EmptyName);
        }
        self.old = ctx.tree.set_attribute(key, attr::NAME, self.name.clone());
        let groups = ctx.tree.tag(key) == Some(NodeTag::Group);
        ctx.commit_change(Change::touched([self.id]).with_groups(groups))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        restore_attribute(ctx, key, attr::NAME, self.old.as_ref());
        let groups = ctx.tree.tag(key) == Some(NodeTag::Group);
        ctx.commit_change(Change::touched([self.id]).with_groups(groups))
    }
}

/// 修改单个属性（通常是公式），轻量重算其下游。
#[derive(Debug, Clone)]
pub struct SetAttribute {
    id: EntityId,
    name: String,
    value: String,
    old: Option<String>,
    block: usize,
}

impl SetAttribute {
    pub fn new(
        ctx: &PatternContext,
        id: EntityId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            value: value.into(),
            old: None,
            block: ctx.blocks.active(),
        }
    }
}

impl UndoCommand for SetAttribute {
    fn text(&self) -> String {
        format!("修改 {}", self.name)
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        if self.name == attr::ID {
            return Err(EngineError::ProtectedAttribute(self.name.clone()));
        }
        let key = ctx.require_node(self.id)?;
        let old = ctx.tree.set_attribute(key, &self.name, self.value.clone());
        if let Err(err) = ctx.validate_nodes(&[key]) {
            restore_attribute(ctx, key, &self.name, old.as_ref());
            return Err(err);
        }
        self.old = old;
        let groups = ctx.tree.tag(key) == Some(NodeTag::Group);
        ctx.commit_change(Change::touched([self.id]).with_groups(groups))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        restore_attribute(ctx, key, &self.name, self.old.as_ref());
        let groups = ctx.tree.tag(key) == Some(NodeTag::Group);
        ctx.commit_change(Change::touched([self.id]).with_groups(groups))
    }
}

/// 在同一容器内调整顺序。`after == None` 表示移到最前。
#[derive(Debug, Clone)]
pub struct MoveEntity {
    id: EntityId,
    after: Option<EntityId>,
    previous: Option<EntityId>,
    block: usize,
}

impl MoveEntity {
    pub fn new(ctx: &PatternContext, id: EntityId, after: Option<EntityId>) -> Self {
        Self {
            id,
            after,
            previous: None,
            block: ctx.blocks.active(),
        }
    }

    fn touched(ctx: &PatternContext, key: NodeKey) -> (Vec<EntityId>, bool) {
        (
            subtree_ids(ctx, key),
            ctx.tree.tag(key) == Some(NodeTag::Group),
        )
    }
}

impl UndoCommand for MoveEntity {
    fn text(&self) -> String {
        "调整顺序".to_string()
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        let parent = ctx.tree.parent(key);
        if !parent
            .and_then(|parent| ctx.tree.tag(parent))
            .is_some_and(is_container)
        {
            return Err(EngineError::OrderViolation(self.id));
        }
        let anchor = match self.after {
            Some(after) => {
                let anchor = ctx.require_node(after)?;
                if after == self.id || ctx.tree.parent(anchor) != parent {
                    return Err(EngineError::OrderViolation(self.id));
                }
                Some(anchor)
            }
            None => None,
        };

        let previous = ctx
            .tree
            .previous_sibling(key)
            .and_then(|sibling| ctx.tree.id_of(sibling));
        ctx.tree.move_after(key, anchor);

        let (ids, groups) = Self::touched(ctx, key);
        let mut keys = vec![key];
        for id in &ids {
            for dependent in ctx.graph.dependents(*id) {
                if let Some(dependent) = ctx.tree.find_by_id(dependent) {
                    keys.push(dependent);
                }
            }
        }
        if let Err(err) = ctx.validate_nodes(&keys) {
            restore_position(ctx, key, previous);
            return Err(err);
        }
        self.previous = previous;
        ctx.commit_change(Change::touched(ids).with_groups(groups).structural())
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = ctx.require_node(self.id)?;
        restore_position(ctx, key, self.previous);
        let (ids, groups) = Self::touched(ctx, key);
        ctx.commit_change(Change::touched(ids).with_groups(groups).structural())
    }
}

#[derive(Debug, Clone)]
pub struct RenameBlock {
    index: usize,
    name: String,
    old: Option<String>,
}

impl RenameBlock {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            old: None,
        }
    }

    fn apply(&self, ctx: &mut PatternContext, value: Option<&String>) -> Result<(), EngineError> {
        let key = *ctx
            .tree
            .blocks()
            .get(self.index)
            .ok_or(EngineError::UnknownBlock(self.index))?;
        restore_attribute(ctx, key, attr::NAME, value);
        ctx.commit_change(Change::default())?;
        if ctx.blocks.active() == self.index {
            let name = ctx.blocks.name(self.index).unwrap_or_default().to_string();
            ctx.emit(DocumentEvent::ActiveBlockChanged {
                index: self.index,
                name,
            });
        }
        Ok(())
    }
}

impl UndoCommand for RenameBlock {
    fn text(&self) -> String {
        format!("重命名图块为 {}", self.name)
    }

    fn block(&self) -> Option<usize> {
        Some(self.index)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        if self.name.trim().is_empty() {
            return Err(EngineError::EmptyName);
        }
        let key = *ctx
            .tree
            .blocks()
            .get(self.index)
            .ok_or(EngineError::UnknownBlock(self.index))?;
        self.old = ctx.tree.attribute(key, attr::NAME).map(str::to_string);
        let name = self.name.clone();
        self.apply(ctx, Some(&name))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let old = self.old.clone();
        self.apply(ctx, old.as_ref())
    }
}
