use std::collections::BTreeMap;

use vpat_core::document::{EntityId, InsertPosition, NodeData, NodeKey, NodeTag, attr};

use super::{Detached, UndoCommand, detach, reattach};
use crate::context::{Change, PatternContext};
use crate::errors::EngineError;
use crate::groups::{SourceItem, join_tags, parse_visible};

fn require_group(ctx: &PatternContext, id: EntityId) -> Result<NodeKey, EngineError> {
    let key = ctx.require_node(id)?;
    if ctx.tree.tag(key) != Some(NodeTag::Group) {
        return Err(EngineError::UnknownGroup(id));
    }
    Ok(key)
}

fn item_data(item: &SourceItem) -> NodeData {
    let data = NodeData::new(NodeTag::Item).with_attr(attr::OBJECT, item.id.get().to_string());
    match &item.alias {
        Some(alias) => data.with_attr(attr::ALIAS, alias.clone()),
        None => data,
    }
}

fn member_index(ctx: &PatternContext, group: NodeKey, object: EntityId) -> Option<usize> {
    ctx.tree.children(group).iter().position(|item| {
        ctx.tree
            .attribute(*item, attr::OBJECT)
            .and_then(EntityId::parse)
            == Some(object)
    })
}

fn restore(ctx: &mut PatternContext, key: NodeKey, name: &str, old: Option<&String>) {
    match old {
        Some(value) => {
            ctx.tree.set_attribute(key, name, value.clone());
        }
        None => {
            ctx.tree.remove_attribute(key, name);
        }
    }
}

/// 新建分组。成员必须已存在。
#[derive(Debug, Clone)]
pub struct AddGroup {
    id: EntityId,
    name: String,
    tags: Vec<String>,
    items: Vec<SourceItem>,
}

impl AddGroup {
    pub fn new(
        ctx: &mut PatternContext,
        name: impl Into<String>,
        tags: Vec<String>,
        items: Vec<SourceItem>,
    ) -> Self {
        Self {
            id: ctx.allocate_id(),
            name: name.into(),
            tags,
            items,
        }
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    fn node_data(&self) -> NodeData {
        let mut data = NodeData::new(NodeTag::Group)
            .with_id(self.id)
            .with_attr(attr::NAME, self.name.clone());
        if !self.tags.is_empty() {
            data = data.with_attr(attr::TAGS, join_tags(&self.tags));
        }
        self.items
            .iter()
            .fold(data, |data, item| data.with_child(item_data(item)))
    }
}

impl UndoCommand for AddGroup {
    fn text(&self) -> String {
        format!("添加分组 {}", self.name)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        if self.id.is_null() {
            return Err(EngineError::IdSpaceExhausted);
        }
        if self.name.trim().is_empty() {
            return Err(EngineError::EmptyName);
        }
        if let Some(missing) = self
            .items
            .iter()
            .map(|item| item.id)
            .find(|id| ctx.tree.find_by_id(*id).is_none())
        {
            return Err(EngineError::DanglingFormula {
                owner: self.id,
                missing,
            });
        }
        let container = ctx.container(0, NodeTag::Groups)?;
        ctx.tree
            .insert_data(container, InsertPosition::Append, self.node_data());
        ctx.commit_change(Change::touched([self.id]).with_groups(true))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.id)?;
        ctx.tree.remove(key);
        ctx.commit_change(Change::removed([self.id]).with_groups(true))
    }
}

#[derive(Debug, Clone)]
pub struct DeleteGroup {
    id: EntityId,
    detached: Option<Detached>,
}

impl DeleteGroup {
    pub fn new(id: EntityId) -> Self {
        Self { id, detached: None }
    }
}

impl UndoCommand for DeleteGroup {
    fn text(&self) -> String {
        "删除分组".to_string()
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.id)?;
        self.detached = Some(detach(ctx, key)?);
        ctx.commit_change(Change::removed([self.id]).with_groups(true))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let Some(detached) = self.detached.as_ref() else {
            return Err(EngineError::InconsistentDocument(
                "group delete was never applied".to_string(),
            ));
        };
        reattach(ctx, detached)?;
        ctx.commit_change(Change::touched([self.id]).with_groups(true))
    }
}

/// 修改分组名称与标签。
#[derive(Debug, Clone)]
pub struct ChangeGroupOptions {
    id: EntityId,
    name: Option<String>,
    tags: Option<Vec<String>>,
    old: Vec<(&'static str, Option<String>)>,
}

impl ChangeGroupOptions {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            name: None,
            tags: None,
            old: Vec::new(),
        }
    }

    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn retag(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }
}

impl UndoCommand for ChangeGroupOptions {
    fn text(&self) -> String {
        "修改分组选项".to_string()
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.id)?;
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(EngineError::EmptyName);
        }
        self.old.clear();
        if let Some(name) = &self.name {
            let old = ctx.tree.set_attribute(key, attr::NAME, name.clone());
            self.old.push((attr::NAME, old));
        }
        if let Some(tags) = &self.tags {
            let old = ctx.tree.set_attribute(key, attr::TAGS, join_tags(tags));
            self.old.push((attr::TAGS, old));
        }
        ctx.commit_change(Change::touched([self.id]).with_groups(true))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.id)?;
        for (name, old) in self.old.iter().rev() {
            restore(ctx, key, name, old.as_ref());
        }
        ctx.commit_change(Change::touched([self.id]).with_groups(true))
    }
}

#[derive(Debug, Clone)]
pub struct AddItemToGroup {
    group: EntityId,
    item: SourceItem,
    index: Option<usize>,
}

impl AddItemToGroup {
    pub fn new(group: EntityId, item: SourceItem) -> Self {
        Self {
            group,
            item,
            index: None,
        }
    }
}

impl UndoCommand for AddItemToGroup {
    fn text(&self) -> String {
        "添加分组成员".to_string()
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        if ctx.tree.find_by_id(self.item.id).is_none() {
            return Err(EngineError::DanglingFormula {
                owner: self.group,
                missing: self.item.id,
            });
        }
        if member_index(ctx, key, self.item.id).is_some() {
            return Err(EngineError::AlreadyGroupMember {
                group: self.group,
                id: self.item.id,
            });
        }
        ctx.tree
            .insert_data(key, InsertPosition::Append, item_data(&self.item));
        self.index = ctx.tree.children(key).len().checked_sub(1);
        ctx.commit_change(Change::touched([self.group]).with_groups(true))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        let child = member_index(ctx, key, self.item.id)
            .or(self.index)
            .and_then(|index| ctx.tree.children(key).get(index).copied())
            .ok_or(EngineError::EntityNotFound(self.item.id))?;
        ctx.tree.remove(child);
        ctx.commit_change(Change::touched([self.group]).with_groups(true))
    }
}

#[derive(Debug, Clone)]
pub struct RemoveItemFromGroup {
    group: EntityId,
    object: EntityId,
    removed: Option<(usize, NodeData)>,
}

impl RemoveItemFromGroup {
    pub fn new(group: EntityId, object: EntityId) -> Self {
        Self {
            group,
            object,
            removed: None,
        }
    }
}

impl UndoCommand for RemoveItemFromGroup {
    fn text(&self) -> String {
        "移除分组成员".to_string()
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        let index =
            member_index(ctx, key, self.object).ok_or(EngineError::EntityNotFound(self.object))?;
        let child = ctx.tree.children(key)[index];
        let data = ctx.tree.remove(child).ok_or_else(|| {
            EngineError::InconsistentDocument(format!("cannot remove member {}", self.object))
        })?;
        self.removed = Some((index, data));
        ctx.commit_change(Change::touched([self.group]).with_groups(true))
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        let Some((index, data)) = self.removed.clone() else {
            return Err(EngineError::InconsistentDocument(
                "member removal was never applied".to_string(),
            ));
        };
        ctx.tree.insert_data(key, InsertPosition::Index(index), data);
        ctx.commit_change(Change::touched([self.group]).with_groups(true))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeGroupVisibility {
    group: EntityId,
    visible: bool,
    old: Option<String>,
}

impl ChangeGroupVisibility {
    pub fn new(group: EntityId, visible: bool) -> Self {
        Self {
            group,
            visible,
            old: None,
        }
    }
}

impl UndoCommand for ChangeGroupVisibility {
    fn text(&self) -> String {
        if self.visible {
            "显示分组".to_string()
        } else {
            "隐藏分组".to_string()
        }
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        self.old = ctx
            .tree
            .set_attribute(key, attr::VISIBLE, self.visible.to_string());
        ctx.commit_change(
            Change::touched([self.group])
                .with_visibility(BTreeMap::from([(self.group, self.visible)])),
        )
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_group(ctx, self.group)?;
        restore(ctx, key, attr::VISIBLE, self.old.as_ref());
        let visible = parse_visible(self.old.as_deref());
        ctx.commit_change(
            Change::touched([self.group]).with_visibility(BTreeMap::from([(self.group, visible)])),
        )
    }
}

/// 一次修改多个分组的可见性，只占一条历史记录、只发一次聚合通知。
#[derive(Debug, Clone)]
pub struct ChangeMultipleGroupsVisibility {
    changes: BTreeMap<EntityId, bool>,
    old: Vec<(EntityId, Option<String>)>,
}

impl ChangeMultipleGroupsVisibility {
    pub fn new(changes: BTreeMap<EntityId, bool>) -> Self {
        Self {
            changes,
            old: Vec::new(),
        }
    }

    pub fn changes(&self) -> &BTreeMap<EntityId, bool> {
        &self.changes
    }
}

impl UndoCommand for ChangeMultipleGroupsVisibility {
    fn text(&self) -> String {
        format!("修改 {} 个分组的可见性", self.changes.len())
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let mut keys = Vec::with_capacity(self.changes.len());
        for (group, visible) in &self.changes {
            keys.push((*group, require_group(ctx, *group)?, *visible));
        }
        self.old.clear();
        for (group, key, visible) in keys {
            let old = ctx.tree.set_attribute(key, attr::VISIBLE, visible.to_string());
            self.old.push((group, old));
        }
        ctx.commit_change(
            Change::touched(self.changes.keys().copied()).with_visibility(self.changes.clone()),
        )
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let mut keys = Vec::with_capacity(self.old.len());
        for (group, _) in &self.old {
            keys.push(require_group(ctx, *group)?);
        }
        let mut restored = BTreeMap::new();
        for ((group, old), key) in self.old.iter().zip(keys).rev() {
            restore(ctx, key, attr::VISIBLE, old.as_ref());
            restored.insert(*group, parse_visible(old.as_deref()));
        }
        ctx.commit_change(Change::touched(restored.keys().copied()).with_visibility(restored))
    }
}
