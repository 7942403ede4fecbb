//! 裁片状态与选项。状态开关只改裁片节点上的布尔属性；选项保存整体替换裁片子树。

use tracing::debug;
use vpat_core::document::{EntityId, EntityKind, InsertPosition, NodeData, NodeKey, NodeTag, attr};

use super::UndoCommand;
use super::entity::{restore_attribute, subtree_ids};
use crate::context::{Change, PatternContext};
use crate::errors::EngineError;
use crate::groups::parse_visible;

fn require_piece(ctx: &PatternContext, id: EntityId) -> Result<NodeKey, EngineError> {
    let key = ctx.require_node(id)?;
    if ctx.tree.entity_kind(key) != Some(EntityKind::Piece) {
        return Err(EngineError::WrongKind {
            id,
            expected: EntityKind::Piece,
        });
    }
    Ok(key)
}

/// 缺省为 `false` 的开关属性。
fn flag(ctx: &PatternContext, key: NodeKey, name: &str) -> bool {
    ctx.tree
        .attribute(key, name)
        .is_some_and(|raw| matches!(raw.trim(), "true" | "1"))
}

/// 一组开关属性的写入及其前像。
#[derive(Debug, Clone)]
struct FlagEdit {
    id: EntityId,
    block: usize,
    old: Vec<(&'static str, Option<String>)>,
}

impl FlagEdit {
    fn new(ctx: &PatternContext, id: EntityId) -> Self {
        Self {
            id,
            block: ctx.blocks.active(),
            old: Vec::new(),
        }
    }

    fn write(
        &mut self,
        ctx: &mut PatternContext,
        key: NodeKey,
        flags: &[(&'static str, bool)],
    ) -> Result<(), EngineError> {
        self.old = flags
            .iter()
            .map(|(name, value)| (*name, ctx.tree.set_attribute(key, name, value.to_string())))
            .collect();
        debug!(piece = self.id.get(), ?flags, "裁片状态已修改");
        ctx.commit_change(Change::touched([self.id]))
    }

    fn revert(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        let key = ctx.require_node(self.id)?;
        for (name, old) in self.old.iter().rev() {
            restore_attribute(ctx, key, name, old.as_ref());
        }
        ctx.commit_change(Change::touched([self.id]))
    }
}

/// 切换裁片是否参与排版。
#[derive(Debug, Clone)]
pub struct TogglePieceInLayout {
    edit: FlagEdit,
}

impl TogglePieceInLayout {
    pub fn new(ctx: &PatternContext, id: EntityId) -> Self {
        Self {
            edit: FlagEdit::new(ctx, id),
        }
    }
}

impl UndoCommand for TogglePieceInLayout {
    fn text(&self) -> String {
        "切换裁片排版".to_string()
    }

    fn block(&self) -> Option<usize> {
        Some(self.edit.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.edit.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_piece(ctx, self.edit.id)?;
        let current = parse_visible(ctx.tree.attribute(key, attr::IN_LAYOUT));
        self.edit.write(ctx, key, &[(attr::IN_LAYOUT, !current)])
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        self.edit.revert(ctx)
    }
}

/// 裁片翻转规则。强制与禁止互斥。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlippingRule {
    Force,
    Forbid,
}

impl FlippingRule {
    fn key(self) -> &'static str {
        match self {
            FlippingRule::Force => attr::FORCE_FLIPPING,
            FlippingRule::Forbid => attr::FORBID_FLIPPING,
        }
    }

    fn opposite(self) -> Self {
        match self {
            FlippingRule::Force => FlippingRule::Forbid,
            FlippingRule::Forbid => FlippingRule::Force,
        }
    }
}

/// 设置强制或禁止翻转。打开一条规则会关闭另一条。
#[derive(Debug, Clone)]
pub struct TogglePieceFlipping {
    edit: FlagEdit,
    rule: FlippingRule,
    state: bool,
}

impl TogglePieceFlipping {
    pub fn new(ctx: &PatternContext, id: EntityId, rule: FlippingRule, state: bool) -> Self {
        Self {
            edit: FlagEdit::new(ctx, id),
            rule,
            state,
        }
    }
}

impl UndoCommand for TogglePieceFlipping {
    fn text(&self) -> String {
        match self.rule {
            FlippingRule::Force => "切换强制翻转".to_string(),
            FlippingRule::Forbid => "切换禁止翻转".to_string(),
        }
    }

    fn block(&self) -> Option<usize> {
        Some(self.edit.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.edit.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_piece(ctx, self.edit.id)?;
        let mut flags = vec![(self.rule.key(), self.state)];
        let other = self.rule.opposite().key();
        if self.state && flag(ctx, key, other) {
            flags.push((other, false));
        }
        self.edit.write(ctx, key, &flags)
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        self.edit.revert(ctx)
    }
}

/// 显示或隐藏裁片主轮廓。
#[derive(Debug, Clone)]
pub struct ToggleHideMainPath {
    edit: FlagEdit,
    state: bool,
}

impl ToggleHideMainPath {
    pub fn new(ctx: &PatternContext, id: EntityId, state: bool) -> Self {
        Self {
            edit: FlagEdit::new(ctx, id),
            state,
        }
    }
}

impl UndoCommand for ToggleHideMainPath {
    fn text(&self) -> String {
        "切换主轮廓显示".to_string()
    }

    fn block(&self) -> Option<usize> {
        Some(self.edit.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.edit.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_piece(ctx, self.edit.id)?;
        self.edit.write(ctx, key, &[(attr::HIDE_MAIN_PATH, self.state)])
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        self.edit.revert(ctx)
    }
}

/// 切换对称裁片是否展开显示。
#[derive(Debug, Clone)]
pub struct ToggleShowFullPiece {
    edit: FlagEdit,
    state: bool,
}

impl ToggleShowFullPiece {
    pub fn new(ctx: &PatternContext, id: EntityId, state: bool) -> Self {
        Self {
            edit: FlagEdit::new(ctx, id),
            state,
        }
    }
}

impl UndoCommand for ToggleShowFullPiece {
    fn text(&self) -> String {
        "切换完整裁片显示".to_string()
    }

    fn block(&self) -> Option<usize> {
        Some(self.edit.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.edit.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_piece(ctx, self.edit.id)?;
        self.edit.write(ctx, key, &[(attr::SHOW_FULL_PIECE, self.state)])
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        self.edit.revert(ctx)
    }
}

/// 用新的裁片描述整体替换裁片节点（属性与路径节点），位置不变。
#[derive(Debug, Clone)]
pub struct SavePieceOptions {
    id: EntityId,
    data: NodeData,
    old: Option<NodeData>,
    block: usize,
}

impl SavePieceOptions {
    pub fn new(ctx: &PatternContext, id: EntityId, data: NodeData) -> Self {
        Self {
            id,
            data: data.with_id(id),
            old: None,
            block: ctx.blocks.active(),
        }
    }

    /// 把 `key` 处的子树换成 `data`，返回新节点与被换下的子树。
    fn replace(
        ctx: &mut PatternContext,
        key: NodeKey,
        data: NodeData,
    ) -> Result<(NodeKey, NodeData), EngineError> {
        let inconsistent = || EngineError::InconsistentDocument("piece has no container".to_string());
        let parent = ctx.tree.parent(key).ok_or_else(inconsistent)?;
        let index = ctx.tree.index_in_parent(key).ok_or_else(inconsistent)?;
        let old = ctx.tree.remove(key).ok_or_else(inconsistent)?;
        let key = ctx.tree.insert_data(parent, InsertPosition::Index(index), data);
        Ok((key, old))
    }

    fn commit(&self, ctx: &mut PatternContext, key: NodeKey, replaced: &NodeData) -> Result<(), EngineError> {
        let touched = subtree_ids(ctx, key);
        let removed: Vec<EntityId> = replaced
            .ids()
            .into_iter()
            .filter(|id| !touched.contains(id))
            .collect();
        ctx.commit_change(Change {
            removed,
            ..Change::touched(touched)
        })
    }
}

impl UndoCommand for SavePieceOptions {
    fn text(&self) -> String {
        "保存裁片选项".to_string()
    }

    fn block(&self) -> Option<usize> {
        Some(self.block)
    }

    fn subject(&self) -> Option<EntityId> {
        Some(self.id)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let key = require_piece(ctx, self.id)?;
        if self.data.tag != NodeTag::Piece {
            return Err(EngineError::WrongKind {
                id: self.id,
                expected: EntityKind::Piece,
            });
        }
        let (key, old) = Self::replace(ctx, key, self.data.clone())?;
        if let Err(err) = ctx.validate_nodes(&[key]) {
            Self::replace(ctx, key, old)?;
            return Err(err);
        }
        debug!(piece = self.id.get(), "裁片选项已替换");
        self.commit(ctx, key, &old)?;
        self.old = Some(old);
        Ok(())
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        ctx.check_writable()?;
        let old = self.old.clone().ok_or_else(|| {
            EngineError::InconsistentDocument("piece options were never saved".to_string())
        })?;
        let key = ctx.require_node(self.id)?;
        let (key, replaced) = Self::replace(ctx, key, old)?;
        self.commit(ctx, key, &replaced)
    }
}
