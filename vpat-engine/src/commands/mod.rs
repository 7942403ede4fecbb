//! 可撤销命令。每个命令的 `redo` 依次完成：按 id 定位节点（缺失即中止）、修改树、
//! 从修改后的子树重建对象库与依赖图、按顺序通知观察者。`undo` 用捕获的前像做精确逆操作。

mod entity;
mod group;
mod operation;
mod piece;

use tracing::debug;
use vpat_core::document::{EntityId, InsertPosition, NodeData, NodeKey, NodeTag};

use crate::context::PatternContext;
use crate::errors::EngineError;

pub use entity::{AddEntity, DeleteEntity, MoveEntity, RenameBlock, RenameEntity, SetAttribute};
pub use group::{
    AddGroup, AddItemToGroup, ChangeGroupOptions, ChangeGroupVisibility,
    ChangeMultipleGroupsVisibility, DeleteGroup, RemoveItemFromGroup,
};
pub use operation::{GroupRequest, OperationRequest, build_operation};
pub use piece::{
    FlippingRule, SavePieceOptions, ToggleHideMainPath, TogglePieceFlipping, TogglePieceInLayout,
    ToggleShowFullPiece,
};

pub trait UndoCommand {
    fn text(&self) -> String;

    /// 构造时的激活图块，撤销/重做后据此恢复视图。
    fn block(&self) -> Option<usize> {
        None
    }

    /// 命令编辑的实体。撤销/重做后优先按其顶点所在图块恢复视图。
    fn subject(&self) -> Option<EntityId> {
        None
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError>;

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError>;
}

/// 命令的封闭集合。
#[derive(Debug, Clone)]
pub enum Command {
    AddEntity(AddEntity),
    DeleteEntity(DeleteEntity),
    RenameEntity(RenameEntity),
    SetAttribute(SetAttribute),
    MoveEntity(MoveEntity),
    TogglePieceInLayout(TogglePieceInLayout),
    TogglePieceFlipping(TogglePieceFlipping),
    ToggleHideMainPath(ToggleHideMainPath),
    ToggleShowFullPiece(ToggleShowFullPiece),
    SavePieceOptions(SavePieceOptions),
    RenameBlock(RenameBlock),
    AddGroup(AddGroup),
    DeleteGroup(DeleteGroup),
    ChangeGroupOptions(ChangeGroupOptions),
    AddItemToGroup(AddItemToGroup),
    RemoveItemFromGroup(RemoveItemFromGroup),
    ChangeGroupVisibility(ChangeGroupVisibility),
    ChangeMultipleGroupsVisibility(ChangeMultipleGroupsVisibility),
    Macro(Macro),
}

impl Command {
    fn inner(&self) -> &dyn UndoCommand {
        match self {
            Command::AddEntity(command) => command,
            Command::DeleteEntity(command) => command,
            Command::RenameEntity(command) => command,
            Command::SetAttribute(command) => command,
            Command::MoveEntity(command) => command,
            Command::TogglePieceInLayout(command) => command,
            Command::TogglePieceFlipping(command) => command,
            Command::ToggleHideMainPath(command) => command,
            Command::ToggleShowFullPiece(command) => command,
            Command::SavePieceOptions(command) => command,
            Command::RenameBlock(command) => command,
            Command::AddGroup(command) => command,
            Command::DeleteGroup(command) => command,
            Command::ChangeGroupOptions(command) => command,
            Command::AddItemToGroup(command) => command,
            Command::RemoveItemFromGroup(command) => command,
            Command::ChangeGroupVisibility(command) => command,
            Command::ChangeMultipleGroupsVisibility(command) => command,
            Command::Macro(command) => command,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn UndoCommand {
        match self {
            Command::AddEntity(command) => command,
            Command::DeleteEntity(command) => command,
            Command::RenameEntity(command) => command,
            Command::SetAttribute(command) => command,
            Command::MoveEntity(command) => command,
            Command::TogglePieceInLayout(command) => command,
            Command::TogglePieceFlipping(command) => command,
            Command::ToggleHideMainPath(command) => command,
            Command::ToggleShowFullPiece(command) => command,
            Command::SavePieceOptions(command) => command,
            Command::RenameBlock(command) => command,
            Command::AddGroup(command) => command,
            Command::DeleteGroup(command) => command,
            Command::ChangeGroupOptions(command) => command,
            Command::AddItemToGroup(command) => command,
            Command::RemoveItemFromGroup(command) => command,
            Command::ChangeGroupVisibility(command) => command,
            Command::ChangeMultipleGroupsVisibility(command) => command,
            Command::Macro(command) => command,
        }
    }
}

impl UndoCommand for Command {
    fn text(&self) -> String {
        self.inner().text()
    }

    fn block(&self) -> Option<usize> {
        self.inner().block()
    }

    fn subject(&self) -> Option<EntityId> {
        self.inner().subject()
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        self.inner_mut().redo(ctx)
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        self.inner_mut().undo(ctx)
    }
}

macro_rules! impl_from_command {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Command {
                fn from(command: $variant) -> Self {
                    Command::$variant(command)
                }
            }
        )*
    };
}

impl_from_command!(
    AddEntity,
    DeleteEntity,
    RenameEntity,
    SetAttribute,
    MoveEntity,
    TogglePieceInLayout,
    TogglePieceFlipping,
    ToggleHideMainPath,
    ToggleShowFullPiece,
    SavePieceOptions,
    RenameBlock,
    AddGroup,
    DeleteGroup,
    ChangeGroupOptions,
    AddItemToGroup,
    RemoveItemFromGroup,
    ChangeGroupVisibility,
    ChangeMultipleGroupsVisibility,
    Macro,
);

/// 有序组合命令，占一条历史记录。撤销时逆序执行子命令。
#[derive(Debug, Clone)]
pub struct Macro {
    text: String,
    children: Vec<Command>,
}

impl Macro {
    pub fn new(text: impl Into<String>, children: Vec<Command>) -> Self {
        Self {
            text: text.into(),
            children,
        }
    }

    pub fn children(&self) -> &[Command] {
        &self.children
    }
}

fn rollback_failed(command: &Command, err: EngineError) -> EngineError {
    EngineError::InconsistentDocument(format!("rollback of '{}' failed: {err}", command.text()))
}

impl UndoCommand for Macro {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn block(&self) -> Option<usize> {
        self.children.first().and_then(UndoCommand::block)
    }

    fn subject(&self) -> Option<EntityId> {
        self.children.first().and_then(UndoCommand::subject)
    }

    fn redo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        for index in 0..self.children.len() {
            if let Err(err) = self.children[index].redo(ctx) {
                // 回滚已执行的子命令，保持原子性
                for done in self.children[..index].iter_mut().rev() {
                    if let Err(rollback) = done.undo(ctx) {
                        return Err(rollback_failed(done, rollback));
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn undo(&mut self, ctx: &mut PatternContext) -> Result<(), EngineError> {
        let count = self.children.len();
        for index in (0..count).rev() {
            if let Err(err) = self.children[index].undo(ctx) {
                for done in self.children[index + 1..].iter_mut() {
                    if let Err(rollback) = done.redo(ctx) {
                        return Err(rollback_failed(done, rollback));
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// 从树上摘下的顶层实体，连同其原始位置。
#[derive(Debug, Clone)]
pub(crate) struct Detached {
    pub data: NodeData,
    /// 原先紧邻的前一个兄弟节点，`None` 表示原本位于首位。
    pub previous: Option<EntityId>,
    /// 历史日志中同一容器内最近的前驱，`previous` 已不存在时作为退路。
    pub ordered: Option<EntityId>,
    pub block: usize,
    pub container: NodeTag,
}

pub(crate) fn is_container(tag: NodeTag) -> bool {
    matches!(
        tag,
        NodeTag::Calculation | NodeTag::Details | NodeTag::Groups | NodeTag::BackgroundImages
    )
}

pub(crate) fn detach(ctx: &mut PatternContext, key: NodeKey) -> Result<Detached, EngineError> {
    let id = ctx.tree.id_of(key);
    let container = ctx
        .tree
        .parent(key)
        .and_then(|parent| ctx.tree.tag(parent))
        .filter(|tag| is_container(*tag));
    let (Some(id), Some(container)) = (id, container) else {
        return Err(EngineError::InconsistentDocument(
            "only top-level entities can be detached".to_string(),
        ));
    };
    let block = ctx.tree.block_index_of(key).unwrap_or(0);
    let previous = ctx
        .tree
        .previous_sibling(key)
        .and_then(|sibling| ctx.tree.id_of(sibling));
    let ordered = ctx.records.previous_in_parent(&ctx.tree, id);
    let data = ctx
        .tree
        .remove(key)
        .ok_or_else(|| EngineError::InconsistentDocument(format!("cannot remove {id}")))?;
    debug!(
        id = id.get(),
        previous = ?previous.map(EntityId::get),
        ordered = ?ordered.map(EntityId::get),
        "节点已摘除"
    );
    Ok(Detached {
        data,
        previous,
        ordered,
        block,
        container,
    })
}

/// 紧接记录的前一个兄弟重新插入。兄弟已不存在时发出一致性警告，
/// 退到历史日志中的前驱之后；前驱也不存在时追加到末尾。
pub(crate) fn reattach(ctx: &mut PatternContext, detached: &Detached) -> Result<NodeKey, EngineError> {
    let parent = ctx.container(detached.block, detached.container)?;
    let sibling = |ctx: &PatternContext, id: EntityId| {
        ctx.tree
            .find_by_id(id)
            .filter(|anchor| ctx.tree.parent(*anchor) == Some(parent))
    };
    let position = match detached.previous {
        None => InsertPosition::First,
        Some(previous) => match sibling(ctx, previous) {
            Some(anchor) => InsertPosition::After(anchor),
            None => {
                ctx.consistency_warning(format!(
                    "sibling {previous} is gone, original order cannot be restored"
                ));
                detached
                    .ordered
                    .and_then(|ordered| sibling(ctx, ordered))
                    .map_or(InsertPosition::Append, InsertPosition::After)
            }
        },
    };
    Ok(ctx.tree.insert_data(parent, position, detached.data.clone()))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use vpat_core::document::{DocumentTree, EntityKind, attr};

    use super::*;
    use crate::context::DEFAULT_BLOCK_NAME;
    use crate::events::DocumentEvent;
    use crate::store::Measurements;

    fn warnings(ctx: &mut PatternContext) -> Rc<RefCell<Vec<String>>> {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&messages);
        ctx.events_mut().subscribe(move |event| {
            if let DocumentEvent::ConsistencyWarning(message) = event {
                sink.borrow_mut().push(message.clone());
            }
        });
        messages
    }

    fn calculation(children: Vec<NodeData>) -> PatternContext {
        let calculation = children
            .into_iter()
            .fold(NodeData::new(NodeTag::Calculation), NodeData::with_child);
        let data = NodeData::new(NodeTag::Pattern)
            .with_child(NodeData::new(NodeTag::Block).with_child(calculation));
        PatternContext::load(DocumentTree::from_data(data), Measurements::new()).unwrap()
    }

    fn point(id: u64, x: &str) -> NodeData {
        NodeData::new(NodeTag::Point)
            .with_id(EntityId::new(id))
            .with_attr("x", x)
            .with_attr("y", "0")
    }

    #[test]
    fn macro_rolls_back_applied_children_on_failure() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let before = ctx.snapshot();
        let add = AddEntity::new(&mut ctx, EntityKind::Point, [("x", "1"), ("y", "2")]);
        let missing = RenameEntity::new(&ctx, EntityId::new(999), "A");
        let mut command = Macro::new("batch", vec![add.into(), missing.into()]);

        let err = command.redo(&mut ctx).unwrap_err();
        assert_eq!(err, EngineError::StaleReference(EntityId::new(999)));
        assert_eq!(ctx.snapshot(), before);
    }

    #[test]
    fn macro_undo_runs_children_in_reverse() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let add = AddEntity::new(&mut ctx, EntityKind::Point, [("x", "1"), ("y", "2")]);
        let id = add.id();
        let rename = RenameEntity::new(&ctx, id, "A");
        let mut command = Macro::new("batch", vec![add.into(), rename.into()]);
        command.redo(&mut ctx).unwrap();
        let key = ctx.tree().find_by_id(id).unwrap();
        assert_eq!(ctx.tree().attribute(key, attr::NAME), Some("A"));

        command.undo(&mut ctx).unwrap();
        assert!(ctx.tree().find_by_id(id).is_none());
        assert!(ctx.store().is_empty());
    }

    #[test]
    fn reattach_without_anchor_appends_and_warns() {
        let mut ctx = calculation(vec![point(1, "0"), point(2, "1"), point(3, "2")]);
        let messages = warnings(&mut ctx);
        let mut delete_third = DeleteEntity::new(&ctx, EntityId::new(3));
        delete_third.redo(&mut ctx).unwrap();
        let mut delete_second = DeleteEntity::new(&ctx, EntityId::new(2));
        delete_second.redo(&mut ctx).unwrap();
        let mut delete_first = DeleteEntity::new(&ctx, EntityId::new(1));
        delete_first.redo(&mut ctx).unwrap();
        delete_first.undo(&mut ctx).unwrap();
        assert!(messages.borrow().is_empty());

        // 跳过中间的撤销，3 的前一个兄弟 2 已不存在
        delete_third.undo(&mut ctx).unwrap();
        assert_eq!(messages.borrow().len(), 1);
        assert!(messages.borrow()[0].contains("sibling 2 is gone"));
        assert_eq!(ctx.records().ids(), vec![EntityId::new(1), EntityId::new(3)]);
        assert!(ctx.store().contains(EntityId::new(3)));
        assert!(ctx.graph().has_vertex(EntityId::new(3)));
    }

    #[test]
    fn reattach_falls_back_to_previous_ordered_record() {
        let image = NodeData::new(NodeTag::BackgroundImage).with_id(EntityId::new(9));
        let mut ctx = calculation(vec![point(1, "0"), image, point(2, "1"), point(3, "@1.x + 5")]);
        let messages = warnings(&mut ctx);

        let mut delete_point = DeleteEntity::new(&ctx, EntityId::new(2));
        delete_point.redo(&mut ctx).unwrap();
        let mut delete_image = DeleteEntity::new(&ctx, EntityId::new(9));
        delete_image.redo(&mut ctx).unwrap();

        delete_point.undo(&mut ctx).unwrap();
        assert_eq!(messages.borrow().len(), 1);
        assert_eq!(
            ctx.records().ids(),
            vec![EntityId::new(1), EntityId::new(2), EntityId::new(3)]
        );
        let x = ctx.store().get(EntityId::new(2)).and_then(|o| o.position).map(|p| p.x());
        assert_eq!(x, Some(1.0));
    }
}
