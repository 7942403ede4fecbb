//! 撤销栈。所有文档修改都经由此处；失败分两类处理：
//! 前置条件类错误中止命令并保留历史，其余错误视为文档不一致，全量重建并清空历史。

use tracing::{debug, error, warn};

use crate::commands::{Command, UndoCommand};
use crate::context::PatternContext;
use crate::errors::EngineError;
use crate::events::DocumentEvent;

/// 一次入栈、撤销或重做的结果。
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    /// 命令未生效，文档与历史保持不变。
    Aborted(EngineError),
    /// 派生结构已从文档树全量重建，历史已清空。
    Recovered(EngineError),
    /// 没有可撤销或可重做的命令。
    Ignored,
}

impl Outcome {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

#[derive(Debug, Default)]
pub struct CommandStack {
    commands: Vec<Command>,
    index: usize,
    clean_index: Option<usize>,
    undo_limit: usize,
    executing: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    Push,
    Undo,
    Redo,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "执行",
            Direction::Undo => "撤销",
            Direction::Redo => "重做",
        }
    }
}

impl CommandStack {
    /// `undo_limit == 0` 表示不限制历史长度。
    pub fn new(undo_limit: usize) -> Self {
        Self {
            clean_index: Some(0),
            undo_limit,
            ..Self::default()
        }
    }

    fn enter(&mut self) -> Result<(), EngineError> {
        if self.executing {
            return Err(EngineError::ReentrantCommand);
        }
        self.executing = true;
        Ok(())
    }

    /// 执行命令并记入历史。命令失败时不入栈。
    pub fn push(&mut self, ctx: &mut PatternContext, mut command: Command) -> Result<Outcome, EngineError> {
        self.enter()?;
        let result = command.redo(ctx);
        self.executing = false;
        let text = command.text();
        if let Err(err) = result {
            return Ok(self.fail(ctx, Direction::Push, &text, err));
        }

        self.commands.truncate(self.index);
        if self.clean_index.is_some_and(|clean| clean > self.index) {
            self.clean_index = None;
        }
        self.commands.push(command);
        self.index += 1;
        self.enforce_limit();
        debug!(command = %text, depth = self.index, "命令已入栈");
        ctx.emit(DocumentEvent::DocumentChanged);
        Ok(Outcome::Applied)
    }

    pub fn undo(&mut self, ctx: &mut PatternContext) -> Result<Outcome, EngineError> {
        if self.index == 0 {
            return Ok(Outcome::Ignored);
        }
        self.enter()?;
        let command = &mut self.commands[self.index - 1];
        let result = command.undo(ctx);
        self.executing = false;
        let text = command.text();
        let block = command
            .subject()
            .and_then(|id| ctx.graph.get_vertex(id))
            .map(|vertex| vertex.block)
            .or_else(|| command.block());
        if let Err(err) = result {
            return Ok(self.fail(ctx, Direction::Undo, &text, err));
        }
        self.index -= 1;
        self.settle(ctx, block, Direction::Undo, &text);
        Ok(Outcome::Applied)
    }

    pub fn redo(&mut self, ctx: &mut PatternContext) -> Result<Outcome, EngineError> {
        if self.index >= self.commands.len() {
            return Ok(Outcome::Ignored);
        }
        self.enter()?;
        let command = &mut self.commands[self.index];
        let result = command.redo(ctx);
        self.executing = false;
        let text = command.text();
        let block = command
            .subject()
            .and_then(|id| ctx.graph.get_vertex(id))
            .map(|vertex| vertex.block)
            .or_else(|| command.block());
        if let Err(err) = result {
            return Ok(self.fail(ctx, Direction::Redo, &text, err));
        }
        self.index += 1;
        self.settle(ctx, block, Direction::Redo, &text);
        Ok(Outcome::Applied)
    }

    fn settle(&mut self, ctx: &mut PatternContext, block: Option<usize>, direction: Direction, text: &str) {
        if let Some(block) = block {
            ctx.restore_block(block);
        }
        debug!(command = %text, depth = self.index, "{}完成", direction.as_str());
        ctx.emit(DocumentEvent::DocumentChanged);
    }

    fn fail(
        &mut self,
        ctx: &mut PatternContext,
        direction: Direction,
        text: &str,
        err: EngineError,
    ) -> Outcome {
        if err.is_recoverable() || err.is_precondition() {
            warn!(command = %text, error = %err, "{}已中止", direction.as_str());
            ctx.status(format!("{}“{text}”失败：{err}", direction.as_str()));
            return Outcome::Aborted(err);
        }
        error!(command = %text, error = %err, "文档不一致，执行全量重建");
        ctx.full_reparse();
        self.clear();
        ctx.consistency_warning(format!("{}“{text}”失败，历史已清空：{err}", direction.as_str()));
        Outcome::Recovered(err)
    }

    fn enforce_limit(&mut self) {
        if self.undo_limit == 0 || self.commands.len() <= self.undo_limit {
            return;
        }
        let excess = self.commands.len() - self.undo_limit;
        self.commands.drain(..excess);
        self.index -= excess;
        self.clean_index = self.clean_index.and_then(|clean| clean.checked_sub(excess));
    }

    /// 标记当前位置为已保存。
    pub fn set_clean(&mut self) {
        self.clean_index = Some(self.index);
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.clean_index == Some(self.index)
    }

    #[inline]
    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    #[inline]
    pub fn can_redo(&self) -> bool {
        self.index < self.commands.len()
    }

    pub fn undo_text(&self) -> Option<String> {
        self.index
            .checked_sub(1)
            .and_then(|index| self.commands.get(index))
            .map(UndoCommand::text)
    }

    pub fn redo_text(&self) -> Option<String> {
        self.commands.get(self.index).map(UndoCommand::text)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.index = 0;
        self.clean_index = None;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn undo_limit(&self) -> usize {
        self.undo_limit
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use vpat_core::document::{DocumentTree, EntityId, EntityKind, NodeData, NodeTag};

    use super::*;
    use crate::commands::{AddEntity, AddGroup, DeleteEntity, RenameEntity, SetAttribute};
    use crate::context::DEFAULT_BLOCK_NAME;
    use crate::store::Measurements;

    fn add_point(ctx: &mut PatternContext, stack: &mut CommandStack, x: &str) -> EntityId {
        let add = AddEntity::new(ctx, EntityKind::Point, [("x", x), ("y", "0")]);
        let id = add.id();
        assert_eq!(stack.push(ctx, add.into()).unwrap(), Outcome::Applied);
        id
    }

    #[test]
    fn push_undo_redo_move_the_index() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(0);
        assert!(stack.is_clean());
        let a = add_point(&mut ctx, &mut stack, "1");
        let _b = add_point(&mut ctx, &mut stack, "2");
        assert_eq!(stack.index(), 2);
        assert!(!stack.is_clean());

        assert_eq!(stack.undo(&mut ctx).unwrap(), Outcome::Applied);
        assert_eq!(stack.redo_text().as_deref(), Some("添加点"));
        assert!(stack.can_redo());

        let rename = RenameEntity::new(&ctx, a, "A");
        stack.push(&mut ctx, rename.into()).unwrap();
        assert!(!stack.can_redo());
        assert_eq!(stack.len(), 2);

        stack.undo(&mut ctx).unwrap();
        stack.undo(&mut ctx).unwrap();
        assert_eq!(stack.undo(&mut ctx).unwrap(), Outcome::Ignored);
        assert!(ctx.store().is_empty());
        assert!(stack.is_clean());
    }

    #[test]
    fn precondition_failure_aborts_without_touching_history() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(0);
        let a = add_point(&mut ctx, &mut stack, "1");
        let formula = format!("@{a}.x");
        add_point(&mut ctx, &mut stack, &formula);

        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&messages);
        ctx.events_mut().subscribe(move |event| {
            if let DocumentEvent::Status(message) = event {
                sink.borrow_mut().push(message.clone());
            }
        });

        let before = ctx.snapshot();
        let delete = DeleteEntity::new(&ctx, a);
        let outcome = stack.push(&mut ctx, delete.into()).unwrap();
        assert!(matches!(outcome, Outcome::Aborted(EngineError::EntityInUse { .. })));
        assert_eq!(stack.len(), 2);
        assert_eq!(ctx.snapshot(), before);
        assert_eq!(messages.borrow().len(), 1);
    }

    #[test]
    fn read_only_document_aborts() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(0);
        let a = add_point(&mut ctx, &mut stack, "1");
        ctx.set_read_only(true);
        let edit = SetAttribute::new(&ctx, a, "x", "2");
        assert_eq!(
            stack.push(&mut ctx, edit.into()).unwrap(),
            Outcome::Aborted(EngineError::ReadOnlyViolation)
        );
        assert_eq!(
            stack.undo(&mut ctx).unwrap(),
            Outcome::Aborted(EngineError::ReadOnlyViolation)
        );
        assert_eq!(stack.index(), 1);
    }

    #[test]
    fn undo_limit_drops_oldest_commands() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(2);
        for x in ["1", "2", "3"] {
            add_point(&mut ctx, &mut stack, x);
        }
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.index(), 2);
        stack.undo(&mut ctx).unwrap();
        stack.undo(&mut ctx).unwrap();
        assert!(!stack.can_undo());
        assert_eq!(ctx.store().len(), 1);
        assert!(!stack.is_clean());
    }

    #[test]
    fn reentrant_command_is_rejected() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(0);
        stack.executing = true;
        let add = AddEntity::new(&mut ctx, EntityKind::Point, [("x", "0"), ("y", "0")]);
        assert_eq!(
            stack.push(&mut ctx, add.into()),
            Err(EngineError::ReentrantCommand)
        );
        assert!(ctx.store().is_empty());
    }

    #[test]
    fn inconsistent_failure_recovers_and_clears_history() {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut stack = CommandStack::new(0);
        let a = add_point(&mut ctx, &mut stack, "1");
        let duplicate = AddEntity::with_data(&mut ctx, NodeData::new(NodeTag::Point).with_id(a));
        let outcome = stack.push(&mut ctx, duplicate.into()).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Recovered(EngineError::InconsistentDocument(_))
        ));
        assert!(stack.is_empty());
        assert!(ctx.store().contains(a));
    }

    #[test]
    fn exhausted_id_space_aborts_new_entities() {
        let last_but_one = NodeData::new(NodeTag::Point)
            .with_id(EntityId::new(u64::MAX - 1))
            .with_attr("x", "0")
            .with_attr("y", "0");
        let data = NodeData::new(NodeTag::Pattern).with_child(
            NodeData::new(NodeTag::Block)
                .with_child(NodeData::new(NodeTag::Calculation).with_child(last_but_one)),
        );
        let mut ctx = PatternContext::load(DocumentTree::from_data(data), Measurements::new()).unwrap();
        let mut stack = CommandStack::new(0);
        assert_eq!(add_point(&mut ctx, &mut stack, "1"), EntityId::new(u64::MAX));

        let before = ctx.snapshot();
        let add = AddEntity::new(&mut ctx, EntityKind::Point, [("x", "2"), ("y", "0")]);
        assert!(add.id().is_null());
        assert_eq!(
            stack.push(&mut ctx, add.into()).unwrap(),
            Outcome::Aborted(EngineError::IdSpaceExhausted)
        );
        let group = AddGroup::new(&mut ctx, "G", Vec::new(), Vec::new());
        assert_eq!(
            stack.push(&mut ctx, group.into()).unwrap(),
            Outcome::Aborted(EngineError::IdSpaceExhausted)
        );
        assert_eq!(ctx.snapshot(), before);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn undo_brings_view_back_to_the_block_of_the_edited_entity() {
        let block = |name: &str, id: u64| {
            NodeData::new(NodeTag::Block).with_attr("name", name).with_child(
                NodeData::new(NodeTag::Calculation).with_child(
                    NodeData::new(NodeTag::Point)
                        .with_id(EntityId::new(id))
                        .with_attr("x", "0")
                        .with_attr("y", "0"),
                ),
            )
        };
        let data = NodeData::new(NodeTag::Pattern)
            .with_child(block("Front", 1))
            .with_child(block("Back", 2));
        let mut ctx = PatternContext::load(DocumentTree::from_data(data), Measurements::new()).unwrap();
        let mut stack = CommandStack::new(0);
        assert_eq!(ctx.blocks().active(), 0);

        let edit = SetAttribute::new(&ctx, EntityId::new(2), "x", "5");
        assert_eq!(stack.push(&mut ctx, edit.into()).unwrap(), Outcome::Applied);
        assert_eq!(stack.undo(&mut ctx).unwrap(), Outcome::Applied);
        assert_eq!(ctx.blocks().active_name(), Some("Back"));

        ctx.activate_block(0).unwrap();
        assert_eq!(stack.redo(&mut ctx).unwrap(), Outcome::Applied);
        assert_eq!(ctx.blocks().active(), 1);
    }
}
