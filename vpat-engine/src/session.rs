use std::collections::BTreeMap;

use tracing::info;

use crate::commands::{ChangeMultipleGroupsVisibility, Command};
use crate::context::PatternContext;
use crate::errors::EngineError;
use crate::selection::{DialogHost, SelectionInput, SelectionStateMachine, Transition};
use crate::stack::{CommandStack, Outcome};

/// 一个打开的文档：上下文加其撤销栈。
#[derive(Debug)]
pub struct Session {
    ctx: PatternContext,
    stack: CommandStack,
}

impl Session {
    pub fn new(ctx: PatternContext, undo_limit: usize) -> Self {
        Self {
            ctx,
            stack: CommandStack::new(undo_limit),
        }
    }

    #[inline]
    pub fn context(&self) -> &PatternContext {
        &self.ctx
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut PatternContext {
        &mut self.ctx
    }

    #[inline]
    pub fn stack(&self) -> &CommandStack {
        &self.stack
    }

    pub fn push(&mut self, command: impl Into<Command>) -> Result<Outcome, EngineError> {
        self.stack.push(&mut self.ctx, command.into())
    }

    pub fn undo(&mut self) -> Result<Outcome, EngineError> {
        self.stack.undo(&mut self.ctx)
    }

    pub fn redo(&mut self) -> Result<Outcome, EngineError> {
        self.stack.redo(&mut self.ctx)
    }

    /// 统一设置全部分组可见性，作为一条命令入栈。没有分组需要改变时忽略。
    pub fn set_all_groups_visible(&mut self, visible: bool) -> Result<Outcome, EngineError> {
        let changes: BTreeMap<_, _> = self
            .ctx
            .groups()
            .groups()
            .iter()
            .filter(|group| group.visible != visible)
            .map(|group| (group.id, visible))
            .collect();
        if changes.is_empty() {
            return Ok(Outcome::Ignored);
        }
        info!(groups = changes.len(), visible, "批量修改分组可见性");
        self.push(ChangeMultipleGroupsVisibility::new(changes))
    }

    #[inline]
    pub fn hide_all_groups(&mut self) -> Result<Outcome, EngineError> {
        self.set_all_groups_visible(false)
    }

    #[inline]
    pub fn show_all_groups(&mut self) -> Result<Outcome, EngineError> {
        self.set_all_groups_visible(true)
    }

    pub fn select(&mut self, machine: &mut SelectionStateMachine, input: SelectionInput) -> Transition {
        machine.handle(&mut self.ctx, input)
    }

    pub fn configure(
        &mut self,
        machine: &mut SelectionStateMachine,
        host: &mut dyn DialogHost,
    ) -> Result<Transition, EngineError> {
        machine.open_configuration(&mut self.ctx, &mut self.stack, host)
    }

    /// 文档自上次保存后是否有修改。
    #[inline]
    pub fn is_modified(&self) -> bool {
        !self.stack.is_clean()
    }

    pub fn mark_saved(&mut self) {
        self.stack.set_clean();
    }
}
