//! 交互式构造状态机：收集源对象与锚点，预览后经配置步骤提交为一条命令。
//!
//! 状态：`Idle → Gathering → AnchorPick → Preview → Committed | Cancelled`。
//! 提交或取消后回到 `Idle`，不保留任何残余状态。

use std::collections::BTreeMap;

use tracing::{debug, info};
use vpat_core::document::EntityId;
use vpat_core::geometry::{Axis, Point2};

use crate::commands::{GroupRequest, OperationRequest, build_operation};
use crate::context::PatternContext;
use crate::errors::EngineError;
use crate::groups::SourceItem;
use crate::scene::{Preview, PreviewHandle};
use crate::stack::{CommandStack, Outcome};
use crate::tools::{OperationParams, ToolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPhase {
    Idle,
    Gathering,
    AnchorPick,
    Preview,
    Committed,
    Cancelled,
}

/// 画布输入。`Toggle` 为加选/减选，`Confirm` 为独立的“确认选择”动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionInput {
    Toggle(EntityId),
    Confirm,
    Pick { id: EntityId, modifier: bool },
    Hover(Option<EntityId>),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// 拾取的锚点已在源列表中。
    AnchorIsSource,
    /// 试图把当前锚点加回源列表。
    SourceIsAnchor,
    /// 同一对象被重复拾取为锚点。
    AnchorRepeated,
    /// 配置步骤被接受，但参数尚不可提交。
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptySelection,
    Ineligible,
    Unknown,
    InputNotExpected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionEffect {
    SourceAdded(EntityId),
    SourceRemoved(EntityId),
    AwaitingAnchor,
    AnchorAccepted(EntityId),
    AnchorRepicked(EntityId),
    AnchorSkipped,
    Hovered(Option<EntityId>),
    Rejected(Rejection),
    Ignored(IgnoreReason),
    Cancelled,
    Committed(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SelectionPhase,
    pub to: SelectionPhase,
    pub effect: SelectionEffect,
}

impl Transition {
    #[inline]
    pub fn advanced(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogResult {
    Accepted,
    Rejected,
}

/// 模态配置步骤的宿主。`exec` 阻塞直到用户接受或拒绝，期间不处理其它画布输入。
pub trait DialogHost {
    fn exec(&mut self, step: &mut ConfigurationStep<'_>) -> DialogResult;
}

#[derive(Debug)]
pub struct SelectionStateMachine {
    tool: ToolKind,
    phase: SelectionPhase,
    sources: Vec<SourceItem>,
    anchors: Vec<EntityId>,
    /// 本轮拾取中、尚未凑齐的锚点。
    picking: Vec<EntityId>,
    repicking: bool,
    operation_id: Option<EntityId>,
    parameters: BTreeMap<String, String>,
    group: Option<GroupRequest>,
    preview: Option<PreviewHandle>,
}

impl SelectionStateMachine {
    pub fn new(tool: ToolKind) -> Self {
        Self {
            tool,
            phase: SelectionPhase::Idle,
            sources: Vec::new(),
            anchors: Vec::new(),
            picking: Vec::new(),
            repicking: false,
            operation_id: None,
            parameters: BTreeMap::new(),
            group: None,
            preview: None,
        }
    }

    #[inline]
    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    #[inline]
    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    pub fn sources(&self) -> &[SourceItem] {
        &self.sources
    }

    #[inline]
    pub fn anchor(&self) -> Option<EntityId> {
        self.anchors.first().copied()
    }

    pub fn anchors(&self) -> &[EntityId] {
        &self.anchors
    }

    #[inline]
    pub fn preview_handle(&self) -> Option<PreviewHandle> {
        self.preview
    }

    #[inline]
    pub fn operation_id(&self) -> Option<EntityId> {
        self.operation_id
    }

    fn transition(&mut self, to: SelectionPhase, effect: SelectionEffect) -> Transition {
        let from = self.phase;
        self.phase = to;
        debug!(tool = self.tool.as_str(), ?from, ?to, ?effect, "选择状态迁移");
        Transition { from, to, effect }
    }

    fn stay(&self, effect: SelectionEffect) -> Transition {
        Transition {
            from: self.phase,
            to: self.phase,
            effect,
        }
    }

    /// 处理一次画布输入。
    pub fn handle(&mut self, ctx: &mut PatternContext, input: SelectionInput) -> Transition {
        match input {
            SelectionInput::Hover(id) => {
                ctx.scene.set_hover(id);
                self.stay(SelectionEffect::Hovered(ctx.scene.hovered()))
            }
            SelectionInput::Cancel => self.cancel(ctx),
            SelectionInput::Toggle(id) => self.toggle(ctx, id),
            SelectionInput::Confirm => self.confirm(ctx),
            SelectionInput::Pick { id, modifier } => self.pick(ctx, id, modifier),
        }
    }

    /// 取消：丢弃预览、清空选择并回到 `Idle`，撤销栈不受影响。
    pub fn cancel(&mut self, ctx: &mut PatternContext) -> Transition {
        if self.phase == SelectionPhase::Idle {
            return self.stay(SelectionEffect::Ignored(IgnoreReason::InputNotExpected));
        }
        let transition = self.transition(SelectionPhase::Cancelled, SelectionEffect::Cancelled);
        self.reset(ctx);
        transition
    }

    fn toggle(&mut self, ctx: &mut PatternContext, id: EntityId) -> Transition {
        if !matches!(
            self.phase,
            SelectionPhase::Idle | SelectionPhase::Gathering | SelectionPhase::Preview
        ) {
            return self.stay(SelectionEffect::Ignored(IgnoreReason::InputNotExpected));
        }
        let Some(kind) = ctx.store.get(id).map(|object| object.kind) else {
            return self.stay(SelectionEffect::Ignored(IgnoreReason::Unknown));
        };
        if !self.tool.accepts_source(kind) {
            return self.stay(SelectionEffect::Ignored(IgnoreReason::Ineligible));
        }
        if self.phase == SelectionPhase::Preview && self.anchors.contains(&id) {
            ctx.status("锚点对象不能同时作为源对象");
            return self.stay(SelectionEffect::Rejected(Rejection::SourceIsAnchor));
        }

        let effect = match self.sources.iter().position(|item| item.id == id) {
            Some(index) => {
                self.sources.remove(index);
                ctx.scene.deselect(id);
                SelectionEffect::SourceRemoved(id)
            }
            None => {
                if ctx.scene.select(id).is_err() {
                    return self.stay(SelectionEffect::Ignored(IgnoreReason::Unknown));
                }
                self.sources.push(SourceItem::new(id));
                SelectionEffect::SourceAdded(id)
            }
        };
        if self.phase == SelectionPhase::Preview {
            self.refresh_preview(ctx);
            return self.stay(effect);
        }
        self.transition(SelectionPhase::Gathering, effect)
    }

    fn confirm(&mut self, ctx: &mut PatternContext) -> Transition {
        match self.phase {
            SelectionPhase::Idle => self.stay(SelectionEffect::Ignored(IgnoreReason::EmptySelection)),
            SelectionPhase::Gathering if self.sources.is_empty() => {
                self.stay(SelectionEffect::Ignored(IgnoreReason::EmptySelection))
            }
            SelectionPhase::Gathering => {
                self.transition(SelectionPhase::AnchorPick, SelectionEffect::AwaitingAnchor)
            }
            SelectionPhase::AnchorPick if self.tool.anchor_optional() => {
                self.picking.clear();
                if !self.repicking {
                    self.anchors.clear();
                }
                self.enter_preview(ctx, SelectionEffect::AnchorSkipped)
            }
            _ => self.stay(SelectionEffect::Ignored(IgnoreReason::InputNotExpected)),
        }
    }

    fn pick(&mut self, ctx: &mut PatternContext, id: EntityId, modifier: bool) -> Transition {
        match self.phase {
            SelectionPhase::AnchorPick => {
                let Some(kind) = ctx.store.get(id).map(|object| object.kind) else {
                    return self.stay(SelectionEffect::Ignored(IgnoreReason::Unknown));
                };
                if self.sources.iter().any(|item| item.id == id) {
                    ctx.status("源对象不能作为锚点");
                    return self.stay(SelectionEffect::Rejected(Rejection::AnchorIsSource));
                }
                if !self.tool.accepts_anchor(kind) {
                    return self.stay(SelectionEffect::Ignored(IgnoreReason::Ineligible));
                }
                if self.picking.contains(&id) {
                    ctx.status("同一对象不能重复作为锚点");
                    return self.stay(SelectionEffect::Rejected(Rejection::AnchorRepeated));
                }
                self.picking.push(id);
                if self.picking.len() < self.tool.anchor_count() {
                    return self.stay(SelectionEffect::AnchorAccepted(id));
                }
                self.anchors = std::mem::take(&mut self.picking);
                let effect = if self.repicking {
                    SelectionEffect::AnchorRepicked(id)
                } else {
                    SelectionEffect::AnchorAccepted(id)
                };
                self.enter_preview(ctx, effect)
            }
            SelectionPhase::Preview if modifier && self.tool.allows_anchor_repick() => {
                self.repicking = true;
                self.picking.clear();
                self.transition(SelectionPhase::AnchorPick, SelectionEffect::AwaitingAnchor)
            }
            _ => self.stay(SelectionEffect::Ignored(IgnoreReason::InputNotExpected)),
        }
    }

    fn enter_preview(&mut self, ctx: &mut PatternContext, effect: SelectionEffect) -> Transition {
        self.repicking = false;
        if self.operation_id.is_none() {
            self.operation_id = Some(ctx.allocate_id());
        }
        self.refresh_preview(ctx);
        self.transition(SelectionPhase::Preview, effect)
    }

    fn request(&self) -> OperationRequest {
        OperationRequest {
            tool: self.tool,
            operation_id: self.operation_id,
            sources: self.sources.clone(),
            anchors: self.anchors.clone(),
            parameters: self.parameters.clone(),
            group: self.group.clone(),
        }
    }

    fn preview_positions(&self, ctx: &PatternContext) -> Vec<Point2> {
        let Some(owner) = self.operation_id else {
            return Vec::new();
        };
        let request = self.request();
        let values: BTreeMap<String, f64> = self
            .tool
            .formula_parameters()
            .iter()
            .filter_map(|name| {
                let raw = request.parameter(name)?;
                let value = ctx.evaluate_formula(owner, name, raw).ok()?;
                Some((name.to_string(), value))
            })
            .collect();
        let axis = request.parameter("axis").and_then(Axis::parse);
        let params = OperationParams::from_values(&values, axis);
        let anchors: Vec<Point2> = self
            .anchors
            .iter()
            .filter_map(|id| ctx.store.get(*id).and_then(|object| object.position))
            .collect();
        self.sources
            .iter()
            .filter_map(|item| ctx.store.get(item.id).and_then(|object| object.position))
            .map(|position| self.tool.apply(position, &anchors, &params))
            .collect()
    }

    fn refresh_preview(&mut self, ctx: &mut PatternContext) {
        let preview = Preview {
            tool: self.tool,
            sources: self.sources.iter().map(|item| item.id).collect(),
            anchors: self.anchors.clone(),
            positions: self.preview_positions(ctx),
        };
        match self.preview {
            Some(handle) if ctx.scene.update_preview(handle, preview.clone()) => {}
            _ => self.preview = Some(ctx.scene.attach_preview(preview)),
        }
    }

    /// 配置步骤的提交前置条件。
    fn readiness(&self, ctx: &PatternContext) -> Result<(), EngineError> {
        if self.sources.is_empty() {
            return Err(EngineError::EmptySelection);
        }
        if let Some(missing) = self
            .sources
            .iter()
            .map(|item| item.id)
            .chain(self.anchors.iter().copied())
            .find(|id| !ctx.store.contains(*id))
        {
            return Err(EngineError::StaleReference(missing));
        }
        if self.group.as_ref().is_some_and(|group| group.name.trim().is_empty()) {
            return Err(EngineError::EmptyName);
        }
        let Some(owner) = self.operation_id else {
            return Err(EngineError::InconsistentDocument(
                "preview has no operation id".to_string(),
            ));
        };
        let request = self.request();
        for name in self.tool.formula_parameters() {
            if let Some(raw) = request.parameter(name) {
                ctx.evaluate_formula(owner, name, raw)?;
            }
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut PatternContext) {
        if let Some(handle) = self.preview.take() {
            ctx.scene.detach_preview(handle);
        }
        ctx.scene.clear_selection();
        self.sources.clear();
        self.anchors.clear();
        self.picking.clear();
        self.repicking = false;
        self.operation_id = None;
        self.parameters.clear();
        self.group = None;
        self.phase = SelectionPhase::Idle;
    }

    /// 打开模态配置步骤。仅在 `Preview` 阶段有效；接受且就绪时构建并入栈命令。
    pub fn open_configuration(
        &mut self,
        ctx: &mut PatternContext,
        stack: &mut CommandStack,
        host: &mut dyn DialogHost,
    ) -> Result<Transition, EngineError> {
        if self.phase != SelectionPhase::Preview {
            return Ok(self.stay(SelectionEffect::Ignored(IgnoreReason::InputNotExpected)));
        }
        let result = {
            let mut step = ConfigurationStep {
                machine: &mut *self,
                ctx: &mut *ctx,
            };
            host.exec(&mut step)
        };
        if result == DialogResult::Rejected {
            return Ok(self.cancel(ctx));
        }
        if let Err(err) = self.readiness(ctx) {
            ctx.status(format!("参数尚不可提交：{err}"));
            return Ok(self.stay(SelectionEffect::Rejected(Rejection::NotReady)));
        }

        let command = build_operation(ctx, &self.request());
        let outcome = stack.push(ctx, command)?;
        info!(tool = self.tool.as_str(), sources = self.sources.len(), ?outcome, "操作已提交");
        let transition =
            self.transition(SelectionPhase::Committed, SelectionEffect::Committed(outcome));
        self.reset(ctx);
        Ok(transition)
    }
}

/// 打开中的配置步骤。参数修改会立即刷新预览。
pub struct ConfigurationStep<'a> {
    machine: &'a mut SelectionStateMachine,
    ctx: &'a mut PatternContext,
}

impl ConfigurationStep<'_> {
    #[inline]
    pub fn tool(&self) -> ToolKind {
        self.machine.tool
    }

    pub fn sources(&self) -> &[SourceItem] {
        &self.machine.sources
    }

    pub fn anchors(&self) -> &[EntityId] {
        &self.machine.anchors
    }

    /// 当前参数值，未设置时为工具默认值。
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.machine.request().parameter(name).map(str::to_string)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.machine.parameters.insert(name.into(), value.into());
        self.machine.refresh_preview(&mut *self.ctx);
    }

    /// 设置结果对象的别名，目标不是源对象时返回 `false`。
    pub fn set_alias(&mut self, id: EntityId, alias: Option<String>) -> bool {
        match self.machine.sources.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.alias = alias;
                true
            }
            None => false,
        }
    }

    pub fn set_group(&mut self, group: Option<GroupRequest>) {
        self.machine.group = group;
    }

    pub fn readiness(&self) -> Result<(), EngineError> {
        self.machine.readiness(&*self.ctx)
    }

    pub fn preview(&self) -> Option<&Preview> {
        self.machine
            .preview
            .and_then(|handle| self.ctx.scene.preview(handle))
    }
}

#[cfg(test)]
mod tests {
    use vpat_core::document::{EntityKind, NodeTag};

    use super::*;
    use crate::commands::{AddEntity, UndoCommand};
    use crate::context::DEFAULT_BLOCK_NAME;

    struct Scripted {
        parameters: Vec<(&'static str, &'static str)>,
        result: DialogResult,
        previews: Vec<Vec<Point2>>,
    }

    impl Scripted {
        fn accept(parameters: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                parameters,
                result: DialogResult::Accepted,
                previews: Vec::new(),
            }
        }
    }

    impl DialogHost for Scripted {
        fn exec(&mut self, step: &mut ConfigurationStep<'_>) -> DialogResult {
            for (name, value) in &self.parameters {
                step.set_parameter(*name, *value);
                if let Some(preview) = step.preview() {
                    self.previews.push(preview.positions.clone());
                }
            }
            self.result
        }
    }

    fn setup() -> (PatternContext, Vec<EntityId>) {
        let mut ctx = PatternContext::new(DEFAULT_BLOCK_NAME);
        let mut ids = Vec::new();
        for (x, y) in [("10", "0"), ("0", "10"), ("0", "0")] {
            let mut add = AddEntity::new(&mut ctx, EntityKind::Point, [("x", x), ("y", y)]);
            add.redo(&mut ctx).unwrap();
            ids.push(add.id());
        }
        (ctx, ids)
    }

    fn gather(ctx: &mut PatternContext, machine: &mut SelectionStateMachine, ids: &[EntityId]) {
        for id in ids {
            machine.handle(ctx, SelectionInput::Toggle(*id));
        }
        machine.handle(ctx, SelectionInput::Confirm);
    }

    #[test]
    fn anchor_cannot_be_a_source_item() {
        let (mut ctx, ids) = setup();
        let (p1, p2, p3) = (ids[0], ids[1], ids[2]);
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        gather(&mut ctx, &mut machine, &[p1, p2]);
        assert_eq!(machine.phase(), SelectionPhase::AnchorPick);

        let rejected = machine.handle(&mut ctx, SelectionInput::Pick { id: p1, modifier: false });
        assert_eq!(rejected.effect, SelectionEffect::Rejected(Rejection::AnchorIsSource));
        assert!(!rejected.advanced());

        let accepted = machine.handle(&mut ctx, SelectionInput::Pick { id: p3, modifier: false });
        assert_eq!(accepted.to, SelectionPhase::Preview);
        assert_eq!(machine.anchor(), Some(p3));
        assert_eq!(ctx.scene().preview_count(), 1);

        let back = machine.handle(&mut ctx, SelectionInput::Toggle(p3));
        assert_eq!(back.effect, SelectionEffect::Rejected(Rejection::SourceIsAnchor));
        assert_eq!(machine.sources().len(), 2);
    }

    #[test]
    fn confirm_with_empty_selection_is_ignored() {
        let (mut ctx, ids) = setup();
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        machine.handle(&mut ctx, SelectionInput::Toggle(ids[0]));
        machine.handle(&mut ctx, SelectionInput::Toggle(ids[0]));
        assert_eq!(machine.phase(), SelectionPhase::Gathering);
        let confirm = machine.handle(&mut ctx, SelectionInput::Confirm);
        assert_eq!(
            confirm.effect,
            SelectionEffect::Ignored(IgnoreReason::EmptySelection)
        );
        assert_eq!(machine.phase(), SelectionPhase::Gathering);
    }

    #[test]
    fn accepted_configuration_pushes_one_command() {
        let (mut ctx, ids) = setup();
        let mut stack = CommandStack::new(0);
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        gather(&mut ctx, &mut machine, &[ids[0]]);
        machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });

        let mut host = Scripted::accept(vec![("angle", "90")]);
        let transition = machine
            .open_configuration(&mut ctx, &mut stack, &mut host)
            .unwrap();
        assert_eq!(transition.to, SelectionPhase::Committed);
        assert_eq!(transition.effect, SelectionEffect::Committed(Outcome::Applied));
        assert_eq!(machine.phase(), SelectionPhase::Idle);
        assert_eq!(stack.len(), 1);
        assert_eq!(ctx.scene().preview_count(), 0);
        assert_eq!(ctx.scene().selection_len(), 0);

        let live = host.previews.last().unwrap()[0];
        assert!(live.distance(Point2::new(0.0, 10.0)) < 1e-9);
    }

    #[test]
    fn unready_configuration_stays_in_preview() {
        let (mut ctx, ids) = setup();
        let mut stack = CommandStack::new(0);
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        gather(&mut ctx, &mut machine, &[ids[0]]);
        machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });

        let mut host = Scripted::accept(vec![("angle", "@999.x")]);
        let transition = machine
            .open_configuration(&mut ctx, &mut stack, &mut host)
            .unwrap();
        assert_eq!(transition.effect, SelectionEffect::Rejected(Rejection::NotReady));
        assert_eq!(machine.phase(), SelectionPhase::Preview);
        assert!(stack.is_empty());
    }

    #[test]
    fn rejected_configuration_cancels_without_history() {
        let (mut ctx, ids) = setup();
        let mut stack = CommandStack::new(0);
        let before = ctx.snapshot();
        let mut machine = SelectionStateMachine::new(ToolKind::FlipByAxis);
        gather(&mut ctx, &mut machine, &[ids[0], ids[1]]);
        machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });

        let mut host = Scripted {
            parameters: vec![("axis", "horizontal")],
            result: DialogResult::Rejected,
            previews: Vec::new(),
        };
        let transition = machine
            .open_configuration(&mut ctx, &mut stack, &mut host)
            .unwrap();
        assert_eq!(transition.to, SelectionPhase::Cancelled);
        assert_eq!(machine.phase(), SelectionPhase::Idle);
        assert!(stack.is_empty());
        assert_eq!(ctx.scene().preview_count(), 0);
        assert_eq!(ctx.snapshot(), before);
    }

    #[test]
    fn move_allows_skipping_and_repicking_the_anchor() {
        let (mut ctx, ids) = setup();
        let mut machine = SelectionStateMachine::new(ToolKind::Move);
        gather(&mut ctx, &mut machine, &[ids[0], ids[1]]);
        let skipped = machine.handle(&mut ctx, SelectionInput::Confirm);
        assert_eq!(skipped.effect, SelectionEffect::AnchorSkipped);
        assert_eq!(machine.phase(), SelectionPhase::Preview);
        let operation = machine.operation_id();

        let repick = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: true });
        assert_eq!(repick.to, SelectionPhase::AnchorPick);
        let picked = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });
        assert_eq!(picked.effect, SelectionEffect::AnchorRepicked(ids[2]));
        assert_eq!(machine.sources().len(), 2);
        assert_eq!(machine.operation_id(), operation);

        let cancel = machine.handle(&mut ctx, SelectionInput::Cancel);
        assert_eq!(cancel.effect, SelectionEffect::Cancelled);
        assert_eq!(machine.phase(), SelectionPhase::Idle);
        assert!(machine.sources().is_empty());
    }

    #[test]
    fn flip_by_line_waits_for_two_distinct_anchors() {
        let (mut ctx, ids) = setup();
        let mut stack = CommandStack::new(0);
        let mut machine = SelectionStateMachine::new(ToolKind::FlipByLine);
        gather(&mut ctx, &mut machine, &[ids[0]]);

        let first = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });
        assert_eq!(first.effect, SelectionEffect::AnchorAccepted(ids[2]));
        assert_eq!(machine.phase(), SelectionPhase::AnchorPick);
        assert_eq!(ctx.scene().preview_count(), 0);

        let repeated = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });
        assert_eq!(repeated.effect, SelectionEffect::Rejected(Rejection::AnchorRepeated));

        let second = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[1], modifier: false });
        assert_eq!(second.to, SelectionPhase::Preview);
        assert_eq!(machine.anchors(), &[ids[2], ids[1]]);
        let back = machine.handle(&mut ctx, SelectionInput::Toggle(ids[1]));
        assert_eq!(back.effect, SelectionEffect::Rejected(Rejection::SourceIsAnchor));

        let mut host = Scripted::accept(Vec::new());
        let transition = machine
            .open_configuration(&mut ctx, &mut stack, &mut host)
            .unwrap();
        assert_eq!(transition.effect, SelectionEffect::Committed(Outcome::Applied));
        let result = ctx
            .store()
            .iter()
            .find(|object| object.tag == NodeTag::Destination)
            .unwrap();
        assert!(result.position.unwrap().distance(Point2::new(-10.0, 0.0)) < 1e-9);
    }

    #[test]
    fn toggling_during_preview_refreshes_positions() {
        let (mut ctx, ids) = setup();
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        gather(&mut ctx, &mut machine, &[ids[0]]);
        machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });
        let handle = machine.preview_handle().unwrap();
        assert_eq!(ctx.scene().preview(handle).unwrap().positions.len(), 1);

        let added = machine.handle(&mut ctx, SelectionInput::Toggle(ids[1]));
        assert_eq!(added.effect, SelectionEffect::SourceAdded(ids[1]));
        assert!(!added.advanced());
        let preview = ctx.scene().preview(handle).unwrap();
        assert_eq!(preview.sources, vec![ids[0], ids[1]]);
        assert_eq!(preview.positions.len(), 2);

        let removed = machine.handle(&mut ctx, SelectionInput::Toggle(ids[0]));
        assert_eq!(removed.effect, SelectionEffect::SourceRemoved(ids[0]));
        assert_eq!(machine.phase(), SelectionPhase::Preview);
        assert_eq!(machine.preview_handle(), Some(handle));
        let preview = ctx.scene().preview(handle).unwrap();
        assert_eq!(preview.sources, vec![ids[1]]);
        assert_eq!(preview.positions.len(), 1);
    }

    #[test]
    fn rotation_does_not_allow_repick() {
        let (mut ctx, ids) = setup();
        let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
        gather(&mut ctx, &mut machine, &[ids[0]]);
        machine.handle(&mut ctx, SelectionInput::Pick { id: ids[2], modifier: false });
        let repick = machine.handle(&mut ctx, SelectionInput::Pick { id: ids[1], modifier: true });
        assert_eq!(
            repick.effect,
            SelectionEffect::Ignored(IgnoreReason::InputNotExpected)
        );
        assert_eq!(machine.phase(), SelectionPhase::Preview);
    }
}
