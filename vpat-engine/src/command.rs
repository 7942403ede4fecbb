//! 具名动作总线：把菜单或命令行中的动作名分发到会话。

use std::collections::HashMap;

use crate::errors::EngineError;
use crate::session::Session;
use crate::stack::Outcome;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    fn from_outcome(result: Result<Outcome, EngineError>, done: &str, idle: &str) -> Self {
        match result {
            Ok(Outcome::Applied) => Self::ok(done),
            Ok(Outcome::Ignored) => Self::ok(idle),
            Ok(Outcome::Aborted(err)) => Self::err(format!("操作已中止: {err}")),
            Ok(Outcome::Recovered(err)) => Self::err(format!("文档已重建，历史已清空: {err}")),
            Err(err) => Self::err(err.to_string()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub session: &'a mut Session,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(UndoAction);
        bus.register(RedoAction);
        bus.register(GroupsVisibilityAction {
            name: "hide_all_groups",
            visible: false,
        });
        bus.register(GroupsVisibilityAction {
            name: "show_all_groups",
            visible: true,
        });
        bus.register(FocusSelectionAction);
        bus.register(ClearSelectionAction);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

struct UndoAction;

impl CommandHandler for UndoAction {
    fn name(&self) -> &'static str {
        "undo"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_outcome(context.session.undo(), "已撤销", "没有可撤销的命令")
    }
}

struct RedoAction;

impl CommandHandler for RedoAction {
    fn name(&self) -> &'static str {
        "redo"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_outcome(context.session.redo(), "已重做", "没有可重做的命令")
    }
}

struct GroupsVisibilityAction {
    name: &'static str,
    visible: bool,
}

impl CommandHandler for GroupsVisibilityAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let done = if self.visible {
            "全部分组已显示"
        } else {
            "全部分组已隐藏"
        };
        CommandResponse::from_outcome(
            context.session.set_all_groups_visible(self.visible),
            done,
            "分组可见性无需改变",
        )
    }
}

struct FocusSelectionAction;

impl CommandHandler for FocusSelectionAction {
    fn name(&self) -> &'static str {
        "focus_selection"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.session.context_mut().scene_mut().focus_on_selection();
        CommandResponse::ok("视口已聚焦当前选中实体")
    }
}

struct ClearSelectionAction;

impl CommandHandler for ClearSelectionAction {
    fn name(&self) -> &'static str {
        "clear_selection"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.session.context_mut().scene_mut().clear_selection();
        CommandResponse::ok("选中集已清空")
    }
}
