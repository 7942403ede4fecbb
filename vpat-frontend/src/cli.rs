use std::env;
use std::path::PathBuf;

use tracing::{info, warn};
use vpat_config::AppConfig;
use vpat_core::document::EntityId;
use vpat_engine::command::{CommandBus, CommandContext, CommandRequest};
use vpat_engine::commands::GroupRequest;
use vpat_engine::events::DocumentEvent;
use vpat_engine::selection::{
    ConfigurationStep, DialogHost, DialogResult, SelectionInput, SelectionStateMachine,
};
use vpat_engine::session::Session;
use vpat_engine::tools::ToolKind;

use crate::errors::FrontendError;
use crate::loader::{DemoEntities, DocumentSource, load_pattern, save_session};

/// 按预设脚本填写配置步骤的对话框宿主。
#[derive(Debug, Clone, Default)]
pub struct ScriptedDialog {
    pub parameters: Vec<(String, String)>,
    pub aliases: Vec<(EntityId, String)>,
    pub group: Option<GroupRequest>,
    pub reject: bool,
}

impl ScriptedDialog {
    pub fn parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.push((name.to_string(), value.to_string()));
        self
    }

    pub fn alias(mut self, id: EntityId, alias: &str) -> Self {
        self.aliases.push((id, alias.to_string()));
        self
    }

    pub fn group(mut self, name: &str, tags: &[&str]) -> Self {
        self.group = Some(GroupRequest {
            name: name.to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        });
        self
    }
}

impl DialogHost for ScriptedDialog {
    fn exec(&mut self, step: &mut ConfigurationStep<'_>) -> DialogResult {
        if self.reject {
            return DialogResult::Rejected;
        }
        for (name, value) in &self.parameters {
            step.set_parameter(name.as_str(), value.as_str());
        }
        for (id, alias) in &self.aliases {
            if !step.set_alias(*id, Some(alias.clone())) {
                warn!(id = id.get(), "别名目标不是源对象，已忽略");
            }
        }
        step.set_group(self.group.clone());
        if let Some(preview) = step.preview() {
            println!("  预览结果点数 = {}", preview.positions.len());
        }
        DialogResult::Accepted
    }
}

/// 简易 CLI 演示：加载纸样（文件或内置示例），驱动一次旋转操作并演示撤销。
pub fn run_demo(config: &AppConfig) -> Result<(), FrontendError> {
    let loaded = load_pattern(config)?;
    let mut session = loaded.session;
    session.context_mut().events_mut().subscribe(|event| match event {
        DocumentEvent::Status(message) => println!("  [状态] {message}"),
        DocumentEvent::ConsistencyWarning(message) => println!("  [警告] {message}"),
        DocumentEvent::ActiveBlockChanged { name, .. } => println!("  [图块] 当前图块：{name}"),
        _ => {}
    });

    println!("Rust 版纸样 CLI 演示");
    match &loaded.source {
        DocumentSource::File(path) => println!("已从文件加载纸样：{}", path.display()),
        DocumentSource::Demo => println!("已构建内置示例纸样"),
    }
    print_overview(&session);

    if let Some(ids) = loaded.demo_entities {
        run_rotation(&mut session, ids)?;
        run_flip_by_line(&mut session, ids)?;
        print_overview(&session);
    }

    let command_bus = CommandBus::new();
    let mut commands: Vec<&str> = command_bus.available_commands().copied().collect();
    commands.sort_unstable();
    println!("支持的命令: {}", commands.join(", "));
    let mut context = CommandContext {
        session: &mut session,
    };
    for name in ["hide_all_groups", "undo", "redo", "undo"] {
        let response = command_bus.dispatch(&CommandRequest::new(name), &mut context);
        let message = response.message.unwrap_or_default();
        if response.success {
            println!("> {name}: {message}");
        } else {
            warn!(command = name, "CLI 命令执行失败: {message}");
        }
    }

    let stack = session.stack();
    println!(
        "撤销栈：{} 条，当前位置 {}，可撤销={}，可重做={}",
        stack.len(),
        stack.index(),
        stack.undo_text().unwrap_or_else(|| "<无>".to_string()),
        stack.redo_text().unwrap_or_else(|| "<无>".to_string())
    );
    println!("文档已修改: {}", if session.is_modified() { "是" } else { "否" });

    if let Some(path) = env::var_os("VPAT_CLI_SAVE") {
        save_session(&mut session, &PathBuf::from(path))?;
    }
    Ok(())
}

fn run_rotation(session: &mut Session, ids: DemoEntities) -> Result<(), FrontendError> {
    let mut machine = SelectionStateMachine::new(ToolKind::Rotation);
    let inputs = [
        SelectionInput::Toggle(ids.shoulder),
        SelectionInput::Toggle(ids.hem),
        SelectionInput::Confirm,
        SelectionInput::Pick {
            id: ids.hem,
            modifier: false,
        },
        SelectionInput::Pick {
            id: ids.origin,
            modifier: false,
        },
    ];
    for input in inputs {
        let transition = session.select(&mut machine, input);
        println!(
            "  {:?} -> {:?}: {:?}",
            transition.from, transition.to, transition.effect
        );
    }

    let mut dialog = ScriptedDialog::default()
        .parameter("angle", "90")
        .alias(ids.hem, "D'")
        .group("旋转结果", &["rotation"]);
    let transition = session.configure(&mut machine, &mut dialog)?;
    info!(effect = ?transition.effect, "旋转操作结束");
    println!(
        "  {:?} -> {:?}: {:?}",
        transition.from, transition.to, transition.effect
    );
    Ok(())
}

fn run_flip_by_line(session: &mut Session, ids: DemoEntities) -> Result<(), FrontendError> {
    let mut machine = SelectionStateMachine::new(ToolKind::FlipByLine);
    let inputs = [
        SelectionInput::Toggle(ids.waist),
        SelectionInput::Confirm,
        SelectionInput::Pick {
            id: ids.origin,
            modifier: false,
        },
        SelectionInput::Pick {
            id: ids.shoulder,
            modifier: false,
        },
    ];
    for input in inputs {
        let transition = session.select(&mut machine, input);
        println!(
            "  {:?} -> {:?}: {:?}",
            transition.from, transition.to, transition.effect
        );
    }

    let mut dialog = ScriptedDialog::default();
    let transition = session.configure(&mut machine, &mut dialog)?;
    info!(effect = ?transition.effect, "镜像操作结束");
    Ok(())
}

fn print_overview(session: &Session) {
    let ctx = session.context();
    for (block, name) in ctx.blocks().names().iter().enumerate() {
        println!("图块 {name} 的对象：");
        for record in ctx.records().in_block(block) {
            let id = record.id;
            let Some(object) = ctx.store().get(id) else {
                continue;
            };
            let position = object
                .position
                .map(|p| format!("({:.2}, {:.2})", p.x(), p.y()))
                .unwrap_or_else(|| "<无>".to_string());
            let visible = if ctx.scene().is_visible(id) { "" } else { " [隐藏]" };
            println!("  - #{} {} {}{}", id.get(), object.label(), position, visible);
        }
    }
    println!("分组：");
    for group in ctx.groups().groups() {
        let members: Vec<String> = group.items.iter().map(|item| item.id.to_string()).collect();
        println!(
            "  - {} [{}] 成员={} 可见={}",
            group.name,
            group.tags.join(","),
            members.join(","),
            if group.visible { "是" } else { "否" }
        );
    }
}
