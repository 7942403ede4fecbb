use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{error, info};
use vpat_config::AppConfig;
use vpat_core::document::{DocumentTree, EntityId, NodeData, NodeTag, attr};
use vpat_engine::context::PatternContext;
use vpat_engine::session::Session;
use vpat_io::{DocumentLoader, DocumentSaver, JsonFacade, PatternFile};

use crate::errors::FrontendError;

/// 文档来源，便于前端呈现加载信息。
#[derive(Debug, Clone)]
pub enum DocumentSource {
    File(PathBuf),
    Demo,
}

/// 内置示例中的关键实体。
#[derive(Debug, Clone, Copy)]
pub struct DemoEntities {
    pub origin: EntityId,
    pub shoulder: EntityId,
    pub waist: EntityId,
    pub hem: EntityId,
    pub group: EntityId,
}

/// 统一封装加载后的会话与元信息。
#[derive(Debug)]
pub struct LoadedPattern {
    pub session: Session,
    pub source: DocumentSource,
    pub demo_entities: Option<DemoEntities>,
}

/// 依次取环境变量 `VPAT_CLI_PATTERN`、配置中的 `editor.pattern`；
/// 都未指定时使用内置示例。指定的文件无法打开时返回错误。
pub fn load_pattern(config: &AppConfig) -> Result<LoadedPattern, FrontendError> {
    let candidate = env::var_os("VPAT_CLI_PATTERN")
        .map(PathBuf::from)
        .or_else(|| config.editor.pattern.clone());
    if let Some(path) = candidate {
        let session = open_file(&path, config).map_err(|source| {
            error!(path = %path.display(), error = %source, "加载纸样失败");
            FrontendError::Open {
                path: path.clone(),
                source: Box::new(source),
            }
        })?;
        info!(path = %path.display(), "从文件加载纸样成功");
        return Ok(LoadedPattern {
            session,
            source: DocumentSource::File(path),
            demo_entities: None,
        });
    }

    let (session, demo_entities) = demo_session(config)?;
    Ok(LoadedPattern {
        session,
        source: DocumentSource::Demo,
        demo_entities: Some(demo_entities),
    })
}

/// 打开纸样文件并建立会话。
pub fn open_file(path: &Path, config: &AppConfig) -> Result<Session, FrontendError> {
    let file = JsonFacade::new().load(path)?;
    let measurements = file.measurements.clone();
    let ctx = PatternContext::load(file.into_tree(), measurements)?;
    Ok(configure(ctx, config))
}

/// 保存会话当前文档，成功后标记为未修改。
pub fn save_session(session: &mut Session, path: &Path) -> Result<(), FrontendError> {
    let ctx = session.context();
    let file = PatternFile::new(ctx.tree(), ctx.measurements().clone());
    JsonFacade::new().save(&file, path)?;
    session.mark_saved();
    info!(path = %path.display(), "纸样已保存");
    Ok(())
}

fn configure(mut ctx: PatternContext, config: &AppConfig) -> Session {
    if config.editor.read_only {
        ctx.set_read_only(true);
    }
    Session::new(ctx, config.history.undo_limit)
}

fn point(id: u64, name: &str, x: &str, y: &str) -> NodeData {
    NodeData::new(NodeTag::Point)
        .with_id(EntityId::new(id))
        .with_attr(attr::NAME, name)
        .with_attr("x", x)
        .with_attr("y", y)
}

fn demo_session(config: &AppConfig) -> Result<(Session, DemoEntities), FrontendError> {
    let ids = DemoEntities {
        origin: EntityId::new(1),
        shoulder: EntityId::new(2),
        waist: EntityId::new(3),
        hem: EntityId::new(4),
        group: EntityId::new(5),
    };
    let calculation = NodeData::new(NodeTag::Calculation)
        .with_child(point(1, "A", "0", "0"))
        .with_child(point(2, "B", "#shoulder / 2", "0"))
        .with_child(point(3, "C", "#waist / 4", "@1.y - 40"))
        .with_child(point(4, "D", "@3.x", "@3.y - 25"));
    let groups = NodeData::new(NodeTag::Groups).with_child(
        NodeData::new(NodeTag::Group)
            .with_id(ids.group)
            .with_attr(attr::NAME, "前片")
            .with_attr(attr::TAGS, "front,body")
            .with_child(NodeData::new(NodeTag::Item).with_attr(attr::OBJECT, "2"))
            .with_child(NodeData::new(NodeTag::Item).with_attr(attr::OBJECT, "3")),
    );
    let data = NodeData::new(NodeTag::Pattern)
        .with_child(
            NodeData::new(NodeTag::Block)
                .with_attr(attr::NAME, config.editor.default_block_name.as_str())
                .with_child(calculation),
        )
        .with_child(groups);
    let measurements = BTreeMap::from([
        ("shoulder".to_string(), 42.0),
        ("waist".to_string(), 76.0),
    ]);

    let ctx = PatternContext::load(DocumentTree::from_data(data), measurements)?;
    Ok((configure(ctx, config), ids))
}
