use std::collections::BTreeMap;

use tracing::debug;
use vpat_core::document::{EntityId, EntityKind, NodeData, NodeTag, attr};

use super::{AddEntity, AddGroup, Command, Macro};
use crate::context::PatternContext;
use crate::groups::SourceItem;
use crate::tools::ToolKind;

/// 把结果对象收进新分组。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    pub name: String,
    pub tags: Vec<String>,
}

/// 选择状态机确认后提交的操作描述。
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub tool: ToolKind,
    /// 进入预览时预先分配的 id，未分配时在构建命令时分配。
    pub operation_id: Option<EntityId>,
    pub sources: Vec<SourceItem>,
    /// 按拾取顺序排列的锚点，依次写入工具的锚点属性。
    pub anchors: Vec<EntityId>,
    pub parameters: BTreeMap<String, String>,
    pub group: Option<GroupRequest>,
}

impl OperationRequest {
    pub fn new(tool: ToolKind) -> Self {
        Self {
            tool,
            operation_id: None,
            sources: Vec::new(),
            anchors: Vec::new(),
            parameters: BTreeMap::new(),
            group: None,
        }
    }

    /// 参数值：显式设置优先，其次工具默认值。
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str).or_else(|| {
            self.tool
                .default_parameters()
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
        })
    }
}

/// 由操作描述构建一条命令：操作节点连同其源与结果子节点；
/// 请求分组时与新建分组组合成一条宏命令。
pub fn build_operation(ctx: &mut PatternContext, request: &OperationRequest) -> Command {
    let tool = request.tool;
    let mut data = NodeData::new(NodeTag::Operation).with_attr(attr::TOOL, tool.as_str());
    if let Some(id) = request.operation_id {
        data = data.with_id(id);
    }
    for (name, anchor) in tool.anchor_keys().iter().zip(&request.anchors) {
        data = data.with_attr(*name, anchor.get().to_string());
    }
    for (name, _) in tool.default_parameters() {
        if let Some(value) = request.parameter(name) {
            data = data.with_attr(*name, value);
        }
    }

    for source in &request.sources {
        let mut node = NodeData::new(NodeTag::Source).with_attr(attr::OBJECT, source.id.get().to_string());
        if let Some(alias) = &source.alias {
            node = node.with_attr(attr::ALIAS, alias.clone());
        }
        data = data.with_child(node);
    }

    let mut destinations = Vec::with_capacity(request.sources.len());
    for source in &request.sources {
        let id = ctx.allocate_id();
        let kind = ctx
            .entity_kind(source.id)
            .map_or("point", EntityKind::as_str);
        let mut node = NodeData::new(NodeTag::Destination)
            .with_id(id)
            .with_attr(attr::KIND, kind)
            .with_attr(attr::OBJECT, source.id.get().to_string());
        if let Some(name) = ctx.store.get(source.id).and_then(|object| object.name.clone()) {
            node = node.with_attr(attr::NAME, format!("{name}{}", tool.suffix()));
        }
        if let Some(alias) = &source.alias {
            node = node.with_attr(attr::ALIAS, alias.clone());
        }
        data = data.with_child(node);
        destinations.push(SourceItem::new(id));
    }

    let add = AddEntity::with_data(ctx, data);
    debug!(
        tool = tool.as_str(),
        operation = add.id().get(),
        results = destinations.len(),
        "操作命令已构建"
    );
    match &request.group {
        Some(group) => {
            let group = AddGroup::new(ctx, group.name.clone(), group.tags.clone(), destinations);
            Macro::new(format!("{} 并分组", tool.as_str()), vec![add.into(), group.into()]).into()
        }
        None => add.into(),
    }
}
