//! 分组注册表。分组通过 id 引用成员，改名不影响成员关系。
//!
//! 每次分组子树变化后整体从文档树重建，不做增量修补。

use std::collections::{BTreeMap, BTreeSet};

use vpat_core::document::{DocumentTree, EntityId, NodeKey, NodeTag, attr};

/// 分组成员：实体 id 加可选的别名覆盖。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub id: EntityId,
    pub alias: Option<String>,
}

impl SourceItem {
    pub fn new(id: EntityId) -> Self {
        Self { id, alias: None }
    }

    pub fn with_alias(id: EntityId, alias: impl Into<String>) -> Self {
        Self {
            id,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: EntityId,
    pub name: String,
    pub tags: Vec<String>,
    pub items: Vec<SourceItem>,
    pub visible: bool,
}

impl Group {
    pub fn contains(&self, id: EntityId) -> bool {
        self.items.iter().any(|item| item.id == id)
    }
}

/// 对外暴露的分组摘要。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub id: EntityId,
    pub name: String,
    pub tags: Vec<String>,
    pub visible: bool,
    pub member_count: usize,
}

/// 解析逗号分隔的标签，去除空白与空项。
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

pub fn parse_visible(raw: Option<&str>) -> bool {
    !matches!(raw.map(str::trim), Some("false") | Some("0"))
}

#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
    groups: Vec<Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重新解析 `groups` 容器。
    pub fn rebuild(&mut self, tree: &DocumentTree) {
        self.groups.clear();
        let Some(container) = tree.child_by_tag(tree.root(), NodeTag::Groups) else {
            return;
        };
        for key in tree.children(container) {
            if let Some(group) = Self::parse_group(tree, *key) {
                self.groups.push(group);
            }
        }
    }

    fn parse_group(tree: &DocumentTree, key: NodeKey) -> Option<Group> {
        if tree.tag(key) != Some(NodeTag::Group) {
            return None;
        }
        let id = tree.id_of(key)?;
        let items = tree
            .children(key)
            .iter()
            .filter(|child| tree.tag(**child) == Some(NodeTag::Item))
            .filter_map(|child| {
                let id = tree.attribute(*child, attr::OBJECT).and_then(EntityId::parse)?;
                Some(SourceItem {
                    id,
                    alias: tree.attribute(*child, attr::ALIAS).map(str::to_string),
                })
            })
            .collect();
        Some(Group {
            id,
            name: tree.attribute(key, attr::NAME).unwrap_or_default().to_string(),
            tags: tree.attribute(key, attr::TAGS).map(parse_tags).unwrap_or_default(),
            items,
            visible: parse_visible(tree.attribute(key, attr::VISIBLE)),
        })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn get(&self, id: EntityId) -> Option<&Group> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.name == name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// 包含指定实体的全部分组。
    pub fn groups_containing(&self, id: EntityId) -> Vec<EntityId> {
        self.groups
            .iter()
            .filter(|group| group.contains(id))
            .map(|group| group.id)
            .collect()
    }

    /// 实体只要属于任一隐藏分组即视为隐藏。
    pub fn is_hidden(&self, id: EntityId) -> bool {
        self.groups
            .iter()
            .any(|group| !group.visible && group.contains(id))
    }

    /// 带有任一给定标签的分组。
    pub fn with_tags(&self, tags: &[&str]) -> Vec<EntityId> {
        self.groups
            .iter()
            .filter(|group| group.tags.iter().any(|tag| tags.contains(&tag.as_str())))
            .map(|group| group.id)
            .collect()
    }

    pub fn all_tags(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .flat_map(|group| group.tags.iter().cloned())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|group| GroupSummary {
                id: group.id,
                name: group.name.clone(),
                tags: group.tags.clone(),
                visible: group.visible,
                member_count: group.items.len(),
            })
            .collect()
    }

    pub fn visibility(&self) -> BTreeMap<EntityId, bool> {
        self.groups
            .iter()
            .map(|group| (group.id, group.visible))
            .collect()
    }
}
