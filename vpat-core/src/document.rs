use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// 属性名常量，与持久化文件中的键保持一致。
pub mod attr {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const OBJECT: &str = "object";
    pub const ALIAS: &str = "alias";
    pub const VISIBLE: &str = "visible";
    pub const TAGS: &str = "tags";
    pub const IN_LAYOUT: &str = "in-layout";
    pub const KIND: &str = "kind";
    pub const SOURCE: &str = "source";
    pub const TOOL: &str = "tool";
    pub const AXIS: &str = "axis";
    pub const CENTER: &str = "center";
    pub const AXIS_FIRST: &str = "axis-first";
    pub const AXIS_SECOND: &str = "axis-second";
    pub const FORCE_FLIPPING: &str = "force-flipping";
    pub const FORBID_FLIPPING: &str = "forbid-flipping";
    pub const HIDE_MAIN_PATH: &str = "hide-main-path";
    pub const SHOW_FULL_PIECE: &str = "show-full-piece";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// 空 id，不指向任何实体。
    pub const NULL: EntityId = EntityId(0);

    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 提供原始数值，便于序列化或日志输出。
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    /// 解析持久化的 id 文本。`0` 保留为空 id，视为非法。
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(value) => Some(Self(value)),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 实体种类，对象库与依赖图以此区分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Point,
    Line,
    Curve,
    Operation,
    Piece,
    Group,
    BackgroundImage,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Point => "point",
            EntityKind::Line => "line",
            EntityKind::Curve => "curve",
            EntityKind::Operation => "operation",
            EntityKind::Piece => "piece",
            EntityKind::Group => "group",
            EntityKind::BackgroundImage => "background-image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "point" => Some(EntityKind::Point),
            "line" => Some(EntityKind::Line),
            "curve" => Some(EntityKind::Curve),
            "operation" => Some(EntityKind::Operation),
            "piece" => Some(EntityKind::Piece),
            "group" => Some(EntityKind::Group),
            "background-image" => Some(EntityKind::BackgroundImage),
            _ => None,
        }
    }

    /// 直接保存为 id 的引用属性。
    pub fn reference_keys(self) -> &'static [&'static str] {
        match self {
            EntityKind::Point => &["base"],
            EntityKind::Line | EntityKind::Curve => &["first", "second"],
            EntityKind::Operation => &[attr::CENTER, attr::AXIS_FIRST, attr::AXIS_SECOND],
            EntityKind::Piece | EntityKind::Group | EntityKind::BackgroundImage => &[],
        }
    }

    /// 以公式保存、需要求值的属性。
    pub fn formula_keys(self) -> &'static [&'static str] {
        match self {
            EntityKind::Point => &["x", "y"],
            EntityKind::Curve => &["length"],
            EntityKind::Operation => &["angle", "length", "rotation_angle"],
            EntityKind::Piece => &["width"],
            EntityKind::Line | EntityKind::Group | EntityKind::BackgroundImage => &[],
        }
    }

    /// 是否参与计算顺序。裁片与背景图不影响其它实体的求值。
    pub fn carries_order(self) -> bool {
        !matches!(self, EntityKind::Piece | EntityKind::BackgroundImage)
    }

    /// 是否作为依赖图顶点。分组只通过 id 引用成员，不参与重算。
    pub fn is_graph_vertex(self) -> bool {
        !matches!(self, EntityKind::Group)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化树中的节点标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeTag {
    Pattern,
    Block,
    Calculation,
    Details,
    Point,
    Line,
    Curve,
    Operation,
    Source,
    Destination,
    Piece,
    PieceNode,
    Groups,
    Group,
    Item,
    BackgroundImages,
    BackgroundImage,
}

impl NodeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeTag::Pattern => "pattern",
            NodeTag::Block => "block",
            NodeTag::Calculation => "calculation",
            NodeTag::Details => "details",
            NodeTag::Point => "point",
            NodeTag::Line => "line",
            NodeTag::Curve => "curve",
            NodeTag::Operation => "operation",
            NodeTag::Source => "source",
            NodeTag::Destination => "destination",
            NodeTag::Piece => "piece",
            NodeTag::PieceNode => "piece-node",
            NodeTag::Groups => "groups",
            NodeTag::Group => "group",
            NodeTag::Item => "item",
            NodeTag::BackgroundImages => "background-images",
            NodeTag::BackgroundImage => "background-image",
        }
    }

    /// 标签直接对应的实体种类。`destination` 的种类由其 `kind` 属性决定。
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            NodeTag::Point => Some(EntityKind::Point),
            NodeTag::Line => Some(EntityKind::Line),
            NodeTag::Curve => Some(EntityKind::Curve),
            NodeTag::Operation => Some(EntityKind::Operation),
            NodeTag::Piece => Some(EntityKind::Piece),
            NodeTag::Group => Some(EntityKind::Group),
            NodeTag::BackgroundImage => Some(EntityKind::BackgroundImage),
            _ => None,
        }
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Point => NodeTag::Point,
            EntityKind::Line => NodeTag::Line,
            EntityKind::Curve => NodeTag::Curve,
            EntityKind::Operation => NodeTag::Operation,
            EntityKind::Piece => NodeTag::Piece,
            EntityKind::Group => NodeTag::Group,
            EntityKind::BackgroundImage => NodeTag::BackgroundImage,
        }
    }

    /// 子节点顺序是否有意义。背景图列表的顺序不影响任何求值。
    pub fn orders_children(self) -> bool {
        !matches!(self, NodeTag::BackgroundImages)
    }

    /// 实体所属容器的标签。
    pub fn container_for(kind: EntityKind) -> NodeTag {
        match kind {
            EntityKind::Piece => NodeTag::Details,
            EntityKind::Group => NodeTag::Groups,
            EntityKind::BackgroundImage => NodeTag::BackgroundImages,
            _ => NodeTag::Calculation,
        }
    }
}

/// 持久化节点：标签、属性与有序子节点。也用作子树的独立克隆。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub tag: NodeTag,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeData>,
}

impl NodeData {
    pub fn new(tag: NodeTag) -> Self {
        Self {
            tag,
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_id(self, id: EntityId) -> Self {
        self.with_attr(attr::ID, id.get().to_string())
    }

    pub fn with_child(mut self, child: NodeData) -> Self {
        self.children.push(child);
        self
    }

    #[inline]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    #[inline]
    pub fn id(&self) -> Option<EntityId> {
        self.attr(attr::ID).and_then(EntityId::parse)
    }

    /// 子树中所有带 id 的节点（前序）。
    pub fn ids(&self) -> Vec<EntityId> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<EntityId>) {
        if let Some(id) = self.id() {
            out.push(id);
        }
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    fn canonicalize(&mut self) {
        for child in &mut self.children {
            child.canonicalize();
        }
        if !self.tag.orders_children() {
            self.children
                .sort_by(|a, b| (a.tag, &a.attributes).cmp(&(b.tag, &b.attributes)));
        }
    }
}

/// 文档修订的规范形式：仅在无顺序依赖的容器内忽略兄弟顺序。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision(NodeData);

impl Revision {
    pub fn new(mut data: NodeData) -> Self {
        data.canonicalize();
        Self(data)
    }

    #[inline]
    pub fn data(&self) -> &NodeData {
        &self.0
    }
}

/// 树内节点句柄。节点删除后句柄失效，不得跨修订保存，跨修订请使用 `EntityId`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey(usize);

/// 插入位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Append,
    First,
    After(NodeKey),
    Index(usize),
}

/// 扫描用的原始 id 记录，可跨线程传递。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawId {
    pub tag: NodeTag,
    pub raw: String,
}

#[derive(Debug, Clone)]
struct Node {
    tag: NodeTag,
    attributes: BTreeMap<String, String>,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
}

/// 持久化文档树，保存与加载的唯一真实来源。
#[derive(Debug, Clone)]
pub struct DocumentTree {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    root: NodeKey,
    index: HashMap<EntityId, NodeKey>,
    /// `None` 表示 id 空间已耗尽。
    next_id: Option<u64>,
    read_only: bool,
}

impl Default for DocumentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentTree {
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Node {
                tag: NodeTag::Pattern,
                attributes: BTreeMap::new(),
                parent: None,
                children: Vec::new(),
            })],
            free: Vec::new(),
            root: NodeKey(0),
            index: HashMap::new(),
            next_id: Some(1),
            read_only: false,
        }
    }

    /// 从持久化数据构建。不做 id 校验：重复或非法 id 由加载流程扫描后报告，
    /// 索引中同一 id 只保留第一次出现的节点。
    pub fn from_data(data: NodeData) -> Self {
        let mut tree = Self::new();
        let root = tree.root;
        if let Some(node) = tree.node_mut(root) {
            node.tag = data.tag;
            node.attributes = data.attributes;
        }
        for child in data.children {
            tree.insert_data(root, InsertPosition::Append, child);
        }
        tree
    }

    pub fn to_data(&self) -> NodeData {
        self.subtree_data(self.root).unwrap_or_else(|| NodeData::new(NodeTag::Pattern))
    }

    pub fn revision(&self) -> Revision {
        Revision::new(self.to_data())
    }

    /// 克隆子树。
    pub fn subtree_data(&self, key: NodeKey) -> Option<NodeData> {
        let node = self.node(key)?;
        Some(NodeData {
            tag: node.tag,
            attributes: node.attributes.clone(),
            children: node
                .children
                .iter()
                .filter_map(|child| self.subtree_data(*child))
                .collect(),
        })
    }

    #[inline]
    pub fn root(&self) -> NodeKey {
        self.root
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn node(&self, key: NodeKey) -> Option<&Node> {
        self.slots.get(key.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.slots.get_mut(key.0).and_then(Option::as_mut)
    }

    #[inline]
    pub fn contains(&self, key: NodeKey) -> bool {
        self.node(key).is_some()
    }

    /// 存活节点数量。
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.node(self.root).is_none_or(|root| root.children.is_empty())
    }

    pub fn tag(&self, key: NodeKey) -> Option<NodeTag> {
        self.node(key).map(|node| node.tag)
    }

    pub fn attribute(&self, key: NodeKey, name: &str) -> Option<&str> {
        self.node(key)
            .and_then(|node| node.attributes.get(name))
            .map(String::as_str)
    }

    pub fn attributes(&self, key: NodeKey) -> Option<&BTreeMap<String, String>> {
        self.node(key).map(|node| &node.attributes)
    }

    /// 设置属性，返回旧值。`id` 属性不可通过此方法修改。
    pub fn set_attribute(
        &mut self,
        key: NodeKey,
        name: &str,
        value: impl Into<String>,
    ) -> Option<String> {
        debug_assert_ne!(name, attr::ID);
        self.node_mut(key)
            .and_then(|node| node.attributes.insert(name.to_string(), value.into()))
    }

    pub fn remove_attribute(&mut self, key: NodeKey, name: &str) -> Option<String> {
        debug_assert_ne!(name, attr::ID);
        self.node_mut(key).and_then(|node| node.attributes.remove(name))
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.node(key).and_then(|node| node.parent)
    }

    pub fn children(&self, key: NodeKey) -> &[NodeKey] {
        self.node(key).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    pub fn index_in_parent(&self, key: NodeKey) -> Option<usize> {
        let parent = self.parent(key)?;
        self.children(parent).iter().position(|child| *child == key)
    }

    pub fn previous_sibling(&self, key: NodeKey) -> Option<NodeKey> {
        let parent = self.parent(key)?;
        let index = self.index_in_parent(key)?;
        index
            .checked_sub(1)
            .and_then(|prev| self.children(parent).get(prev).copied())
    }

    pub fn child_by_tag(&self, parent: NodeKey, tag: NodeTag) -> Option<NodeKey> {
        self.children(parent)
            .iter()
            .copied()
            .find(|child| self.tag(*child) == Some(tag))
    }

    /// 获取或创建容器子节点。
    pub fn ensure_child(&mut self, parent: NodeKey, tag: NodeTag) -> NodeKey {
        if let Some(existing) = self.child_by_tag(parent, tag) {
            return existing;
        }
        self.insert_data(parent, InsertPosition::Append, NodeData::new(tag))
    }

    #[inline]
    pub fn find_by_id(&self, id: EntityId) -> Option<NodeKey> {
        self.index.get(&id).copied()
    }

    #[inline]
    pub fn id_of(&self, key: NodeKey) -> Option<EntityId> {
        self.attribute(key, attr::ID).and_then(EntityId::parse)
    }

    /// 节点对应的实体种类。
    pub fn entity_kind(&self, key: NodeKey) -> Option<EntityKind> {
        let tag = self.tag(key)?;
        if tag == NodeTag::Destination {
            return Some(
                self.attribute(key, attr::KIND)
                    .and_then(EntityKind::parse)
                    .unwrap_or(EntityKind::Point),
            );
        }
        tag.entity_kind()
    }

    pub fn blocks(&self) -> Vec<NodeKey> {
        self.children(self.root)
            .iter()
            .copied()
            .filter(|child| self.tag(*child) == Some(NodeTag::Block))
            .collect()
    }

    /// 节点所在图块的序号。
    pub fn block_index_of(&self, key: NodeKey) -> Option<usize> {
        let mut current = Some(key);
        while let Some(node) = current {
            if self.tag(node) == Some(NodeTag::Block) {
                return self.blocks().iter().position(|block| *block == node);
            }
            current = self.parent(node);
        }
        None
    }

    /// 子树前序遍历（含自身）。
    pub fn descendants(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if !self.contains(current) {
                continue;
            }
            out.push(current);
            for child in self.children(current).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// 所有带 id 的节点，按文档顺序。
    pub fn identified_nodes(&self) -> Vec<(EntityId, NodeKey)> {
        self.descendants(self.root)
            .into_iter()
            .filter_map(|key| self.id_of(key).map(|id| (id, key)))
            .collect()
    }

    /// 收集全部原始 id 文本，供加载时的唯一性扫描使用。
    pub fn raw_ids(&self) -> Vec<RawId> {
        self.descendants(self.root)
            .into_iter()
            .filter_map(|key| {
                let node = self.node(key)?;
                node.attributes.get(attr::ID).map(|raw| RawId {
                    tag: node.tag,
                    raw: raw.clone(),
                })
            })
            .collect()
    }

    /// 分配新的实体 id。id 单调递增，永不复用；空间耗尽后返回 `None`。
    pub fn allocate_id(&mut self) -> Option<EntityId> {
        let next = self.next_id?;
        self.next_id = next.checked_add(1);
        Some(EntityId::new(next))
    }

    #[inline]
    pub fn next_id(&self) -> Option<u64> {
        self.next_id
    }

    /// 插入持久化子树，返回新节点句柄。
    pub fn insert_data(
        &mut self,
        parent: NodeKey,
        position: InsertPosition,
        data: NodeData,
    ) -> NodeKey {
        let NodeData {
            tag,
            attributes,
            children,
        } = data;
        let id = attributes.get(attr::ID).and_then(|raw| EntityId::parse(raw));
        let key = self.alloc_slot(Node {
            tag,
            attributes,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(id) = id {
            self.index.entry(id).or_insert(key);
            if self.next_id.is_some_and(|next| id.get() >= next) {
                self.next_id = id.get().checked_add(1);
            }
        }
        self.link(parent, key, position);
        for child in children {
            self.insert_data(key, InsertPosition::Append, child);
        }
        key
    }

    /// 摘除子树并返回其克隆。
    pub fn remove(&mut self, key: NodeKey) -> Option<NodeData> {
        if key == self.root {
            return None;
        }
        let data = self.subtree_data(key)?;
        if let Some(parent) = self.parent(key) {
            if let Some(node) = self.node_mut(parent) {
                node.children.retain(|child| *child != key);
            }
        }
        for descendant in self.descendants(key) {
            if let Some(id) = self.id_of(descendant) {
                if self.index.get(&id) == Some(&descendant) {
                    self.index.remove(&id);
                }
            }
            self.slots[descendant.0] = None;
            self.free.push(descendant.0);
        }
        Some(data)
    }

    /// 在同一父节点内移动节点，`after == None` 表示移到最前。
    pub fn move_after(&mut self, key: NodeKey, after: Option<NodeKey>) -> bool {
        let Some(parent) = self.parent(key) else {
            return false;
        };
        if let Some(anchor) = after {
            if anchor == key || self.parent(anchor) != Some(parent) {
                return false;
            }
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.retain(|child| *child != key);
        }
        let position = match after {
            Some(anchor) => InsertPosition::After(anchor),
            None => InsertPosition::First,
        };
        self.link(parent, key, position);
        true
    }

    fn alloc_slot(&mut self, node: Node) -> NodeKey {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeKey(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeKey(self.slots.len() - 1)
            }
        }
    }

    fn link(&mut self, parent: NodeKey, key: NodeKey, position: InsertPosition) {
        let index = match position {
            InsertPosition::Append => None,
            InsertPosition::First => Some(0),
            InsertPosition::Index(index) => Some(index),
            InsertPosition::After(anchor) => self
                .children(parent)
                .iter()
                .position(|child| *child == anchor)
                .map(|pos| pos + 1),
        };
        if let Some(node) = self.slots.get_mut(key.0).and_then(Option::as_mut) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            match index {
                Some(index) if index <= node.children.len() => node.children.insert(index, key),
                _ => node.children.push(key),
            }
        }
    }
}
