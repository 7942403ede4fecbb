//! 对象库：当前修订下各实体的快照与求值结果，完全由文档树派生。

use std::collections::BTreeMap;

use tracing::warn;
use vpat_core::document::{DocumentTree, EntityId, EntityKind, NodeKey, NodeTag, attr};
use vpat_core::formula::{Formula, FormulaError, FormulaScope};
use vpat_core::geometry::{Axis, Point2};

use crate::errors::EngineError;
use crate::tools::{OperationParams, ToolKind};

/// 测量表：公式中以 `#name` 引用。
pub type Measurements = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub id: EntityId,
    pub kind: EntityKind,
    pub tag: NodeTag,
    pub name: Option<String>,
    pub block: usize,
    pub attributes: BTreeMap<String, String>,
    /// 操作结果对象的源对象。
    pub origin: Option<EntityId>,
    /// 操作结果对象所属的操作。
    pub operation: Option<EntityId>,
    pub references: Vec<EntityId>,
    pub values: BTreeMap<String, f64>,
    pub position: Option<Point2>,
}

impl StoredObject {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// 显示名：名称优先，其次别名，最后回退到 id。
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.attr(attr::ALIAS).map(str::to_string))
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

fn parse_formula(owner: EntityId, name: &str, raw: &str) -> Result<Formula, EngineError> {
    Formula::parse(raw).map_err(|source| EngineError::InvalidFormula {
        owner,
        attr: name.to_string(),
        source,
    })
}

fn parse_reference(owner: EntityId, name: &str, raw: &str) -> Result<EntityId, EngineError> {
    EntityId::parse(raw).ok_or_else(|| EngineError::InvalidFormula {
        owner,
        attr: name.to_string(),
        source: FormulaError::InvalidReference(raw.to_string()),
    })
}

/// 节点引用的全部实体 id（直接引用、公式引用、子节点引用），去重并保持顺序。
pub fn references_of(tree: &DocumentTree, key: NodeKey) -> Result<Vec<EntityId>, EngineError> {
    let (Some(kind), Some(owner), Some(tag)) =
        (tree.entity_kind(key), tree.id_of(key), tree.tag(key))
    else {
        return Ok(Vec::new());
    };
    let mut out: Vec<EntityId> = Vec::new();
    let mut push = |id: EntityId| {
        if !out.contains(&id) {
            out.push(id);
        }
    };

    for name in kind.reference_keys() {
        if let Some(raw) = tree.attribute(key, name) {
            push(parse_reference(owner, name, raw)?);
        }
    }
    for name in kind.formula_keys() {
        if let Some(raw) = tree.attribute(key, name) {
            for id in parse_formula(owner, name, raw)?.references() {
                push(id);
            }
        }
    }

    let child_tag = match tag {
        NodeTag::Operation => Some(NodeTag::Source),
        NodeTag::Piece => Some(NodeTag::PieceNode),
        _ => None,
    };
    if let Some(child_tag) = child_tag {
        for child in tree.children(key) {
            if tree.tag(*child) != Some(child_tag) {
                continue;
            }
            if let Some(raw) = tree.attribute(*child, attr::OBJECT) {
                push(parse_reference(owner, attr::OBJECT, raw)?);
            }
        }
    }

    if tag == NodeTag::Destination {
        if let Some(operation) = tree.parent(key).and_then(|parent| tree.id_of(parent)) {
            push(operation);
        }
        if let Some(raw) = tree.attribute(key, attr::OBJECT) {
            push(parse_reference(owner, attr::OBJECT, raw)?);
        }
    }
    Ok(out)
}

/// 由树节点构建对象快照（未求值）。分组与无 id 节点返回 `None`。
pub fn build_object(tree: &DocumentTree, key: NodeKey) -> Result<Option<StoredObject>, EngineError> {
    let (Some(id), Some(kind), Some(tag)) = (tree.id_of(key), tree.entity_kind(key), tree.tag(key))
    else {
        return Ok(None);
    };
    if kind == EntityKind::Group {
        return Ok(None);
    }
    let references = references_of(tree, key)?;
    let attributes = tree.attributes(key).cloned().unwrap_or_default();
    let (origin, operation) = if tag == NodeTag::Destination {
        (
            tree.attribute(key, attr::OBJECT).and_then(EntityId::parse),
            tree.parent(key).and_then(|parent| tree.id_of(parent)),
        )
    } else {
        (None, None)
    };
    Ok(Some(StoredObject {
        id,
        kind,
        tag,
        name: attributes.get(attr::NAME).cloned(),
        block: tree.block_index_of(key).unwrap_or(0),
        attributes,
        origin,
        operation,
        references,
        values: BTreeMap::new(),
        position: None,
    }))
}

struct EvalScope<'a> {
    store: &'a ObjectStore,
    measurements: &'a Measurements,
}

impl FormulaScope for EvalScope<'_> {
    fn value_of(&self, id: EntityId, attr: Option<&str>) -> Option<f64> {
        let object = self.store.get(id)?;
        match attr {
            Some("x") => object.position.map(Point2::x),
            Some("y") => object.position.map(Point2::y),
            Some(name) => object.values.get(name).copied(),
            None => object.values.get("length").copied(),
        }
    }

    fn variable(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStore {
    objects: BTreeMap<EntityId, StoredObject>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&StoredObject> {
        self.objects.get(&id)
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.objects.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredObject> {
        self.objects.values()
    }

    /// 插入或替换对象，保留旧的求值结果直到下次重算。
    pub fn upsert(&mut self, mut object: StoredObject) {
        if let Some(previous) = self.objects.get(&object.id) {
            object.values = previous.values.clone();
            object.position = previous.position;
        }
        self.objects.insert(object.id, object);
    }

    pub fn remove(&mut self, id: EntityId) -> Option<StoredObject> {
        self.objects.remove(&id)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn evaluate_formula(
        &self,
        formula: &Formula,
        measurements: &Measurements,
    ) -> Result<f64, FormulaError> {
        formula.evaluate(&EvalScope {
            store: self,
            measurements,
        })
    }

    /// 依次重算给定对象。调用方保证顺序为文档顺序，依赖总是先于依赖者。
    pub fn recompute(&mut self, order: &[EntityId], measurements: &Measurements) {
        for id in order {
            let Some(object) = self.objects.get(id) else {
                continue;
            };
            let (values, position) = self.evaluate(object, measurements);
            if let Some(object) = self.objects.get_mut(id) {
                object.values = values;
                object.position = position;
            }
        }
    }

    fn evaluate(
        &self,
        object: &StoredObject,
        measurements: &Measurements,
    ) -> (BTreeMap<String, f64>, Option<Point2>) {
        let scope = EvalScope {
            store: self,
            measurements,
        };
        let mut values = BTreeMap::new();
        for name in object.kind.formula_keys() {
            let Some(raw) = object.attr(name) else {
                continue;
            };
            match Formula::parse(raw).and_then(|formula| formula.evaluate(&scope)) {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(err) => {
                    warn!(id = object.id.get(), attr = *name, error = %err, "公式求值失败");
                }
            }
        }

        let position_of = |raw: Option<&str>| {
            raw.and_then(EntityId::parse)
                .and_then(|id| self.get(id))
                .and_then(|target| target.position)
        };

        let position = match object.tag {
            NodeTag::Point => {
                let x = values.get("x").copied().unwrap_or(0.0);
                let y = values.get("y").copied().unwrap_or(0.0);
                let base = position_of(object.attr("base")).unwrap_or(Point2::new(0.0, 0.0));
                Some(Point2::new(base.x() + x, base.y() + y))
            }
            NodeTag::Line | NodeTag::Curve => {
                let ends = (
                    position_of(object.attr("first")),
                    position_of(object.attr("second")),
                );
                if let (Some(first), Some(second)) = ends {
                    values
                        .entry("length".to_string())
                        .or_insert_with(|| first.distance(second));
                }
                None
            }
            NodeTag::Operation => object
                .attr(attr::TOOL)
                .and_then(ToolKind::parse)
                .and_then(|tool| tool.anchor_keys().first())
                .and_then(|name| position_of(object.attr(name))),
            NodeTag::Destination => self.destination_position(object, &mut values),
            _ => None,
        };
        (values, position)
    }

    fn destination_position(
        &self,
        object: &StoredObject,
        values: &mut BTreeMap<String, f64>,
    ) -> Option<Point2> {
        let operation = object.operation.and_then(|id| self.get(id))?;
        let source = object.origin.and_then(|id| self.get(id))?;
        for (name, value) in &source.values {
            values.entry(name.clone()).or_insert(*value);
        }
        let tool = operation.attr(attr::TOOL).and_then(ToolKind::parse)?;
        let params = OperationParams::from_values(
            &operation.values,
            operation.attr(attr::AXIS).and_then(Axis::parse),
        );
        let anchors: Vec<Point2> = tool
            .anchor_keys()
            .iter()
            .map_while(|name| {
                operation
                    .attr(name)
                    .and_then(EntityId::parse)
                    .and_then(|id| self.get(id))
                    .and_then(|anchor| anchor.position)
            })
            .collect();
        let from = source.position?;
        Some(tool.apply(from, &anchors, &params))
    }
}

#[cfg(test)]
mod tests {
    use vpat_core::document::NodeData;

    use super::*;

    fn tree() -> DocumentTree {
        DocumentTree::from_data(
            NodeData::new(NodeTag::Pattern).with_child(
                NodeData::new(NodeTag::Block).with_child(
                    NodeData::new(NodeTag::Calculation)
                        .with_child(
                            NodeData::new(NodeTag::Point)
                                .with_id(EntityId::new(1))
                                .with_attr("x", "0")
                                .with_attr("y", "0"),
                        )
                        .with_child(
                            NodeData::new(NodeTag::Point)
                                .with_id(EntityId::new(2))
                                .with_attr(attr::NAME, "B")
                                .with_attr("x", "#waist / 2")
                                .with_attr("y", "@1.y + 5"),
                        )
                        .with_child(
                            NodeData::new(NodeTag::Operation)
                                .with_id(EntityId::new(3))
                                .with_attr(attr::TOOL, "rotation")
                                .with_attr(attr::CENTER, "1")
                                .with_attr("angle", "90")
                                .with_child(NodeData::new(NodeTag::Source).with_attr(attr::OBJECT, "2"))
                                .with_child(
                                    NodeData::new(NodeTag::Destination)
                                        .with_id(EntityId::new(4))
                                        .with_attr(attr::OBJECT, "2"),
                                ),
                        ),
                ),
            ),
        )
    }

    fn store_for(tree: &DocumentTree) -> ObjectStore {
        let mut store = ObjectStore::new();
        let mut order = Vec::new();
        for (id, key) in tree.identified_nodes() {
            if let Some(object) = build_object(tree, key).unwrap() {
                store.upsert(object);
                order.push(id);
            }
        }
        let measurements = Measurements::from([("waist".to_string(), 20.0)]);
        store.recompute(&order, &measurements);
        store
    }

    #[test]
    fn references_cover_attributes_formulas_and_children() {
        let tree = tree();
        let op = tree.find_by_id(EntityId::new(3)).unwrap();
        assert_eq!(
            references_of(&tree, op).unwrap(),
            vec![EntityId::new(1), EntityId::new(2)]
        );
        let dest = tree.find_by_id(EntityId::new(4)).unwrap();
        assert_eq!(
            references_of(&tree, dest).unwrap(),
            vec![EntityId::new(3), EntityId::new(2)]
        );
    }

    #[test]
    fn recompute_evaluates_points_and_operation_results() {
        let tree = tree();
        let store = store_for(&tree);
        assert_eq!(store.get(EntityId::new(2)).unwrap().position, Some(Point2::new(10.0, 5.0)));
        let result = store.get(EntityId::new(4)).unwrap().position.unwrap();
        assert!(result.distance(Point2::new(-5.0, 10.0)) < 1e-9);
        assert_eq!(store.get(EntityId::new(3)).unwrap().position, Some(Point2::new(0.0, 0.0)));
        assert_eq!(store.get(EntityId::new(2)).unwrap().label(), "B");
        assert_eq!(store.get(EntityId::new(1)).unwrap().label(), "#1");
    }

    #[test]
    fn flip_by_line_reads_both_axis_points() {
        let mut tree = tree();
        let calculation = tree.children(tree.children(tree.root())[0])[0];
        tree.insert_data(
            calculation,
            vpat_core::document::InsertPosition::Append,
            NodeData::new(NodeTag::Point)
                .with_id(EntityId::new(5))
                .with_attr("x", "0")
                .with_attr("y", "10"),
        );
        tree.insert_data(
            calculation,
            vpat_core::document::InsertPosition::Append,
            NodeData::new(NodeTag::Operation)
                .with_id(EntityId::new(6))
                .with_attr(attr::TOOL, "flip-by-line")
                .with_attr(attr::AXIS_FIRST, "1")
                .with_attr(attr::AXIS_SECOND, "5")
                .with_child(NodeData::new(NodeTag::Source).with_attr(attr::OBJECT, "2"))
                .with_child(
                    NodeData::new(NodeTag::Destination)
                        .with_id(EntityId::new(7))
                        .with_attr(attr::OBJECT, "2"),
                ),
        );
        let operation = tree.find_by_id(EntityId::new(6)).unwrap();
        assert_eq!(
            references_of(&tree, operation).unwrap(),
            vec![EntityId::new(1), EntityId::new(5), EntityId::new(2)]
        );
        let store = store_for(&tree);
        let result = store.get(EntityId::new(7)).unwrap().position.unwrap();
        assert!(result.distance(Point2::new(-10.0, 5.0)) < 1e-9);
    }

    #[test]
    fn malformed_formula_is_reported_with_owner() {
        let mut tree = tree();
        let key = tree.find_by_id(EntityId::new(2)).unwrap();
        tree.set_attribute(key, "x", "1 +");
        let err = references_of(&tree, key).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidFormula { owner, ref attr, .. } if owner == EntityId::new(2) && attr == "x"
        ));
    }
}
