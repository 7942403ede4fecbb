//! 由选择状态机驱动的操作工具。每个工具以源对象列表 + 锚点生成一组结果对象。

use std::collections::BTreeMap;

use vpat_core::document::{EntityKind, attr};
use vpat_core::geometry::{Axis, Point2, Vector2};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Rotation,
    Move,
    FlipByAxis,
    FlipByLine,
}

/// 工具参数的数值形式，由操作节点的属性求值得到。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OperationParams {
    pub angle: f64,
    pub length: f64,
    pub rotation_angle: f64,
    pub axis: Option<Axis>,
}

impl OperationParams {
    pub fn from_values(values: &BTreeMap<String, f64>, axis: Option<Axis>) -> Self {
        let value = |name: &str| values.get(name).copied().unwrap_or(0.0);
        Self {
            angle: value("angle"),
            length: value("length"),
            rotation_angle: value("rotation_angle"),
            axis,
        }
    }
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Rotation,
        ToolKind::Move,
        ToolKind::FlipByAxis,
        ToolKind::FlipByLine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Rotation => "rotation",
            ToolKind::Move => "move",
            ToolKind::FlipByAxis => "flip-by-axis",
            ToolKind::FlipByLine => "flip-by-line",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == value)
    }

    /// 可作为源对象的实体种类。
    pub fn accepts_source(self, kind: EntityKind) -> bool {
        matches!(kind, EntityKind::Point | EntityKind::Curve)
    }

    pub fn accepts_anchor(self, kind: EntityKind) -> bool {
        kind == EntityKind::Point
    }

    /// 需要拾取的锚点个数。按直线镜像需要直线上的两个点。
    pub fn anchor_count(self) -> usize {
        match self {
            ToolKind::FlipByLine => 2,
            _ => 1,
        }
    }

    /// 锚点写入操作节点时使用的属性名，与拾取顺序一一对应。
    pub fn anchor_keys(self) -> &'static [&'static str] {
        match self {
            ToolKind::FlipByLine => &[attr::AXIS_FIRST, attr::AXIS_SECOND],
            _ => &[attr::CENTER],
        }
    }

    /// 锚点是否可以跳过。移动工具的旋转中心是可选的。
    pub fn anchor_optional(self) -> bool {
        self == ToolKind::Move
    }

    /// 预览阶段是否允许按住修饰键重新拾取锚点。
    pub fn allows_anchor_repick(self) -> bool {
        self == ToolKind::Move
    }

    /// 配置步骤的参数及其默认值。
    pub fn default_parameters(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ToolKind::Rotation => &[("angle", "0")],
            ToolKind::Move => &[("angle", "0"), ("length", "0"), ("rotation_angle", "0")],
            ToolKind::FlipByAxis => &[("axis", "vertical")],
            ToolKind::FlipByLine => &[],
        }
    }

    /// 以公式保存的参数。
    pub fn formula_parameters(self) -> &'static [&'static str] {
        match self {
            ToolKind::Rotation => &["angle"],
            ToolKind::Move => &["angle", "length", "rotation_angle"],
            ToolKind::FlipByAxis | ToolKind::FlipByLine => &[],
        }
    }

    /// 结果对象命名后缀。
    pub fn suffix(self) -> &'static str {
        match self {
            ToolKind::Rotation => "r",
            ToolKind::Move => "m",
            ToolKind::FlipByAxis => "f",
            ToolKind::FlipByLine => "fl",
        }
    }

    /// 计算单个源点的结果位置。`anchors` 按拾取顺序给出，缺少锚点时源点不变。
    pub fn apply(self, source: Point2, anchors: &[Point2], params: &OperationParams) -> Point2 {
        let anchor = anchors.first().copied();
        match self {
            ToolKind::Rotation => match anchor {
                Some(center) => source.rotate_around(center, params.angle),
                None => source,
            },
            ToolKind::Move => {
                let moved = source.translate(Vector2::from_polar(params.length, params.angle));
                match anchor {
                    Some(center) => {
                        let center = center.translate(Vector2::from_polar(params.length, params.angle));
                        moved.rotate_around(center, params.rotation_angle)
                    }
                    None => moved,
                }
            }
            ToolKind::FlipByAxis => match anchor {
                Some(origin) => source.flip(origin, params.axis.unwrap_or(Axis::Vertical)),
                None => source,
            },
            ToolKind::FlipByLine => match anchors {
                [first, second, ..] => source.flip_across(*first, *second),
                _ => source,
            },
        }
    }
}
