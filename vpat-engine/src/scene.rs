use std::collections::{BTreeMap, HashSet};

use glam::DVec2;
use tracing::debug;
use vpat_core::document::{EntityId, EntityKind};
use vpat_core::geometry::{Point2, Vector2};

use crate::arena::{Handle, HandleArena};
use crate::errors::EngineError;
use crate::groups::GroupRegistry;
use crate::store::ObjectStore;
use crate::tools::ToolKind;

const DEFAULT_ZOOM: f64 = 1.0;
const MIN_ZOOM: f64 = 0.01;
const MAX_ZOOM: f64 = 1_000.0;

/// 记录视口状态（中心点与缩放）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub center: Point2,
    pub zoom: f64,
}

impl ViewportState {
    #[inline]
    fn clamp_zoom(value: f64) -> f64 {
        value.clamp(MIN_ZOOM, MAX_ZOOM)
    }
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            center: Point2::new(0.0, 0.0),
            zoom: DEFAULT_ZOOM,
        }
    }
}

/// 场景中的可视代理，完全由对象库与分组可见性派生。
#[derive(Debug, Clone, PartialEq)]
pub struct VisualProxy {
    pub kind: EntityKind,
    pub label: String,
    pub position: Option<Point2>,
    pub visible: bool,
}

/// 提交前的临时预览对象。
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub tool: ToolKind,
    pub sources: Vec<EntityId>,
    pub anchors: Vec<EntityId>,
    pub positions: Vec<Point2>,
}

pub type PreviewHandle = Handle<Preview>;

/// 运行时场景：可视代理、选中集、悬停、视口与预览。
#[derive(Debug, Default)]
pub struct Scene {
    proxies: BTreeMap<EntityId, VisualProxy>,
    selected: HashSet<EntityId>,
    hovered: Option<EntityId>,
    viewport: ViewportState,
    previews: HandleArena<Preview>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// 与对象库同步：移除已消失的代理，新增或刷新其余代理。操作节点本身不可见。
    pub fn sync(&mut self, store: &ObjectStore, groups: &GroupRegistry) {
        self.proxies.retain(|id, _| store.contains(*id));
        self.selected.retain(|id| store.contains(*id));
        if self.hovered.is_some_and(|id| !store.contains(id)) {
            self.hovered = None;
        }
        for object in store.iter() {
            if object.kind == EntityKind::Operation {
                continue;
            }
            self.proxies.insert(
                object.id,
                VisualProxy {
                    kind: object.kind,
                    label: object.label(),
                    position: object.position,
                    visible: !groups.is_hidden(object.id),
                },
            );
        }
        debug!(proxies = self.proxies.len(), "场景已同步");
    }

    /// 分组可见性变化后刷新派生可见性。
    pub fn apply_visibility(&mut self, groups: &GroupRegistry) {
        for (id, proxy) in &mut self.proxies {
            proxy.visible = !groups.is_hidden(*id);
        }
    }

    /// 清空全部运行时状态（预览除外，预览由持有方显式释放）。
    pub fn reset(&mut self) {
        self.proxies.clear();
        self.selected.clear();
        self.hovered = None;
        self.viewport = ViewportState::default();
    }

    pub fn proxy(&self, id: EntityId) -> Option<&VisualProxy> {
        self.proxies.get(&id)
    }

    pub fn proxies(&self) -> impl Iterator<Item = (EntityId, &VisualProxy)> {
        self.proxies.iter().map(|(id, proxy)| (*id, proxy))
    }

    #[inline]
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_visible(&self, id: EntityId) -> bool {
        self.proxies.get(&id).is_some_and(|proxy| proxy.visible)
    }

    /// 返回当前选中实体数量。
    #[inline]
    pub fn selection_len(&self) -> usize {
        self.selected.len()
    }

    #[inline]
    pub fn is_selected(&self, id: EntityId) -> bool {
        self.selected.contains(&id)
    }

    /// 选中指定实体。若实体不存在则返回错误。
    pub fn select(&mut self, id: EntityId) -> Result<(), EngineError> {
        if !self.proxies.contains_key(&id) {
            return Err(EngineError::EntityNotFound(id));
        }
        self.selected.insert(id);
        Ok(())
    }

    /// 取消选中指定实体，返回之前是否处于选中状态。
    pub fn deselect(&mut self, id: EntityId) -> bool {
        self.selected.remove(&id)
    }

    /// 切换实体选中状态，返回切换后的状态。
    pub fn toggle_selection(&mut self, id: EntityId) -> Result<bool, EngineError> {
        if !self.proxies.contains_key(&id) {
            return Err(EngineError::EntityNotFound(id));
        }
        if !self.selected.insert(id) {
            self.selected.remove(&id);
            Ok(false)
        } else {
            Ok(true)
        }
    }

    #[inline]
    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    pub fn selection(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.selected.iter().copied()
    }

    #[inline]
    pub fn hovered(&self) -> Option<EntityId> {
        self.hovered
    }

    pub fn set_hover(&mut self, id: Option<EntityId>) {
        self.hovered = id.filter(|id| self.proxies.contains_key(id));
    }

    #[inline]
    pub fn viewport(&self) -> ViewportState {
        self.viewport
    }

    #[inline]
    pub fn reset_viewport(&mut self) {
        self.viewport = ViewportState::default();
    }

    pub fn pan_viewport(&mut self, delta: Vector2) {
        self.viewport.center = self.viewport.center.translate(delta);
    }

    /// 设置缩放倍数（自动限制在合法范围内）。
    pub fn set_viewport_zoom(&mut self, zoom: f64) {
        self.viewport.zoom = ViewportState::clamp_zoom(zoom);
    }

    fn center_of<'a>(positions: impl Iterator<Item = &'a Point2>) -> Option<Point2> {
        let mut bounds: Option<(DVec2, DVec2)> = None;
        for point in positions {
            let p = point.as_vec2();
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(p), max.max(p)),
                None => (p, p),
            });
        }
        bounds.map(|(min, max)| Point2::from_vec((min + max) * 0.5))
    }

    /// 聚焦当前选中实体，若为空则退化到全部可见代理。
    pub fn focus_on_selection(&mut self) {
        let selected = Self::center_of(
            self.selected
                .iter()
                .filter_map(|id| self.proxies.get(id))
                .filter_map(|proxy| proxy.position.as_ref()),
        );
        let target = selected.or_else(|| {
            Self::center_of(
                self.proxies
                    .values()
                    .filter(|proxy| proxy.visible)
                    .filter_map(|proxy| proxy.position.as_ref()),
            )
        });
        if let Some(center) = target {
            self.viewport.center = center;
        }
    }

    pub fn attach_preview(&mut self, preview: Preview) -> PreviewHandle {
        self.previews.attach(preview)
    }

    pub fn preview(&self, handle: PreviewHandle) -> Option<&Preview> {
        self.previews.get(handle)
    }

    /// 替换预览内容，句柄已失效时返回 `false`。
    pub fn update_preview(&mut self, handle: PreviewHandle, preview: Preview) -> bool {
        match self.previews.get_mut(handle) {
            Some(slot) => {
                *slot = preview;
                true
            }
            None => false,
        }
    }

    pub fn detach_preview(&mut self, handle: PreviewHandle) -> Option<Preview> {
        self.previews.detach(handle)
    }

    #[inline]
    pub fn preview_count(&self) -> usize {
        self.previews.len()
    }
}
