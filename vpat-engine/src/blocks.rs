use vpat_core::document::{DocumentTree, attr};

use crate::errors::EngineError;

/// 图块名称与序号之间的映射，以及当前激活的图块。
#[derive(Debug, Clone, Default)]
pub struct PatternBlocks {
    names: Vec<String>,
    active: usize,
}

impl PatternBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, tree: &DocumentTree) {
        self.names = tree
            .blocks()
            .into_iter()
            .enumerate()
            .map(|(index, key)| {
                tree.attribute(key, attr::NAME)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Block {}", index + 1))
            })
            .collect();
        if self.active >= self.names.len() {
            self.active = 0;
        }
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn active_name(&self) -> Option<&str> {
        self.name(self.active)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|candidate| candidate == name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 切换激活图块，返回是否发生变化。
    pub fn set_active(&mut self, index: usize) -> Result<bool, EngineError> {
        if index >= self.names.len() {
            return Err(EngineError::UnknownBlock(index));
        }
        let changed = self.active != index;
        self.active = index;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use vpat_core::document::{NodeData, NodeTag};

    use super::*;

    #[test]
    fn names_and_active_block() {
        let tree = DocumentTree::from_data(
            NodeData::new(NodeTag::Pattern)
                .with_child(NodeData::new(NodeTag::Block).with_attr(attr::NAME, "Front"))
                .with_child(NodeData::new(NodeTag::Block)),
        );
        let mut blocks = PatternBlocks::new();
        blocks.rebuild(&tree);
        assert_eq!(blocks.names(), &["Front".to_string(), "Block 2".to_string()]);
        assert_eq!(blocks.find("Block 2"), Some(1));
        assert_eq!(blocks.set_active(1), Ok(true));
        assert_eq!(blocks.set_active(1), Ok(false));
        assert_eq!(blocks.active_name(), Some("Block 2"));
        assert_eq!(blocks.set_active(5), Err(EngineError::UnknownBlock(5)));
    }
}
