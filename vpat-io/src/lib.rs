use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vpat_core::document::{DocumentTree, NodeData, NodeTag};

/// 当前写出的文件格式版本。
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

/// 磁盘上的纸样文件：文档树加测量表。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
    pub document: NodeData,
}

impl PatternFile {
    pub fn new(tree: &DocumentTree, measurements: BTreeMap<String, f64>) -> Self {
        Self {
            version: FORMAT_VERSION,
            measurements,
            document: tree.to_data(),
        }
    }

    pub fn into_tree(self) -> DocumentTree {
        DocumentTree::from_data(self.document)
    }
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<PatternFile, IoError>;
}

pub trait DocumentSaver {
    fn save(&self, file: &PatternFile, path: &Path) -> Result<(), IoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFacade {
    pretty: bool,
}

impl JsonFacade {
    pub fn new() -> Self {
        Self { pretty: true }
    }

    /// 紧凑输出，不带缩进。
    pub fn compact() -> Self {
        Self { pretty: false }
    }

    pub fn parse(&self, data: &str) -> Result<PatternFile, IoError> {
        let file: PatternFile = serde_json::from_str(data)
            .map_err(|err| IoError::InvalidDocument(err.to_string()))?;
        if file.version > FORMAT_VERSION {
            return Err(IoError::UnsupportedFeature(format!(
                "文件格式版本 {} 高于当前支持的 {}",
                file.version, FORMAT_VERSION
            )));
        }
        if file.document.tag != NodeTag::Pattern {
            return Err(IoError::InvalidDocument(format!(
                "根节点应为 pattern，实际为 {}",
                file.document.tag.as_str()
            )));
        }
        Ok(file)
    }

    pub fn render(&self, file: &PatternFile) -> Result<String, IoError> {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(file)
        } else {
            serde_json::to_string(file)
        };
        rendered.map_err(|err| IoError::InvalidDocument(err.to_string()))
    }
}

impl DocumentLoader for JsonFacade {
    fn load(&self, path: &Path) -> Result<PatternFile, IoError> {
        let data = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(&data)
    }
}

impl DocumentSaver for JsonFacade {
    fn save(&self, file: &PatternFile, path: &Path) -> Result<(), IoError> {
        let data = self.render(file)?;
        fs::write(path, data).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpat_core::document::{EntityId, attr};

    fn sample_tree() -> DocumentTree {
        let calculation = NodeData::new(NodeTag::Calculation).with_child(
            NodeData::new(NodeTag::Point)
                .with_id(EntityId::new(1))
                .with_attr(attr::NAME, "A")
                .with_attr("x", "#waist / 2")
                .with_attr("y", "0"),
        );
        DocumentTree::from_data(
            NodeData::new(NodeTag::Pattern).with_child(
                NodeData::new(NodeTag::Block)
                    .with_attr(attr::NAME, "Block 1")
                    .with_child(calculation),
            ),
        )
    }

    #[test]
    fn rejects_non_pattern_root() {
        let err = JsonFacade::new()
            .parse(r#"{"version":1,"document":{"tag":"block"}}"#)
            .unwrap_err();
        assert!(matches!(err, IoError::InvalidDocument(_)));
    }

    #[test]
    fn rejects_future_format() {
        let err = JsonFacade::new()
            .parse(r#"{"version":99,"document":{"tag":"pattern"}}"#)
            .unwrap_err();
        assert!(matches!(err, IoError::UnsupportedFeature(_)));
    }

    #[test]
    fn compact_output_is_single_line() {
        let file = PatternFile::new(&sample_tree(), BTreeMap::new());
        let text = JsonFacade::compact().render(&file).unwrap();
        assert!(!text.contains('\n'));
        assert!(!text.contains("measurements"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = JsonFacade::new()
            .load(Path::new("/definitely/not/here.vpat.json"))
            .unwrap_err();
        match err {
            IoError::ReadError { path, .. } => assert!(path.ends_with("here.vpat.json")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
