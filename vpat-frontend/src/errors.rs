use std::path::PathBuf;

use thiserror::Error;
use vpat_engine::errors::EngineError;
use vpat_io::IoError;

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("纸样文件读写失败: {0}")]
    Io(#[from] IoError),
    #[error("纸样文档无法打开: {0}")]
    Engine(#[from] EngineError),
    #[error("无法打开纸样 {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Box<FrontendError>,
    },
}
