pub mod config;
pub mod desktop;
pub mod upload;
pub mod utils;

// 重新导出常用类型
pub use config::Config;
pub use desktop::{AttachmentUrlCache, GatewayLocator, GatewayReadiness, extract_attachment_ids};
pub use upload::{
    AttachmentDescriptor,
    Category,
    ChunkTransport,
    DesktopBridge,
    ResumableClient,
    Result,
    RunnerEvent,
    TaskId,
    TaskRunner,
    TaskStats,
    TaskStatus,
    UploadConfig,
    UploadError,
    UploadEvent,
    UploadFile,
    UploadManager,
    UploadManagerHandle,
    UploadTask,
};
