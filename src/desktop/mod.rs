//! Desktop shell helpers: local gateway readiness and `attach://` URL resolution.

mod attachment_url;
mod gateway;

pub use attachment_url::{AttachmentUrlCache, extract_attachment_ids};
pub use gateway::{GatewayLocator, GatewayReadiness};
