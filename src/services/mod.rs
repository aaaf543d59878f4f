pub mod auth;
pub mod blob;
pub mod file;
pub mod mail_code;
pub mod purchase;
pub mod quota;
pub mod share;
pub mod upload;

pub use auth::{IdentityVerifier, JwtIdentity};
pub use blob::BlobService;
pub use file::FileService;
pub use mail_code::MailCodeService;
pub use purchase::StoragePurchaseService;
pub use quota::QuotaLedger;
pub use share::ShareService;
pub use upload::UploadService;
