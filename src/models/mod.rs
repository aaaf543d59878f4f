pub mod blob;
pub mod file;
pub mod order;
pub mod quota;
pub mod share;
pub mod upload;
pub mod user;

pub use blob::*;
pub use file::*;
pub use order::*;
pub use quota::*;
pub use share::*;
pub use upload::*;
pub use user::*;
