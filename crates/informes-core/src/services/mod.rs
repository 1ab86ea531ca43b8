mod profile;

pub use profile::{ProfileService, UserInfo, USER_INFO_PATH};
