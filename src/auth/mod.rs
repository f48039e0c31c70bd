pub mod authenticator;
pub mod key_material;
pub mod middleware;
pub mod registry;

pub use authenticator::{Authenticator, ValidatedIdentity};
pub use key_material::KeyMaterialManager;
pub use middleware::{extract_api_key, require_api_key};
pub use registry::{ApiKeyPage, ApiKeyRegistry, IssueRequest, IssuedKey};
