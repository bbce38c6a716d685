pub mod auth;
pub mod gate;
pub mod response;

pub use auth::jwt_auth_middleware;
pub use gate::{require_migrate_capability, CapabilityGate, Decision, RoleGate};
pub use response::{ApiResponse, ApiResult};
