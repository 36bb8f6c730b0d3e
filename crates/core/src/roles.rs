//! Well-known role name constants.
//!
//! Role names arrive in the `role` claim of access tokens issued by the
//! external auth service.

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MODERATOR: &str = "moderator";
pub const ROLE_USER: &str = "user";

/// Moderators and admins may act on other users' requests and images.
pub fn is_moderator_role(role: &str) -> bool {
    role == ROLE_MODERATOR || role == ROLE_ADMIN
}
