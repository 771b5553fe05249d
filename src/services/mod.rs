/// Token-issuing authentication.
pub mod auth;

/// Follow relationships.
pub mod follow;

/// Password digests, access-token signing, and random refresh tokens.
pub mod token;

/// User lookups.
pub mod user_info;

pub use auth::AuthService;
pub use follow::FollowService;
pub use token::TokenSigner;
pub use user_info::UserInfoService;
