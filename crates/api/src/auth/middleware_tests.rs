//! Session token and role-check tests.

use jsonwebtoken::{encode, EncodingKey, Header};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{AuthUser, Claims, JwtManager};
use crate::error::ApiError;

const SECRET: &str = "test-session-secret";

#[test]
fn test_token_round_trip() {
    let manager = JwtManager::new(SECRET, 24);
    let user_id = Uuid::new_v4();

    let token = manager
        .create_token(user_id, Some("crew@turfquote.test"), "member")
        .unwrap();
    let claims = manager.verify_token(&token).unwrap();

    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.email.as_deref(), Some("crew@turfquote.test"));
    assert_eq!(claims.role, "member");
    assert!(claims.exp > claims.iat);
}

#[test]
fn test_wrong_secret_rejected() {
    let manager = JwtManager::new(SECRET, 24);
    let other = JwtManager::new("another-secret", 24);

    let token = manager
        .create_token(Uuid::new_v4(), None, "member")
        .unwrap();
    let err = other.verify_token(&token).unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
}

#[test]
fn test_expired_token_rejected() {
    let manager = JwtManager::new(SECRET, 24);
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = Claims {
        sub: Uuid::new_v4(),
        email: None,
        role: "member".to_string(),
        exp: now - 3600,
        iat: now - 7200,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    let err = manager.verify_token(&token).unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
}

#[test]
fn test_garbage_token_rejected() {
    let manager = JwtManager::new(SECRET, 24);
    assert!(manager.verify_token("not.a.token").is_err());
    assert!(manager.verify_token("").is_err());
}

#[test]
fn test_admin_role_check() {
    let admin = AuthUser {
        user_id: Uuid::new_v4(),
        email: None,
        role: "admin".to_string(),
    };
    assert!(admin.require_admin().is_ok());

    let member = AuthUser {
        user_id: Uuid::new_v4(),
        email: None,
        role: "member".to_string(),
    };
    assert!(matches!(
        member.require_admin().unwrap_err(),
        ApiError::Forbidden
    ));
}
