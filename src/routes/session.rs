use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::rides::UserType;
use crate::lifecycle::Session;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    sub: Uuid,         // user_id
    user_type: String, // parent | driver
    exp: i64,          // expiration timestamp
    iat: i64,          // issued at timestamp
}

// Session validation. Who mints production tokens is someone else's problem
// (the identity provider is an external service); this service only checks
// them and extracts the caller.
pub struct SessionService {
    jwt_secret: String,
}

impl SessionService {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn verify_token(&self, token: &str) -> Result<Session, Box<dyn std::error::Error>> {
        let mut validation = jsonwebtoken::Validation::default();

        validation.leeway = 10;
        validation.validate_exp = true;
        validation.algorithms = vec![jsonwebtoken::Algorithm::HS256];

        let token_data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|err| {
            tracing::error!("Error decoding token: {:?}", err);
            "Invalid token"
        })?;

        let user_type = UserType::parse(&token_data.claims.user_type)
            .ok_or("Invalid token: unknown user type")?;
        Ok(Session {
            user_id: token_data.claims.sub,
            user_type,
        })
    }

    /// HS256 token carrying `{sub, user_type}`. Used by operators and tests.
    pub fn issue_token(
        &self,
        user_id: Uuid,
        user_type: UserType,
        ttl: Duration,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            user_type: user_type.as_str().to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_back_to_the_same_session() {
        let service = SessionService::new("test-secret".to_string());
        let user = Uuid::new_v4();
        let token = service
            .issue_token(user, UserType::Driver, Duration::from_secs(900))
            .unwrap();
        let session = service.verify_token(&token).unwrap();
        assert_eq!(session.user_id, user);
        assert_eq!(session.user_type, UserType::Driver);
    }

    #[test]
    fn token_from_another_secret_is_rejected() {
        let service = SessionService::new("test-secret".to_string());
        let other = SessionService::new("other-secret".to_string());
        let token = other
            .issue_token(Uuid::new_v4(), UserType::Parent, Duration::from_secs(900))
            .unwrap();
        assert!(service.verify_token(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = SessionService::new("test-secret".to_string());
        // clearly past the 10s leeway
        let claims = Claims {
            sub: Uuid::new_v4(),
            user_type: "parent".to_string(),
            exp: (Utc::now() - chrono::Duration::hours(1)).timestamp(),
            iat: (Utc::now() - chrono::Duration::hours(2)).timestamp(),
        };
        let stale = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret("test-secret".as_bytes()),
        )
        .unwrap();
        assert!(service.verify_token(&stale).is_err());
    }
}
