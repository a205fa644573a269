//! Auth endpoints and account types.
//!
//! `AuthApi` drives the credential store lifecycle: logins store the issued
//! credentials, a successful refresh stores the renewed pair, and logout
//! clears everything.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{ApiClient, ApiError};

/// Platform account record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub role: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwtLoginRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_me: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwtLoginResponse {
    pub user: User,
    pub token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LdapLoginRequest {
    pub username: String,
    pub password: String,
    pub domain: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LdapLoginResponse {
    pub user: User,
    pub token: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest {
    token: String,
    new_password: String,
}

/// Borrowed view over [`ApiClient`] exposing the auth endpoints.
pub struct AuthApi<'a> {
    client: &'a ApiClient,
}

impl ApiClient {
    /// Returns the auth endpoint helpers.
    pub fn auth(&self) -> AuthApi<'_> {
        AuthApi { client: self }
    }
}

impl AuthApi<'_> {
    /// Logs in with email and password, storing the issued JWT pair.
    pub async fn jwt_login(
        &self,
        request: &JwtLoginRequest,
    ) -> Result<JwtLoginResponse, ApiError> {
        let response: JwtLoginResponse = self.client.post("/auth/jwt/login", request).await?;
        self.client.credentials().set_jwt(
            SecretString::new(response.token.clone()),
            SecretString::new(response.refresh_token.clone()),
        )?;
        Ok(response)
    }

    /// Logs in against the directory service, storing the session pair.
    pub async fn ldap_login(
        &self,
        request: &LdapLoginRequest,
    ) -> Result<LdapLoginResponse, ApiError> {
        let response: LdapLoginResponse = self.client.post("/auth/ldap/login", request).await?;
        self.client.credentials().set_session(
            SecretString::new(response.token.clone()),
            response.session_id.clone(),
        )?;
        Ok(response)
    }

    /// Exchanges a refresh token for a new pair and stores it.
    pub async fn refresh_token(
        &self,
        request: &RefreshTokenRequest,
    ) -> Result<RefreshTokenResponse, ApiError> {
        let response: RefreshTokenResponse =
            self.client.post("/auth/refresh-token", request).await?;
        self.client.credentials().set_jwt(
            SecretString::new(response.token.clone()),
            SecretString::new(response.refresh_token.clone()),
        )?;
        Ok(response)
    }

    /// Creates a new account.
    pub async fn register(&self, request: &RegisterRequest) -> Result<User, ApiError> {
        self.client.post("/auth/register", request).await
    }

    /// Logs out server-side, then clears the stored credentials.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let _: Value = self.client.post_empty("/auth/logout").await?;
        self.client.credentials().clear()?;
        Ok(())
    }

    /// Fetches the currently authenticated account.
    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.client.get("/auth/me").await
    }

    /// Changes the account password.
    pub async fn change_password(
        &self,
        old_password: impl Into<String>,
        new_password: impl Into<String>,
    ) -> Result<(), ApiError> {
        let request = ChangePasswordRequest {
            old_password: old_password.into(),
            new_password: new_password.into(),
        };
        let _: Value = self.client.post("/auth/change-password", &request).await?;
        Ok(())
    }

    /// Requests a password reset email.
    pub async fn request_password_reset(
        &self,
        email: impl Into<String>,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({ "email": email.into() });
        let _: Value = self.client.post("/auth/forgot-password", &body).await?;
        Ok(())
    }

    /// Completes a password reset with the emailed token.
    pub async fn reset_password(
        &self,
        token: impl Into<String>,
        new_password: impl Into<String>,
    ) -> Result<(), ApiError> {
        let request = ResetPasswordRequest {
            token: token.into(),
            new_password: new_password.into(),
        };
        let _: Value = self.client.post("/auth/reset-password", &request).await?;
        Ok(())
    }

    /// Checks whether the stored token or session is still valid.
    pub async fn verify(&self) -> bool {
        self.client.get::<Value>("/auth/verify").await.is_ok()
    }
}
