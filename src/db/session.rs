//! Session rows and the SQLite implementation of the backend contract.
//!
//! A session row holds the JTI of the only refresh token currently allowed to
//! rotate it. Rotation is a conditional update on that JTI, so two concurrent
//! refreshes with the same token cannot both succeed. Rotated JTIs are kept
//! in `consumed_refresh_tokens` until they expire, to recognise replays.

use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::sqlite::SqlitePool;
use tracing::warn;

use super::Database;
use crate::backend::SessionBackend;
use crate::codec::unix_now;
use crate::error::SessionError;
use crate::handshake::HandshakeInfo;
use crate::session::{IssuedSession, JwtPayload, PayloadUpdate, Session};

/// A stored session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub session_handle: String,
    pub user_id: String,
    pub payload: JwtPayload,
    pub refresh_jti: String,
    pub anti_csrf: Option<String>,
    /// Unix seconds
    pub expires_at: u64,
}

impl SessionRow {
    fn to_session(&self) -> Session {
        Session {
            user_id: self.user_id.clone(),
            session_handle: self.session_handle.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RawSessionRow {
    session_handle: String,
    user_id: String,
    payload: String,
    refresh_jti: String,
    anti_csrf: Option<String>,
    expires_at: i64,
}

impl TryFrom<RawSessionRow> for SessionRow {
    type Error = sqlx::Error;

    fn try_from(row: RawSessionRow) -> Result<Self, Self::Error> {
        let payload =
            JwtPayload::from_json_str(&row.payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            session_handle: row.session_handle,
            user_id: row.user_id,
            payload,
            refresh_jti: row.refresh_jti,
            anti_csrf: row.anti_csrf,
            expires_at: row.expires_at.max(0) as u64,
        })
    }
}

/// Store for session rows and consumed refresh tokens.
pub struct SessionTable {
    pool: SqlitePool,
}

impl SessionTable {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, row: &SessionRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (session_handle, user_id, payload, refresh_jti, anti_csrf, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.session_handle)
        .bind(&row.user_id)
        .bind(row.payload.to_json_string())
        .bind(&row.refresh_jti)
        .bind(&row.anti_csrf)
        .bind(row.expires_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a session that has not expired at `now`.
    pub async fn get(&self, session_handle: &str, now: u64) -> Result<Option<SessionRow>, sqlx::Error> {
        let row: Option<RawSessionRow> = sqlx::query_as(
            "SELECT session_handle, user_id, payload, refresh_jti, anti_csrf, expires_at FROM sessions WHERE session_handle = ? AND expires_at > ?",
        )
        .bind(session_handle)
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::try_from).transpose()
    }

    /// Session handle a rotated refresh token belonged to, if it was rotated.
    pub async fn consumed_owner(&self, jti: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_handle FROM consumed_refresh_tokens WHERE jti = ?")
                .bind(jti)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    /// Swap the session's refresh JTI from `old_jti` to `new_jti`.
    /// Returns false if `old_jti` is no longer the current one.
    ///
    /// The conditional update is the first statement of the transaction, so
    /// the write lock is taken before anything is read and concurrent
    /// rotations queue on the busy timeout instead of failing.
    pub async fn rotate(
        &self,
        session_handle: &str,
        old_jti: &str,
        new_jti: &str,
        anti_csrf: Option<&str>,
        expires_at: u64,
        now: u64,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE sessions SET refresh_jti = ?, anti_csrf = ?, expires_at = ?
             WHERE session_handle = ? AND refresh_jti = ? AND expires_at > ?",
        )
        .bind(new_jti)
        .bind(anti_csrf)
        .bind(expires_at as i64)
        .bind(session_handle)
        .bind(old_jti)
        .bind(now as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // The old token never outlives the session it rotated.
        sqlx::query(
            "INSERT INTO consumed_refresh_tokens (jti, session_handle, expires_at) VALUES (?, ?, ?)",
        )
        .bind(old_jti)
        .bind(session_handle)
        .bind(expires_at as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Replace the payload of a live session. Returns false if there is none.
    pub async fn update_payload(
        &self,
        session_handle: &str,
        payload: &JwtPayload,
        now: u64,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE sessions SET payload = ? WHERE session_handle = ? AND expires_at > ?")
                .bind(payload.to_json_string())
                .bind(session_handle)
                .bind(now as i64)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a session and its consumed tokens.
    pub async fn delete(&self, session_handle: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM consumed_refresh_tokens WHERE session_handle = ?")
            .bind(session_handle)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE session_handle = ?")
            .bind(session_handle)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every session of a user (logout everywhere).
    pub async fn delete_all_by_user(&self, user_id: &str) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM consumed_refresh_tokens WHERE session_handle IN
             (SELECT session_handle FROM sessions WHERE user_id = ?)",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Delete expired sessions and consumed tokens. Returns the number of sessions removed.
    pub async fn delete_expired(&self, now: u64) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM consumed_refresh_tokens WHERE expires_at <= ?")
            .bind(now as i64)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

impl Database {
    async fn theft_detected(
        &self,
        session_handle: String,
        claimed_user: String,
    ) -> Result<IssuedSession, SessionError> {
        let sessions = self.sessions();
        let user_id = sessions
            .get(&session_handle, 0)
            .await?
            .map(|row| row.user_id)
            .unwrap_or(claimed_user);
        sessions.delete(&session_handle).await?;
        warn!(session = %session_handle, "Rotated refresh token presented again");
        Err(SessionError::TokenTheftDetected {
            session_handle,
            user_id,
        })
    }
}

impl SessionBackend for Database {
    fn fetch_handshake_info(&self) -> BoxFuture<'_, Result<HandshakeInfo, SessionError>> {
        async move {
            // Surfaces an unreachable database as BackendUnavailable.
            sqlx::query("SELECT 1").execute(self.pool()).await?;
            Ok(self.settings().handshake_info())
        }
        .boxed()
    }

    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>> {
        async move {
            let session = Session {
                user_id: user_id.to_string(),
                session_handle: uuid::Uuid::new_v4().to_string(),
                payload: payload.clone(),
            };
            let issued = self.settings().issue_tokens(&session, unix_now())?;

            self.sessions()
                .insert(&SessionRow {
                    session_handle: session.session_handle.clone(),
                    user_id: session.user_id.clone(),
                    payload: session.payload.clone(),
                    refresh_jti: issued.refresh_jti,
                    anti_csrf: issued.pair.anti_csrf_token.clone(),
                    expires_at: issued.expires_at,
                })
                .await?;

            Ok(IssuedSession {
                tokens: issued.pair,
                session,
            })
        }
        .boxed()
    }

    fn validate_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<Session, SessionError>> {
        async move {
            self.sessions()
                .get(session_handle, unix_now())
                .await?
                .map(|row| row.to_session())
                .ok_or(SessionError::SessionNotFound)
        }
        .boxed()
    }

    fn refresh_session<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>> {
        async move {
            let now = unix_now();
            let claims = self
                .settings()
                .codec()
                .decode_refresh(refresh_token, now)
                .map_err(|_| SessionError::unauthorized("Invalid refresh token"))?;

            let sessions = self.sessions();
            if let Some(owner) = sessions.consumed_owner(&claims.jti).await? {
                return self.theft_detected(owner, claims.sub).await;
            }

            let row = sessions
                .get(&claims.sid, now)
                .await?
                .filter(|row| row.refresh_jti == claims.jti)
                .ok_or_else(|| SessionError::unauthorized("Refresh token is no longer valid"))?;

            let session = row.to_session();
            let issued = self.settings().issue_tokens(&session, now)?;

            let rotated = sessions
                .rotate(
                    &claims.sid,
                    &claims.jti,
                    &issued.refresh_jti,
                    issued.pair.anti_csrf_token.as_deref(),
                    issued.expires_at,
                    now,
                )
                .await?;

            if !rotated {
                // Lost the race against a concurrent refresh with the same token.
                if let Some(owner) = sessions.consumed_owner(&claims.jti).await? {
                    return self.theft_detected(owner, claims.sub).await;
                }
                return Err(SessionError::unauthorized("Refresh token is no longer valid"));
            }

            Ok(IssuedSession {
                tokens: issued.pair,
                session,
            })
        }
        .boxed()
    }

    fn revoke_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<bool, SessionError>> {
        async move { Ok(self.sessions().delete(session_handle).await?) }.boxed()
    }

    fn revoke_all_sessions_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<usize, SessionError>> {
        async move { Ok(self.sessions().delete_all_by_user(user_id).await? as usize) }.boxed()
    }

    fn update_payload<'a>(
        &'a self,
        session_handle: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<PayloadUpdate, SessionError>> {
        async move {
            let now = unix_now();
            let sessions = self.sessions();
            if !sessions.update_payload(session_handle, payload, now).await? {
                return Err(SessionError::SessionNotFound);
            }
            let row = sessions
                .get(session_handle, now)
                .await?
                .ok_or(SessionError::SessionNotFound)?;

            let session = row.to_session();
            let access_token =
                self.settings()
                    .issue_access_token(&session, row.anti_csrf.clone(), now)?;

            Ok(PayloadUpdate {
                session,
                access_token,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSettings;

    async fn database() -> Database {
        Database::open(
            ":memory:",
            BackendSettings::new(b"test-secret-key-for-testing".to_vec()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_validate_session() {
        let db = database().await;
        let payload = JwtPayload::new().with("role", "admin");

        let issued = db.create_session("alice", &payload).await.unwrap();
        let session = db
            .validate_session(&issued.session.session_handle)
            .await
            .unwrap();

        assert_eq!(session.user_id, "alice");
        assert_eq!(session.payload, payload);
        assert_eq!(db.sessions().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rotation_and_reuse() {
        let db = database().await;
        let issued = db.create_session("alice", &JwtPayload::new()).await.unwrap();

        let rotated = db
            .refresh_session(&issued.tokens.refresh_token)
            .await
            .unwrap();
        assert_eq!(rotated.session.session_handle, issued.session.session_handle);

        let replay = db.refresh_session(&issued.tokens.refresh_token).await;
        assert!(matches!(
            replay,
            Err(SessionError::TokenTheftDetected { ref user_id, .. }) if user_id == "alice"
        ));
        assert_eq!(db.sessions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rotate_requires_current_jti() {
        let db = database().await;
        let now = unix_now();
        let sessions = db.sessions();
        sessions
            .insert(&SessionRow {
                session_handle: "h1".to_string(),
                user_id: "alice".to_string(),
                payload: JwtPayload::new(),
                refresh_jti: "jti-1".to_string(),
                anti_csrf: None,
                expires_at: now + 60,
            })
            .await
            .unwrap();

        assert!(sessions.rotate("h1", "jti-1", "jti-2", None, now + 60, now).await.unwrap());
        assert!(!sessions.rotate("h1", "jti-1", "jti-3", None, now + 60, now).await.unwrap());
        assert_eq!(
            sessions.consumed_owner("jti-1").await.unwrap().as_deref(),
            Some("h1")
        );
    }

    #[tokio::test]
    async fn test_update_payload_reissues_access_token() {
        let db = database().await;
        let issued = db.create_session("alice", &JwtPayload::new()).await.unwrap();
        let handle = issued.session.session_handle;
        let payload = JwtPayload::new().with("n", 2);

        let update = db.update_payload(&handle, &payload).await.unwrap();
        assert_eq!(update.session.payload, payload);

        let claims = db
            .settings()
            .codec()
            .decode_access(&update.access_token, unix_now())
            .unwrap();
        assert_eq!(claims.payload, payload);

        db.revoke_session(&handle).await.unwrap();
        assert_eq!(
            db.update_payload(&handle, &payload).await.unwrap_err(),
            SessionError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_revoke_all_and_delete_expired() {
        let db = database().await;
        db.create_session("alice", &JwtPayload::new()).await.unwrap();
        db.create_session("alice", &JwtPayload::new()).await.unwrap();
        db.create_session("bob", &JwtPayload::new()).await.unwrap();

        assert_eq!(db.revoke_all_sessions_for_user("alice").await.unwrap(), 2);
        assert_eq!(db.revoke_all_sessions_for_user("alice").await.unwrap(), 0);
        assert_eq!(db.sessions().count().await.unwrap(), 1);

        let far_future = unix_now() + 1000 * 24 * 60 * 60;
        assert_eq!(db.sessions().delete_expired(far_future).await.unwrap(), 1);
        assert_eq!(db.sessions().count().await.unwrap(), 0);
    }
}
