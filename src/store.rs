//! Typed data access over pooled database connections.
//!
//! The pool holds raw [`PgConnection`] handles; liveness probing and
//! replacement are the pool's maintenance job. Every operation borrows a
//! handle for its own duration only, so a slow query never pins the pool.

use crate::config::DbConfig;
use crate::pool::{Manager, Pool};
use crate::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{Connection as _, PgConnection, Row};
use std::time::Duration;
use tracing::{debug, instrument};

/// Pending friend requests a single target may accumulate.
const MAX_PENDING_APPLIES: i64 = 64;

/// Cadence of the connection-pool maintenance pass.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

/// A persistent user record.
///
/// `uid` and `name` are each unique on their own.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: i64,
    pub name: String,
    pub email: String,
    /// Hex SHA-256 digest; never leaves the process.
    #[serde(skip_serializing)]
    pub pwd: String,
    pub nick: String,
    pub desc: String,
    pub sex: i32,
    pub icon: String,
}

/// A pending friend request, joined with the applicant's profile.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyInfo {
    pub uid: i64,
    pub name: String,
    pub desc: String,
    pub icon: String,
    pub nick: String,
    pub sex: i32,
    /// 0 pending, 1 accepted, 2 rejected.
    pub status: i16,
}

/// Result of persisting a friend apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Stored,
    /// The target already has the maximum number of pending applies.
    CapExceeded,
}

/// Opens and probes database handles for the pool.
#[derive(Debug)]
pub struct PgManager {
    url: String,
}

impl Manager for PgManager {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        Ok(PgConnection::connect(&self.url).await?)
    }

    async fn check(&self, conn: &mut PgConnection) -> Result<()> {
        Ok(conn.ping().await?)
    }
}

/// The data-access layer: registration, credentials, friends.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<PgManager>,
}

impl Store {
    /// Open the pool eagerly and start its maintenance pass.
    pub async fn connect(cfg: &DbConfig) -> Result<Store> {
        let manager = PgManager { url: cfg.url() };
        let pool = Pool::connect(manager, cfg.pool_size).await?;
        pool.spawn_maintenance(MAINTENANCE_PERIOD);
        Ok(Store { pool })
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Create a user. Returns the fresh uid, or `None` when the name or
    /// email is already taken.
    #[instrument(skip(self, pwd))]
    pub async fn register_user(&self, name: &str, email: &str, pwd: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        let inserted = sqlx::query(
            r#"insert into users (name, email, pwd, nick, "desc", sex, icon)
               values ($1, $2, $3, $1, '', 0, '')
               returning uid"#,
        )
        .bind(name)
        .bind(email)
        .bind(hash_password(pwd))
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(row) => Ok(Some(row.try_get("uid")?)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `email` is the one on file for `name`.
    pub async fn check_email(&self, name: &str, email: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("select email from users where name = $1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row
            .map(|r| r.try_get::<String, _>("email"))
            .transpose()?
            .is_some_and(|stored| stored == email))
    }

    /// Replace the password for `email`. False when no such user exists.
    #[instrument(skip(self, pwd))]
    pub async fn update_password(&self, email: &str, pwd: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let done = sqlx::query("update users set pwd = $2 where email = $1")
            .bind(email)
            .bind(hash_password(pwd))
            .execute(&mut *conn)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Verify credentials; the profile comes back on a match.
    #[instrument(skip(self, pwd))]
    pub async fn check_password(&self, email: &str, pwd: &str) -> Result<Option<UserInfo>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(SELECT_USER_BY_EMAIL)
            .bind(email)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let user = user_from_row(&row)?;
        if user.pwd == hash_password(pwd) {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    pub async fn user_by_uid(&self, uid: i64) -> Result<Option<UserInfo>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(SELECT_USER_BY_UID)
            .bind(uid)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn user_by_name(&self, name: &str) -> Result<Option<UserInfo>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(SELECT_USER_BY_NAME)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Persist a pending apply from `from` to `to`.
    ///
    /// Re-applying while a pending row exists is a no-op; the pending cap is
    /// counted against the target.
    #[instrument(skip(self))]
    pub async fn add_friend_apply(&self, from: i64, to: i64) -> Result<ApplyOutcome> {
        let mut conn = self.pool.acquire().await?;

        let pending: i64 =
            sqlx::query("select count(*) as n from friend_apply where to_uid = $1 and status = 0")
                .bind(to)
                .fetch_one(&mut *conn)
                .await?
                .try_get("n")?;
        if pending >= MAX_PENDING_APPLIES {
            return Ok(ApplyOutcome::CapExceeded);
        }

        sqlx::query(
            "insert into friend_apply (from_uid, to_uid, status) values ($1, $2, 0)
             on conflict (from_uid, to_uid) do nothing",
        )
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await?;
        Ok(ApplyOutcome::Stored)
    }

    /// Applies addressed to `to_uid`, newest first, applicant profile joined in.
    pub async fn apply_list(&self, to_uid: i64) -> Result<Vec<ApplyInfo>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"select u.uid, u.name, u."desc", u.icon, u.nick, u.sex, a.status
               from friend_apply a join users u on u.uid = a.from_uid
               where a.to_uid = $1
               order by a.created_at desc"#,
        )
        .bind(to_uid)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ApplyInfo {
                    uid: row.try_get("uid")?,
                    name: row.try_get("name")?,
                    desc: row.try_get("desc")?,
                    icon: row.try_get("icon")?,
                    nick: row.try_get("nick")?,
                    sex: row.try_get("sex")?,
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }

    /// Accept an apply: mark it, record the friendship both ways.
    #[instrument(skip(self))]
    pub async fn confirm_friend_apply(&self, from: i64, to: i64, back_name: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        sqlx::query("update friend_apply set status = 1 where from_uid = $1 and to_uid = $2")
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "insert into friend (self_uid, friend_uid, back_name) values ($1, $2, $3)
             on conflict (self_uid, friend_uid) do nothing",
        )
        .bind(to)
        .bind(from)
        .bind(back_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "insert into friend (self_uid, friend_uid, back_name) values ($1, $2, '')
             on conflict (self_uid, friend_uid) do nothing",
        )
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(from, to, "friendship confirmed");
        Ok(())
    }

    pub async fn friend_list(&self, self_uid: i64) -> Result<Vec<UserInfo>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"select u.uid, u.name, u.email, u.pwd, u.nick, u."desc", u.sex, u.icon
               from friend f join users u on u.uid = f.friend_uid
               where f.self_uid = $1"#,
        )
        .bind(self_uid)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    /// Keep a chat payload for an offline addressee.
    pub async fn save_offline_message(
        &self,
        from: i64,
        to: i64,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("insert into chat_message (from_uid, to_uid, payload) values ($1, $2, $3)")
            .bind(from)
            .bind(to)
            .bind(payload.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

const SELECT_USER_BY_EMAIL: &str =
    r#"select uid, name, email, pwd, nick, "desc", sex, icon from users where email = $1"#;
const SELECT_USER_BY_UID: &str =
    r#"select uid, name, email, pwd, nick, "desc", sex, icon from users where uid = $1"#;
const SELECT_USER_BY_NAME: &str =
    r#"select uid, name, email, pwd, nick, "desc", sex, icon from users where name = $1"#;

fn user_from_row(row: &PgRow) -> Result<UserInfo> {
    Ok(UserInfo {
        uid: row.try_get("uid")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        pwd: row.try_get("pwd")?,
        nick: row.try_get("nick")?,
        desc: row.try_get("desc")?,
        sex: row.try_get("sex")?,
        icon: row.try_get("icon")?,
    })
}

pub(crate) fn hash_password(pwd: &str) -> String {
    hex::encode(Sha256::digest(pwd.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_digest_is_stable_hex() {
        let a = hash_password("hunter2");
        let b = hash_password("hunter2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(hash_password("hunter3"), a);
    }

    #[test]
    fn test_profile_serialization_hides_password() {
        let user = UserInfo {
            uid: 1001,
            name: "alice".into(),
            email: "alice@example.com".into(),
            pwd: hash_password("hunter2"),
            nick: "al".into(),
            desc: String::new(),
            sex: 0,
            icon: String::new(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["uid"], 1001);
        assert!(json.get("pwd").is_none());
    }
}
