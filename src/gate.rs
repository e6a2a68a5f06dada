//! The gate service: HTTP/JSON front door for account flows.
//!
//! Four routes cover the account lifecycle: request a verification code,
//! register, reset a password, and log in (which also asks the status
//! service for a chat-server placement). Every reply is a JSON object whose
//! `error` field carries the service-level code; transport-level failures of
//! the backends map to `RpcFailed` rather than HTTP errors, so clients read
//! one error channel.

use crate::cache::Cache;
use crate::config::GateConfig;
use crate::rpc::{StatusClient, VerifyClient};
use crate::store::Store;
use crate::ErrorCode;
use rocket::serde::json::Json;
use rocket::{post, routes, State};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Backends every gate route reaches for.
pub struct GateState {
    pub store: Store,
    pub cache: Cache,
    pub status: StatusClient,
    pub verify: VerifyClient,
}

#[derive(Debug, Deserialize)]
struct VerifyCodeBody {
    email: String,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    user: String,
    email: String,
    passwd: String,
    confirm: String,
    varifycode: String,
}

#[derive(Debug, Deserialize)]
struct ResetBody {
    email: String,
    user: String,
    passwd: String,
    varifycode: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    passwd: String,
}

fn err_json(code: ErrorCode) -> Json<Value> {
    Json(json!({ "error": code as i32 }))
}

/// Parse a request body, mapping malformed JSON to the dedicated code.
fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, Json<Value>> {
    serde_json::from_str(body).map_err(|err| {
        warn!(%err, "malformed request body");
        err_json(ErrorCode::JsonParse)
    })
}

/// Compare the supplied verification code against the cached one.
async fn check_code(cache: &Cache, email: &str, supplied: &str) -> Result<(), Json<Value>> {
    match cache.verify_code(email).await {
        Ok(Some(code)) if code == supplied => Ok(()),
        Ok(Some(_)) => Err(err_json(ErrorCode::VerifyCodeErr)),
        Ok(None) => Err(err_json(ErrorCode::VerifyExpired)),
        Err(err) => {
            warn!(%err, "verification code lookup failed");
            Err(err_json(ErrorCode::RpcFailed))
        }
    }
}

#[post("/get_verifycode", data = "<body>")]
async fn get_verifycode(state: &State<GateState>, body: String) -> Json<Value> {
    let req: VerifyCodeBody = match parse_body(&body) {
        Ok(req) => req,
        Err(reply) => return reply,
    };

    match state.verify.get_verify_code(&req.email).await {
        Ok(code) => Json(json!({ "error": code, "email": req.email })),
        Err(err) => {
            warn!(%err, "verify service unreachable");
            Json(json!({ "error": ErrorCode::RpcFailed as i32, "email": req.email }))
        }
    }
}

#[post("/user_register", data = "<body>")]
async fn user_register(state: &State<GateState>, body: String) -> Json<Value> {
    let req: RegisterBody = match parse_body(&body) {
        Ok(req) => req,
        Err(reply) => return reply,
    };
    if req.passwd != req.confirm {
        return err_json(ErrorCode::PasswdErr);
    }
    if let Err(reply) = check_code(&state.cache, &req.email, &req.varifycode).await {
        return reply;
    }

    match state.store.register_user(&req.user, &req.email, &req.passwd).await {
        Ok(Some(uid)) => {
            info!(uid, user = req.user.as_str(), "user registered");
            Json(json!({
                "error": ErrorCode::Success as i32,
                "uid": uid,
                "user": req.user,
                "email": req.email,
            }))
        }
        Ok(None) => err_json(ErrorCode::UserExist),
        Err(err) => {
            warn!(%err, "registration failed");
            err_json(ErrorCode::RpcFailed)
        }
    }
}

#[post("/reset_pwd", data = "<body>")]
async fn reset_pwd(state: &State<GateState>, body: String) -> Json<Value> {
    let req: ResetBody = match parse_body(&body) {
        Ok(req) => req,
        Err(reply) => return reply,
    };
    if let Err(reply) = check_code(&state.cache, &req.email, &req.varifycode).await {
        return reply;
    }

    match state.store.check_email(&req.user, &req.email).await {
        Ok(true) => {}
        Ok(false) => return err_json(ErrorCode::EmailNotMatch),
        Err(err) => {
            warn!(%err, "email check failed");
            return err_json(ErrorCode::RpcFailed);
        }
    }

    match state.store.update_password(&req.email, &req.passwd).await {
        Ok(true) => {
            info!(user = req.user.as_str(), "password reset");
            Json(json!({ "error": ErrorCode::Success as i32, "email": req.email }))
        }
        Ok(false) => err_json(ErrorCode::PasswdUpdateFailed),
        Err(err) => {
            warn!(%err, "password update failed");
            err_json(ErrorCode::PasswdUpdateFailed)
        }
    }
}

#[post("/user_login", data = "<body>")]
async fn user_login(state: &State<GateState>, body: String) -> Json<Value> {
    let req: LoginBody = match parse_body(&body) {
        Ok(req) => req,
        Err(reply) => return reply,
    };

    let user = match state.store.check_password(&req.email, &req.passwd).await {
        Ok(Some(user)) => user,
        Ok(None) => return err_json(ErrorCode::PasswdErr),
        Err(err) => {
            warn!(%err, "credential check failed");
            return err_json(ErrorCode::RpcFailed);
        }
    };

    match state.status.get_chat_server(user.uid).await {
        Ok(placement) => {
            info!(uid = user.uid, "login placed");
            Json(json!({
                "error": ErrorCode::Success as i32,
                "uid": user.uid,
                "email": user.email,
                "token": placement.token,
                "host": placement.host,
                "port": placement.port,
            }))
        }
        Err(err) => {
            warn!(%err, "placement failed");
            err_json(ErrorCode::RpcFailed)
        }
    }
}

/// Run the gate until its own shutdown signal (rocket handles SIGINT).
pub async fn run(cfg: &GateConfig, state: GateState) -> anyhow::Result<()> {
    let figment = rocket::Config::figment()
        .merge(("address", cfg.host.clone()))
        .merge(("port", cfg.port));

    let _ = rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![get_verifycode, user_register, reset_pwd, user_login],
        )
        .launch()
        .await?;
    Ok(())
}
