//! JSON RPC over HTTP. Every call is a `POST /` carrying `{id, method, params}`.
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_actix_web::TracingLogger;

use crate::{
    engine::Engine,
    error::{Error, RequestErrorKind},
};

/// Status carried by every error object. Errors are reported in the body of an HTTP 200 response.
pub const ERROR_STATUS: u16 = 202;

#[derive(Debug, Clone, Deserialize)]
pub struct Call {
    #[serde(default)]
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorObject {
    pub status: u16,
    pub code: u32,
    pub description: String,
}

impl From<&Error> for ErrorObject {
    fn from(err: &Error) -> Self {
        Self {
            status: ERROR_STATUS,
            code: err.code(),
            description: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

/// Binds the RPC server on `0.0.0.0:port` and serves until the process is stopped.
pub async fn serve(engine: Arc<Engine>, port: u16) -> std::io::Result<()> {
    let engine = web::Data::from(engine);
    tracing::info!("RPC server listening on 0.0.0.0:{}", port);
    HttpServer::new(move || {
        let cors = Cors::permissive();
        App::new()
            .wrap(TracingLogger::default())
            .wrap(cors)
            .app_data(engine.clone())
            .configure(configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

/// Registers the RPC endpoint and the JSON not-found fallback. Expects `web::Data<Engine>` in the app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::post().to(handle))
        .default_service(web::to(not_found));
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(json!({"error": "not found"}))
}

async fn handle(engine: web::Data<Engine>, body: web::Bytes) -> HttpResponse {
    let call: Call = match serde_json::from_slice(&body) {
        Ok(call) => call,
        Err(err) => {
            return HttpResponse::BadRequest().json(json!({"error": err.to_string()}));
        }
    };
    tracing::debug!("RPC call {} {} {:?}", call.id, call.method, call.params);

    let reply = match dispatch(&engine, &call).await {
        Ok(data) => Reply {
            id: call.id,
            data: Some(data),
            error: None,
        },
        Err(err) => {
            tracing::warn!("RPC call {} {} failed: {}", call.id, call.method, err);
            Reply {
                id: call.id,
                data: None,
                error: Some(ErrorObject::from(&err)),
            }
        }
    };
    HttpResponse::Ok().json(reply)
}

async fn dispatch(engine: &Engine, call: &Call) -> Result<Value, Error> {
    let params = call.params.as_slice();
    let router = engine.router();
    match call.method.as_str() {
        "info" => {
            expect_count(params, 0)?;
            Ok(serde_json::to_value(engine.info())?)
        }
        "list" => {
            expect_count(params, 1)?;
            let rid = string_param(params, 0, "rid")?;
            let peers = router.list(rid).await?;
            Ok(json!({ "peers": peers }))
        }
        "publish" => {
            if params.len() < 3 || params.len() > 4 {
                return Err(invalid_count(params));
            }
            let rid = string_param(params, 0, "rid")?;
            let uid = string_param(params, 1, "uid")?;
            let sdp = string_param(params, 2, "sdp")?;
            let limit = match params.get(3) {
                Some(limit) => limit_param(limit)?,
                None => 0,
            };
            let (track, answer) = router.publish(rid, uid, sdp, limit).await?;
            Ok(json!({
                "track": track,
                "sdp": answer.sdp,
                "jsep": serde_json::to_value(&answer)?,
            }))
        }
        "trickle" => {
            expect_count(params, 4)?;
            let (rid, uid, cid) = session_params(params)?;
            let candidate = string_param(params, 3, "candidate")?;
            router.trickle(rid, uid, cid, candidate).await?;
            Ok(json!({}))
        }
        "subscribe" => {
            expect_count(params, 3)?;
            let (rid, uid, cid) = session_params(params)?;
            match router.subscribe(rid, uid, cid).await? {
                Some(offer) => Ok(json!({
                    "type": offer.sdp_type.to_string(),
                    "sdp": offer.sdp,
                    "jsep": serde_json::to_value(&offer)?,
                })),
                None => Ok(json!({})),
            }
        }
        "answer" => {
            expect_count(params, 4)?;
            let (rid, uid, cid) = session_params(params)?;
            let sdp = string_param(params, 3, "sdp")?;
            router.answer(rid, uid, cid, sdp).await?;
            Ok(json!({}))
        }
        "turn" => {
            expect_count(params, 1)?;
            let uid = string_param(params, 0, "uid")?;
            Ok(serde_json::to_value(engine.turn(uid)?)?)
        }
        method => Err(Error::new_request(
            format!("invalid method {}", method),
            RequestErrorKind::InvalidMethodError,
        )),
    }
}

fn invalid_count(params: &[Value]) -> Error {
    Error::new_request(
        format!("invalid params count {}", params.len()),
        RequestErrorKind::InvalidParamsError,
    )
}

fn expect_count(params: &[Value], count: usize) -> Result<(), Error> {
    if params.len() != count {
        return Err(invalid_count(params));
    }
    Ok(())
}

fn string_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, Error> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::new_request(
                format!("invalid {} type {:?}", name, params.get(index)),
                RequestErrorKind::InvalidParamsError,
            )
        })
}

fn session_params(params: &[Value]) -> Result<(&str, &str, &str), Error> {
    Ok((
        string_param(params, 0, "rid")?,
        string_param(params, 1, "uid")?,
        string_param(params, 2, "cid")?,
    ))
}

/// Accepts an integer or a decimal string. Zero and negative values mean unlimited.
fn limit_param(value: &Value) -> Result<usize, Error> {
    let limit = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    match limit {
        Some(limit) => Ok(usize::try_from(limit).unwrap_or(0)),
        None => Err(Error::new_request(
            format!("invalid limit type {}", value),
            RequestErrorKind::InvalidParamsError,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PeerConfig, TurnConfig},
        error::{CODE_INVALID_PARAMS, CODE_INVALID_SDP, CODE_ROOM_FULL, CODE_TRACK_NOT_FOUND},
        signaling::sdp::tests::description_json,
        transport::mock::MockConnector,
    };
    use actix_web::{http::StatusCode, test as actix_test};

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::with_connector(
            "lo".to_owned(),
            "127.0.0.1".to_owned(),
            Arc::new(MockConnector::default()),
            PeerConfig::default(),
            TurnConfig {
                host: "turn:127.0.0.1:3478".to_owned(),
                secret: "secret".to_owned(),
            },
        ))
    }

    async fn call(engine: &Arc<Engine>, body: Value) -> Value {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::from(Arc::clone(engine)))
                .configure(configure),
        )
        .await;
        let req = actix_test::TestRequest::post().uri("/").set_json(body).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        actix_test::read_body_json(resp).await
    }

    #[actix_web::test]
    async fn publish_then_list() {
        let engine = engine();
        let offer = description_json("offer", "sendrecv");
        let reply = call(
            &engine,
            json!({"id": "1", "method": "publish", "params": ["room", "alice", offer]}),
        )
        .await;
        assert_eq!(reply["id"], "1");
        let track = reply["data"]["track"].as_str().unwrap().to_owned();
        assert!(!track.is_empty());
        assert_eq!(reply["data"]["jsep"]["type"], "answer");
        assert_eq!(reply["data"]["sdp"], reply["data"]["jsep"]["sdp"]);

        let reply = call(&engine, json!({"id": "2", "method": "list", "params": ["room"]})).await;
        let peers = reply["data"]["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["track"], track.as_str());
        assert_eq!(peers[0]["state"], "idle");
    }

    #[actix_web::test]
    async fn errors_are_reported_in_body() {
        let engine = engine();
        let reply = call(
            &engine,
            json!({"id": "1", "method": "publish", "params": ["room", "alice", "garbage"]}),
        )
        .await;
        assert!(reply.get("data").is_none());
        assert_eq!(reply["error"]["status"], 202);
        assert_eq!(reply["error"]["code"], CODE_INVALID_SDP);

        let reply = call(
            &engine,
            json!({"id": "2", "method": "trickle", "params": ["room", "alice", "cid"]}),
        )
        .await;
        assert_eq!(reply["error"]["code"], CODE_INVALID_PARAMS);

        let reply = call(
            &engine,
            json!({"id": "3", "method": "subscribe", "params": ["room", 1, "cid"]}),
        )
        .await;
        assert_eq!(reply["error"]["code"], CODE_INVALID_PARAMS);

        let reply = call(&engine, json!({"id": "4", "method": "shutdown", "params": []})).await;
        assert_eq!(reply["error"]["code"], CODE_INVALID_PARAMS);
    }

    #[actix_web::test]
    async fn stale_session_is_rejected() {
        let engine = engine();
        let offer = description_json("offer", "sendrecv");
        call(
            &engine,
            json!({"id": "1", "method": "publish", "params": ["room", "alice", offer]}),
        )
        .await;
        let reply = call(
            &engine,
            json!({"id": "2", "method": "subscribe", "params": ["room", "alice", "stale"]}),
        )
        .await;
        assert_eq!(reply["error"]["code"], CODE_TRACK_NOT_FOUND);
    }

    #[actix_web::test]
    async fn publish_limit_accepts_string_and_number() {
        let engine = engine();
        let offer = description_json("offer", "sendrecv");
        call(
            &engine,
            json!({"id": "1", "method": "publish", "params": ["room", "alice", offer, 1]}),
        )
        .await;
        let reply = call(
            &engine,
            json!({"id": "2", "method": "publish", "params": ["room", "bob", offer, "1"]}),
        )
        .await;
        assert_eq!(reply["error"]["code"], CODE_ROOM_FULL);

        let reply = call(
            &engine,
            json!({"id": "3", "method": "publish", "params": ["room", "bob", offer, "many"]}),
        )
        .await;
        assert_eq!(reply["error"]["code"], CODE_INVALID_PARAMS);
    }

    #[actix_web::test]
    async fn info_and_turn() {
        let engine = engine();
        let reply = call(&engine, json!({"id": "1", "method": "info", "params": []})).await;
        assert_eq!(reply["data"]["address"], "127.0.0.1");
        assert_eq!(reply["data"]["rooms"], 0);

        let reply = call(&engine, json!({"id": "2", "method": "turn", "params": ["alice"]})).await;
        let servers = reply["data"].as_array().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0]["url"], "turn:127.0.0.1:3478?transport=udp");
    }

    #[actix_web::test]
    async fn malformed_body_and_unknown_route() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::from(engine()))
                .configure(configure),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/")
            .insert_header(("Content-Type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = actix_test::read_body_json(resp).await;
        assert!(body["error"].is_string());

        let req = actix_test::TestRequest::get().uri("/rooms").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"], "not found");
    }

    #[test]
    fn limit_param_forms() {
        assert_eq!(limit_param(&json!(3)).unwrap(), 3);
        assert_eq!(limit_param(&json!("4")).unwrap(), 4);
        assert_eq!(limit_param(&json!(-1)).unwrap(), 0);
        assert!(limit_param(&json!(1.5)).is_err());
        assert!(limit_param(&json!(null)).is_err());
    }
}
