use actix_web::{
    delete, error, get,
    http::StatusCode,
    post, put,
    web::{self},
    HttpResponse, Responder, ResponseError,
};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio::time::Duration;

use crate::alarm::{time_today, AlarmId, AlarmRecord, SoundBand};
use crate::error::{AlarmError, SchedulingError};
use crate::models::{
    AlarmList, AlarmTimeRequest, EnabledRequest, ErrorResponse, PermissionData, PushTokenData, SnoozeResponse,
};
use crate::store::AlarmStore;
use crate::types::SharedDevice;
use crate::util::get_short_token;

/// How long `POST /snooze` waits before firing.
#[derive(Debug, Clone, Copy)]
pub struct SnoozeDelay(pub Duration);

impl ResponseError for AlarmError {
    fn status_code(&self) -> StatusCode {
        match self {
            AlarmError::Scheduling(SchedulingError::PermissionDenied) => StatusCode::FORBIDDEN,
            AlarmError::Scheduling(SchedulingError::LimitReached { .. }) => StatusCode::CONFLICT,
            AlarmError::Scheduling(SchedulingError::InvalidTime { .. }) | AlarmError::InvalidTime { .. } => {
                StatusCode::BAD_REQUEST
            }
            AlarmError::Scheduling(SchedulingError::Shutdown) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

/// Register every route on an app or a test service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_alarms)
        .service(reload_alarms)
        .service(create_alarm)
        .service(edit_alarm)
        .service(set_enabled)
        .service(delete_alarm)
        .service(snooze)
        .service(diagnostics)
        .service(update_push_token)
        .service(update_permission)
        .service(health);
}

/// Malformed bodies get a 400 with the parser's message.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        warn!("Json config error: {}", err);
        let response = HttpResponse::BadRequest().json(ErrorResponse { error: err.to_string() });
        error::InternalError::from_response(err, response).into()
    })
}

fn requested_time(request: &AlarmTimeRequest) -> Result<DateTime<Local>, AlarmError> {
    time_today(request.hour, request.minute).ok_or(AlarmError::InvalidTime {
        hour: request.hour,
        minute: request.minute,
    })
}

fn not_found(id: &AlarmId) -> HttpResponse {
    debug!("routes:: no alarm {id}");
    HttpResponse::NotFound().json(ErrorResponse {
        error: format!("no alarm with id {id}"),
    })
}

fn alarm_list(alarms: &[AlarmRecord]) -> AlarmList {
    AlarmList {
        alarms: alarms.iter().map(AlarmRecord::snapshot).collect(),
    }
}

#[get("/alarms")]
async fn list_alarms(store: web::Data<AlarmStore>) -> impl Responder {
    HttpResponse::Ok().json(alarm_list(&store.list().await))
}

#[post("/alarms/reload")]
async fn reload_alarms(store: web::Data<AlarmStore>) -> impl Responder {
    HttpResponse::Ok().json(alarm_list(&store.reload().await))
}

#[post("/alarms")]
async fn create_alarm(
    payload: web::Json<AlarmTimeRequest>,
    store: web::Data<AlarmStore>,
) -> Result<HttpResponse, AlarmError> {
    let time = requested_time(&payload)?;
    let alarm = store.create_alarm(time).await?;
    Ok(HttpResponse::Created().json(alarm.snapshot()))
}

#[put("/alarms/{id}")]
async fn edit_alarm(
    id: web::Path<String>,
    payload: web::Json<AlarmTimeRequest>,
    store: web::Data<AlarmStore>,
) -> Result<HttpResponse, AlarmError> {
    let id = AlarmId::from(id.into_inner());
    let time = requested_time(&payload)?;
    match store.reschedule_alarm(&id, time).await? {
        Some(alarm) => Ok(HttpResponse::Ok().json(alarm.snapshot())),
        None => Ok(not_found(&id)),
    }
}

#[post("/alarms/{id}/enabled")]
async fn set_enabled(
    id: web::Path<String>,
    payload: web::Json<EnabledRequest>,
    store: web::Data<AlarmStore>,
) -> Result<HttpResponse, AlarmError> {
    let id = AlarmId::from(id.into_inner());
    match store.set_enabled(&id, payload.enabled).await? {
        Some(alarm) => Ok(HttpResponse::Ok().json(alarm.snapshot())),
        None => Ok(not_found(&id)),
    }
}

#[delete("/alarms/{id}")]
async fn delete_alarm(id: web::Path<String>, store: web::Data<AlarmStore>) -> Result<HttpResponse, AlarmError> {
    let id = AlarmId::from(id.into_inner());
    if store.remove_alarm(&id).await? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Ok(not_found(&id))
    }
}

#[post("/snooze")]
async fn snooze(store: web::Data<AlarmStore>, delay: web::Data<SnoozeDelay>) -> Result<HttpResponse, AlarmError> {
    let trigger_id = store.scheduler().schedule_once(delay.0, SoundBand::Morning).await?;
    info!("routes:: snoozing for {:?} with trigger {trigger_id}", delay.0);
    Ok(HttpResponse::Ok().json(SnoozeResponse {
        trigger_id,
        fires_in_seconds: delay.0.as_secs(),
    }))
}

#[get("/diagnostics")]
async fn diagnostics(store: web::Data<AlarmStore>) -> impl Responder {
    HttpResponse::Ok().json(store.diagnose().await)
}

#[post("/device/pushtoken")]
async fn update_push_token(payload: web::Json<PushTokenData>, device: web::Data<SharedDevice>) -> impl Responder {
    device.write().await.register_push_token(payload.push_token.clone());
    debug!("push_token:: Updated push_token...{}", get_short_token(&payload.push_token));
    HttpResponse::Ok()
}

#[post("/device/permission")]
async fn update_permission(payload: web::Json<PermissionData>, device: web::Data<SharedDevice>) -> impl Responder {
    device.write().await.set_permission(payload.permission);
    info!("device:: notification permission is now {:?}", payload.permission);
    HttpResponse::Ok()
}

#[get("/health")]
pub async fn health() -> impl Responder {
    info!("Health check");
    HttpResponse::Ok()
}
