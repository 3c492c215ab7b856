// A service that keeps daily prayer reminders for a device and pushes them
// through Apple Push Notifications service (APNs) when they come due.
use actix_web::{web::Data, App, HttpServer};
use dotenv::dotenv;
use log::{error, info, warn};
use std::{process::exit, sync::Arc};
use tokio::{sync::RwLock, time::Duration};

use prayer_reminder_service::{
    apns::{ApnsSink, LogSink, NotificationSink},
    authtoken::AuthToken,
    config::{Settings, StorageBackend},
    device::DeviceState,
    persistence::{AlarmRepository, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore},
    routes::{self, SnoozeDelay},
    scheduler::TokioScheduler,
    store::AlarmStore,
    types::SharedDevice,
    util::{self, missing_apns_vars},
};

const AUTH_TOKEN_REFRESH_RATE_S: u64 = 60 * 50; // Needs refresh between 20-60 minutes

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            exit(1)
        }
    };
    util::init_logging(&settings.log_config_path);

    let device: SharedDevice = Arc::new(RwLock::new(DeviceState::default()));

    let mut auth_token = None;
    let sink: Arc<dyn NotificationSink> = match &settings.apns {
        Some(apns) => {
            let token = match AuthToken::new(apns.credentials.clone()) {
                Ok(token) => Arc::new(RwLock::new(token)),
                Err(e) => {
                    error!("Could not create APNs auth token: {e}");
                    exit(1)
                }
            };
            info!("Initial auth token: ...{}", util::get_short_token(&token.read().await.token));
            let sink = match ApnsSink::new(apns.host.clone(), apns.topic.clone(), Arc::clone(&token)) {
                Ok(sink) => sink,
                Err(e) => {
                    error!("Could not build APNs client: {e}");
                    exit(1)
                }
            };
            auth_token = Some(token);
            Arc::new(sink)
        }
        None => {
            warn!(
                "Missing APNs environment variables ({}), reminders will only be logged",
                missing_apns_vars().join(" ")
            );
            Arc::new(LogSink)
        }
    };

    let kv: Arc<dyn KeyValueStore> = match settings.storage_backend {
        StorageBackend::File => match FileKeyValueStore::open(&settings.storage_dir).await {
            Ok(kv) => Arc::new(kv),
            Err(e) => {
                error!("Could not open storage at {}: {e}", settings.storage_dir.display());
                exit(1)
            }
        },
        StorageBackend::Memory => {
            warn!("Using in-memory storage, alarms are lost on exit");
            Arc::new(MemoryKeyValueStore::new())
        }
    };

    let scheduler = Arc::new(
        TokioScheduler::new(Arc::clone(&device), sink, settings.max_pending_triggers).with_registry(Arc::clone(&kv)),
    );
    scheduler.restore().await;

    let repository = Arc::new(AlarmRepository::new(kv, settings.namespace.clone()));
    let store = Data::new(AlarmStore::new(scheduler.clone(), repository));
    let alarms = store.reload().await;
    info!("Loaded {} alarm(s)", alarms.len());
    let diagnosis = store.diagnose().await;
    if !diagnosis.is_consistent() {
        warn!("Startup state disagrees with the scheduler: {diagnosis:?}");
    }

    let device_data = Data::new(device);
    let snooze_data = Data::new(SnoozeDelay(Duration::from_secs(settings.snooze_seconds)));

    let refresh_loop_handle = tokio::spawn(auth_token_refresh_loop(auth_token));

    info!("Listening on {}:{}", settings.host, settings.port);
    let server_handle = HttpServer::new(move || {
        App::new()
            .app_data(Data::clone(&store))
            .app_data(Data::clone(&device_data))
            .app_data(Data::clone(&snooze_data))
            .app_data(routes::json_config())
            .configure(routes::configure)
    })
    .bind((settings.host.as_str(), settings.port))?
    .run();

    tokio::select! {
        result = server_handle => result?,
        _ = refresh_loop_handle => {},
    }
    scheduler.shutdown().await;
    Ok(())
}

async fn auth_token_refresh_loop(auth_token: Option<Arc<RwLock<AuthToken>>>) {
    let Some(auth_token) = auth_token else {
        return std::future::pending().await;
    };
    loop {
        tokio::time::sleep(Duration::from_secs(AUTH_TOKEN_REFRESH_RATE_S)).await;
        let result = auth_token.write().await.refresh();
        match result {
            Ok(_) => info!("AuthToken refreshed successfully"),
            Err(e) => error!("AuthToken refresh error {:?}", e),
        }
    }
}
