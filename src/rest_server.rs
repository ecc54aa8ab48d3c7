use crate::commands::CommandPublisher;
use crate::dashboard::{DashboardState, SharedDashboard};
use crate::models::{StartJobAction, StopJobAction};
use crate::topics::Hierarchy;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::serde::Serialize;
use rocket::{get, post, routes, State};
use std::sync::PoisonError;
use tracing::error;

/// Everything the routes need: the command side and the live dashboard.
pub struct AppState {
    pub publisher: CommandPublisher,
    pub dashboard: SharedDashboard,
    pub hierarchy: Hierarchy,
}

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

impl ApiResponse {
    fn success(message: &str) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.to_string(),
        })
    }

    fn error(message: &str) -> Json<Self> {
        Json(Self {
            status: "error".to_string(),
            message: message.to_string(),
        })
    }
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct DashboardResponse {
    connected: bool,
    has_alarm: bool,
    hierarchy: Hierarchy,
    #[serde(flatten)]
    state: DashboardState,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

type CommandResult = Result<Json<ApiResponse>, (Status, Json<ApiResponse>)>;

fn require_connection(app: &AppState) -> Result<(), (Status, Json<ApiResponse>)> {
    if app.publisher.is_connected() {
        Ok(())
    } else {
        Err((
            Status::ServiceUnavailable,
            ApiResponse::error("MQTT not connected, cannot send command"),
        ))
    }
}

/// Root handler
#[get("/")]
fn root_handler(app: &State<AppState>) -> Json<ApiResponse> {
    let message = if app.publisher.is_connected() {
        "MQTT connected"
    } else {
        "MQTT not connected"
    };
    ApiResponse::success(message)
}

/// Current dashboard snapshot
#[get("/dashboard")]
fn dashboard(app: &State<AppState>) -> Json<DashboardResponse> {
    let state = app
        .dashboard
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(DashboardResponse {
        connected: app.publisher.is_connected(),
        has_alarm: state.has_alarm(),
        hierarchy: app.hierarchy.clone(),
        state,
    })
}

#[post("/jobs/start", data = "<payload>")]
async fn start_job(payload: Json<StartJobAction>, app: &State<AppState>) -> CommandResult {
    require_connection(app)?;
    app.publisher.start_job(payload.into_inner()).await;
    Ok(ApiResponse::success("Start job command sent"))
}

#[post("/jobs/stop", data = "<payload>")]
async fn stop_job(payload: Json<StopJobAction>, app: &State<AppState>) -> CommandResult {
    require_connection(app)?;
    app.publisher.stop_job(payload.into_inner()).await;
    Ok(ApiResponse::success("Stop job command sent"))
}

fn build(app: AppState) -> rocket::Rocket<rocket::Build> {
    rocket::build()
        .manage(app)
        .mount("/", routes![root_handler, dashboard, start_job, stop_job])
        .attach(Cors)
}

/// Run the Rocket server until it is shut down.
pub async fn run_rest_server(app: AppState) {
    if let Err(e) = build(app).launch().await {
        error!("REST server stopped with error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConsumerOptions};
    use crate::topics::UnsTopics;
    use crate::transport::mock::MockConnector;
    use crate::transport::LinkEvent;
    use rocket::http::ContentType;
    use rocket::local::asynchronous::Client;
    use std::sync::Arc;
    use std::time::Duration;

    async fn client(connected: bool) -> (Client, Arc<MockConnector>, ConnectionManager) {
        let connector = Arc::new(MockConnector::default());
        let manager = ConnectionManager::new(connector.clone(), Duration::ZERO);
        let handle = manager.attach(ConsumerOptions::new()).await.unwrap();
        if connected {
            connector.events().send(LinkEvent::Connected).await.unwrap();
            manager.connectivity().wait_for(|c| *c).await.unwrap();
        }
        let hierarchy = Hierarchy::default();
        let app = AppState {
            publisher: CommandPublisher::new(handle, UnsTopics::new(&hierarchy)),
            dashboard: SharedDashboard::default(),
            hierarchy,
        };
        let client = Client::tracked(build(app)).await.unwrap();
        (client, connector, manager)
    }

    #[tokio::test]
    async fn start_job_is_rejected_while_disconnected() {
        let (client, connector, _manager) = client(false).await;

        let response = client
            .post("/jobs/start")
            .header(ContentType::JSON)
            .body(r#"{"job_id":1,"product_id":2}"#)
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::ServiceUnavailable);
        assert!(connector.link.publishes().is_empty());
    }

    #[tokio::test]
    async fn stop_job_is_published_when_connected() {
        let (client, connector, _manager) = client(true).await;

        let response = client
            .post("/jobs/stop")
            .header(ContentType::JSON)
            .body(r#"{"job_id":9,"reason":"finish"}"#)
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok);
        let publishes = connector.link.publishes();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].1, r#"{"job_id":9,"reason":"finish"}"#);
    }

    #[tokio::test]
    async fn dashboard_reports_connectivity_and_state() {
        let (client, _connector, _manager) = client(true).await;

        let response = client.get("/dashboard").dispatch().await;

        assert_eq!(response.status(), Status::Ok);
        let body: serde_json::Value = response.into_json().await.unwrap();
        assert_eq!(body["connected"], true);
        assert_eq!(body["has_alarm"], false);
        assert_eq!(body["hierarchy"]["device"], "Printer01");
        assert_eq!(body["cycle_time_history"].as_array().map(|a| a.len()), Some(0));
    }
}
