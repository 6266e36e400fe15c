use axum::Json;

#[derive(serde::Serialize)]
pub struct Healthz {
	status: &'static str,
	version: &'static str,
}

pub async fn healthz() -> Json<Healthz> {
	Json(Healthz {
		status: "ok",
		version: env!("CARGO_PKG_VERSION"),
	})
}
