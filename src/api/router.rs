//! Route table. Handlers read shared state through `State<ApiContext>`;
//! the auth middleware reads the same context through `Extension`, which
//! is layered outermost for that reason.
//!
//! Path params use `:param` syntax (matchit 0.7 / axum 0.7).

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints::{admin, auth, booking, leave, notifications, patient};
use crate::api::middleware;
use crate::api::types::ApiContext;

pub fn api_router(ctx: ApiContext) -> Router {
    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .with_state(ctx.clone());

    let protected = Router::new()
        // Patient
        .route("/appointments", get(patient::my_appointments))
        .route(
            "/appointments/book/service/:id",
            post(booking::book_service),
        )
        .route(
            "/appointments/book/product/:id",
            post(booking::book_product),
        )
        .route(
            "/appointments/book/package/:id",
            post(booking::book_package),
        )
        .route(
            "/appointments/:id/request-cancellation",
            post(patient::request_cancellation),
        )
        .route(
            "/appointments/:id/request-reschedule",
            post(patient::request_reschedule),
        )
        .route(
            "/appointments/:id/resolve-unavailability",
            post(patient::resolve_unavailability),
        )
        .route("/appointments/:id/feedback", post(patient::submit_feedback))
        .route("/unavailability", get(patient::pending_unavailability))
        // Staff / owner desk
        .route("/admin/appointments/:id/confirm", post(admin::confirm))
        .route("/admin/appointments/:id/complete", post(admin::complete))
        .route("/admin/appointments/:id/cancel", post(admin::cancel))
        .route(
            "/admin/cancellation-requests",
            get(admin::list_cancellation_requests),
        )
        .route(
            "/admin/cancellation-requests/:id/approve",
            post(admin::approve_cancellation),
        )
        .route(
            "/admin/cancellation-requests/:id/reject",
            post(admin::reject_cancellation),
        )
        .route(
            "/admin/reschedule-requests",
            get(admin::list_reschedule_requests),
        )
        .route(
            "/admin/reschedule-requests/:id/approve",
            post(admin::approve_reschedule),
        )
        .route(
            "/admin/reschedule-requests/:id/reject",
            post(admin::reject_reschedule),
        )
        .route("/admin/closed-days", post(admin::add_closed_day))
        .route("/admin/closed-days/:date", delete(admin::remove_closed_day))
        .route("/admin/history", get(admin::history_feed))
        .route("/admin/sms-messages", get(admin::sms_log))
        // Attendant
        .route(
            "/attendant/leave",
            post(leave::request_leave).get(leave::my_leave),
        )
        // Owner
        .route("/owner/leave-requests", get(leave::pending_leave))
        .route(
            "/owner/leave-requests/:id/approve",
            post(leave::approve_leave),
        )
        .route(
            "/owner/leave-requests/:id/reject",
            post(leave::reject_leave),
        )
        // Any authenticated role
        .route("/notifications", get(notifications::feed))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::auth::require_auth))
        // Extension must be outermost so the middleware can extract ApiContext
        .layer(axum::Extension(ctx));

    Router::new()
        .nest("/api", public)
        .nest("/api", protected)
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::appointment::testutil::{fixture, Fixture};
    use crate::db::open_memory_database;
    use crate::sms::provider::SmsTransport;

    fn test_app() -> (Router, Fixture, ApiContext) {
        let mut conn = open_memory_database().unwrap();
        let fx = fixture(&mut conn);
        let ctx = ApiContext::new(conn, fx.clock.clone(), SmsTransport::recording());
        (api_router(ctx.clone()), fx, ctx)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn response_json(response: axum::http::Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router, username: &str) -> String {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({ "username": username })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn book_tuesday_service(app: &Router, fx: &Fixture, token: &str) -> String {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/appointments/book/service/{}", fx.service_id),
                Some(token),
                Some(json!({
                    "attendant_id": fx.attendant.id,
                    "date": "2026-06-02",
                    "time": "10:00",
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response_json(response).await["appointment"]["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn unknown_username_cannot_log_in() {
        let (app, _fx, _ctx) = test_app();

        let response = app
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({ "username": "nobody" })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn routes_require_a_bearer_token() {
        let (app, _fx, _ctx) = test_app();

        let response = app
            .oneshot(request("GET", "/api/notifications", None, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn patient_books_a_service() {
        let (app, fx, _ctx) = test_app();
        let token = login(&app, "maria.santos").await;

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/appointments/book/service/{}", fx.service_id),
                Some(&token),
                Some(json!({
                    "attendant_id": fx.attendant.id,
                    "date": "2026-06-02",
                    "time": "10:00",
                })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        assert_eq!(json["appointment"]["status"], "pending");
        assert_eq!(json["appointment"]["patient_id"], fx.patient.id.as_str());

        // The booking shows up in the patient's own list.
        let response = app
            .oneshot(request("GET", "/api/appointments", Some(&token), None))
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["appointments"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn past_booking_is_rejected_with_code() {
        let (app, fx, _ctx) = test_app();
        let token = login(&app, "maria.santos").await;

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/appointments/book/service/{}", fx.service_id),
                Some(&token),
                Some(json!({
                    "attendant_id": fx.attendant.id,
                    "date": "2026-05-30",
                    "time": "10:00",
                })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "rejected");
    }

    #[tokio::test]
    async fn patient_cannot_reach_the_admin_desk() {
        let (app, fx, _ctx) = test_app();
        let token = login(&app, "maria.santos").await;
        let appointment_id = book_tuesday_service(&app, &fx, &token).await;

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/admin/appointments/{appointment_id}/confirm"),
                Some(&token),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "forbidden");
    }

    #[tokio::test]
    async fn lifecycle_confirm_complete_feedback() {
        let (app, fx, _ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        let staff = login(&app, "staff").await;
        let appointment_id = book_tuesday_service(&app, &fx, &patient).await;

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/admin/appointments/{appointment_id}/confirm"),
                Some(&staff),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["appointment"]["status"], "confirmed");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/admin/appointments/{appointment_id}/complete"),
                Some(&staff),
                Some(json!({ "treatment": { "notes": "smooth session" } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/appointments/{appointment_id}/feedback"),
                Some(&patient),
                Some(json!({ "service_rating": 5, "attendant_rating": 4 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second submission is refused.
        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/appointments/{appointment_id}/feedback"),
                Some(&patient),
                Some(json!({ "service_rating": 3 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "validation");
    }

    #[tokio::test]
    async fn confirming_twice_is_an_invalid_state() {
        let (app, fx, _ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        let staff = login(&app, "staff").await;
        let appointment_id = book_tuesday_service(&app, &fx, &patient).await;

        let uri = format!("/api/admin/appointments/{appointment_id}/confirm");
        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some(&staff), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("POST", &uri, Some(&staff), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn notification_feed_and_mark_read_are_idempotent() {
        let (app, fx, _ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        book_tuesday_service(&app, &fx, &patient).await;

        let response = app
            .clone()
            .oneshot(request("GET", "/api/notifications", Some(&patient), None))
            .await
            .unwrap();
        let json = response_json(response).await;
        assert!(json["unread_count"].as_i64().unwrap() >= 1);
        let id = json["notifications"][0]["id"].as_str().unwrap().to_string();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(
                    "POST",
                    &format!("/api/notifications/{id}/read"),
                    Some(&patient),
                    None,
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(request(
                "POST",
                "/api/notifications/read-all",
                Some(&patient),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn leave_approval_fans_out_to_booked_patients() {
        let (app, fx, _ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        let attendant = login(&app, "ana.reyes").await;
        let owner = login(&app, "owner").await;
        book_tuesday_service(&app, &fx, &patient).await;

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/attendant/leave",
                Some(&attendant),
                Some(json!({ "leave_date": "2026-06-02", "reason": "family matter" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response_json(response).await["request"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/owner/leave-requests/{request_id}/approve"),
                Some(&owner),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["patients_notified"], 1);

        // The patient now has a pending unavailability notice to resolve.
        let response = app
            .clone()
            .oneshot(request("GET", "/api/unavailability", Some(&patient), None))
            .await
            .unwrap();
        let json = response_json(response).await;
        let notices = json["unavailability"].as_array().unwrap();
        assert_eq!(notices.len(), 1);
        let appointment_id = notices[0]["appointment_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/appointments/{appointment_id}/resolve-unavailability"),
                Some(&patient),
                Some(json!({ "choice": "choose_another" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["unavailability"]["status"], "resolved");
    }

    #[tokio::test]
    async fn cancel_requires_a_reason() {
        let (app, fx, _ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        let staff = login(&app, "staff").await;
        let appointment_id = book_tuesday_service(&app, &fx, &patient).await;

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/admin/appointments/{appointment_id}/cancel"),
                Some(&staff),
                Some(json!({ "reason": "  " })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "validation");
    }

    #[tokio::test]
    async fn booking_dispatches_confirmation_sms() {
        let (app, fx, ctx) = test_app();
        let patient = login(&app, "maria.santos").await;
        book_tuesday_service(&app, &fx, &patient).await;

        // Patient confirmation + attendant assignment, both normalized.
        let recorded = ctx.transport.recorded();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|(phone, _)| phone.starts_with("639")));

        let conn = ctx.db.lock().unwrap();
        let sent = crate::sms::list_messages(&conn, 10).unwrap();
        assert_eq!(sent.len(), 2);
    }
}
